//! Video4Linux2 capture backend.
//!
//! Appliance-tuned, no knobs: 2 mmap kernel buffers, 5 ms poll timeout
//! with a 1 s aggregate deadline that probes for unplug, a single capture
//! thread at SCHED_FIFO priority 90 pinned to core 3, and locked memory.
//! YUYV sources are declared to the callback without conversion (the NDI
//! layer repacks to UYVY inline); everything else is converted to BGRA
//! into a buffer allocated once at start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use v4l::buffer::{Flags as BufFlags, Type};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use bridge_convert::{ColorInfo, PixelFormat};

use crate::backend::{CaptureDevice, ErrorCallback, FrameCallback};
use crate::frame::{monotonic_ns, CaptureStats, DeviceInfo, Frame, StatsSnapshot, VideoFormat};
use crate::CaptureError;

const BUFFER_COUNT: u32 = 2;
const POLL_TIMEOUT: Duration = Duration::from_millis(5);
/// Poll timeouts before probing the device for unplug (~1 s).
const PROBE_AFTER_TIMEOUTS: u32 = 200;
const REALTIME_PRIORITY: i32 = 90;
const PINNED_CORE: usize = 3;

/// Preference order for NDI throughput: zero-copy YUYV first, MJPEG as
/// the last resort (it is never decoded, only declared).
const FORMAT_PRIORITY: [&[u8; 4]; 6] = [b"YUYV", b"UYVY", b"NV12", b"RGB3", b"BGR3", b"MJPG"];
const RESOLUTION_PRIORITY: [(u32, u32); 3] = [(1920, 1080), (1280, 720), (640, 480)];
const FPS_PRIORITY: [u32; 2] = [60, 30];

struct Shared {
    stats: CaptureStats,
    capturing: AtomicBool,
    should_stop: AtomicBool,
    has_error: AtomicBool,
    last_error: Mutex<Option<String>>,
    frame_cb: Mutex<Option<FrameCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
}

impl Shared {
    fn set_error(&self, message: &str) {
        tracing::error!("v4l2: {message}");
        *self.last_error.lock().unwrap() = Some(message.to_string());
        self.has_error.store(true, Ordering::Release);
        if let Some(cb) = self.error_cb.lock().unwrap().clone() {
            cb(message);
        }
    }
}

pub struct V4l2Capture {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl V4l2Capture {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                stats: CaptureStats::default(),
                capturing: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
                has_error: AtomicBool::new(false),
                last_error: Mutex::new(None),
                frame_cb: Mutex::new(None),
                error_cb: Mutex::new(None),
            }),
            thread: None,
        }
    }

    fn resolve_device(&self, selector: &str) -> Result<(String, String), CaptureError> {
        let devices = self.enumerate_devices();
        if selector.is_empty() {
            let first = devices.first().ok_or(CaptureError::NoDevices)?;
            return Ok((first.id.clone(), first.name.clone()));
        }
        if selector.starts_with("/dev/") {
            let name = devices
                .iter()
                .find(|d| d.id == selector)
                .map_or_else(|| selector.to_string(), |d| d.name.clone());
            return Ok((selector.to_string(), name));
        }
        devices
            .iter()
            .find(|d| d.matches(selector))
            .map(|d| (d.id.clone(), d.name.clone()))
            .ok_or_else(|| CaptureError::DeviceNotFound(selector.to_string()))
    }
}

impl Default for V4l2Capture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for V4l2Capture {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

impl CaptureDevice for V4l2Capture {
    fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        for node in v4l::context::enum_devices() {
            let path = node.path().to_string_lossy().into_owned();
            let Ok(dev) = Device::with_path(node.path()) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            let supports_capture = caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE);
            let supports_streaming =
                caps.capabilities.contains(v4l::capability::Flags::STREAMING);
            if !supports_capture || !supports_streaming {
                continue;
            }
            devices.push(DeviceInfo {
                id: path,
                name: format!("{} ({})", caps.card, caps.bus),
                serial: None,
                supports_capture,
                supports_streaming,
            });
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::info!("v4l2: found {} capture devices", devices.len());
        devices
    }

    fn start_capture(&mut self, selector: &str) -> Result<(), CaptureError> {
        if self.shared.capturing.load(Ordering::Acquire) {
            return Err(CaptureError::AlreadyRunning);
        }

        let (path, name) = self.resolve_device(selector)?;
        tracing::info!("v4l2: starting capture on {path} ({name})");

        let device = Device::with_path(&path)?;
        let caps = device.query_caps()?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE | v4l::capability::Flags::STREAMING)
        {
            return Err(CaptureError::NotACaptureDevice(path));
        }

        let format = negotiate_format(&device, &path)?;
        tracing::info!(
            "v4l2: negotiated {}x{} {} @ {}/{} fps (stride {})",
            format.width,
            format.height,
            format.pixel_format,
            format.fps_num,
            format.fps_den,
            format.stride,
        );

        self.shared.stats.reset();
        self.shared.has_error.store(false, Ordering::Release);
        self.shared.should_stop.store(false, Ordering::Release);
        *self.shared.last_error.lock().unwrap() = None;

        let shared = Arc::clone(&self.shared);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let thread = std::thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn(move || capture_thread(device, format, shared, &ready_tx))
            .map_err(CaptureError::Io)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.shared.capturing.store(true, Ordering::Release);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(CaptureError::Device(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::Device("capture thread died during setup".into()))
            }
        }
    }

    fn stop_capture(&mut self) {
        self.shared.should_stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.shared.capturing.store(false, Ordering::Release);

        let snap = self.shared.stats.snapshot();
        if snap.captured > 0 {
            tracing::info!(
                "v4l2: stopped after {} frames, avg latency {:.2} ms, dropped {}, zero-copy {}",
                snap.captured,
                snap.avg_latency_ms(),
                snap.dropped,
                snap.zero_copy,
            );
        }
    }

    fn set_frame_callback(&mut self, callback: FrameCallback) {
        *self.shared.frame_cb.lock().unwrap() = Some(callback);
    }

    fn set_error_callback(&mut self, callback: ErrorCallback) {
        *self.shared.error_cb.lock().unwrap() = Some(callback);
    }

    fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::Acquire)
    }

    fn has_error(&self) -> bool {
        self.shared.has_error.load(Ordering::Acquire)
    }

    fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap().clone()
    }

    fn statistics(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

/// One enumerated `{fourcc, size, max fps}` triple.
struct Candidate {
    fourcc: FourCC,
    width: u32,
    height: u32,
    max_fps: u32,
}

fn enumerate_candidates(device: &Device) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let Ok(descriptions) = device.enum_formats() else {
        return candidates;
    };
    for desc in descriptions {
        let Ok(sizes) = device.enum_framesizes(desc.fourcc) else {
            continue;
        };
        for size in sizes {
            for discrete in size.size.to_discrete() {
                let max_fps = device
                    .enum_frameintervals(desc.fourcc, discrete.width, discrete.height)
                    .map(|intervals| {
                        intervals
                            .iter()
                            .filter_map(|fi| match &fi.interval {
                                v4l::frameinterval::FrameIntervalEnum::Discrete(frac)
                                    if frac.numerator > 0 =>
                                {
                                    Some(frac.denominator / frac.numerator)
                                }
                                _ => None,
                            })
                            .max()
                            .unwrap_or(30)
                    })
                    .unwrap_or(30);
                candidates.push(Candidate {
                    fourcc: desc.fourcc,
                    width: discrete.width,
                    height: discrete.height,
                    max_fps,
                });
            }
        }
    }
    candidates
}

fn negotiate_format(device: &Device, path: &str) -> Result<VideoFormat, CaptureError> {
    let candidates = enumerate_candidates(device);
    if candidates.is_empty() {
        return Err(CaptureError::NoUsableFormat(path.to_string()));
    }
    tracing::debug!("v4l2: {} format candidates on {path}", candidates.len());

    let Some(pick) = FORMAT_PRIORITY
        .iter()
        .flat_map(|fourcc| {
            RESOLUTION_PRIORITY.iter().filter_map(move |&(w, h)| {
                candidates
                    .iter()
                    .find(|c| &c.fourcc.repr == *fourcc && c.width == w && c.height == h)
            })
        })
        .next()
        .or_else(|| candidates.first())
    else {
        return Err(CaptureError::NoUsableFormat(path.to_string()));
    };

    let requested = Format::new(pick.width, pick.height, pick.fourcc);
    let actual = device.set_format(&requested)?;

    // Ask for 60 fps, settle for 30, keep whatever the driver reports.
    for fps in FPS_PRIORITY {
        if fps > pick.max_fps {
            continue;
        }
        if device
            .set_params(&v4l::video::capture::Parameters::with_fps(fps))
            .is_ok()
        {
            break;
        }
    }

    let (fps_num, fps_den) = match device.params() {
        Ok(params) if params.interval.numerator > 0 => {
            (params.interval.denominator, params.interval.numerator)
        }
        _ => (30, 1),
    };

    let mut format = VideoFormat::new(
        actual.width,
        actual.height,
        actual.stride,
        PixelFormat::from_v4l2_fourcc(u32::from_le_bytes(actual.fourcc.repr)),
    );
    if format.stride == 0 {
        format.stride = actual.width * format.pixel_format.bytes_per_pixel().max(1) as u32;
    }
    format.fps_num = fps_num;
    format.fps_den = fps_den;
    format.color = ColorInfo::detect(format.width, format.height);
    Ok(format)
}

fn capture_thread(
    device: Device,
    format: VideoFormat,
    shared: Arc<Shared>,
    ready: &mpsc::Sender<Result<(), String>>,
) {
    let mut stream = match Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(format!("failed to start streaming: {e}")));
            return;
        }
    };
    stream.set_timeout(POLL_TIMEOUT);
    let _ = ready.send(Ok(()));

    apply_realtime_settings();
    tracing::info!("v4l2: capture thread streaming");

    let raw_fourcc = device
        .format()
        .map(|f| f.fourcc.repr)
        .unwrap_or(*b"    ");
    let is_bgr3 = &raw_fourcc == b"BGR3";
    let needs_conversion = !matches!(format.pixel_format, PixelFormat::Yuyv) || is_bgr3;

    // Staging buffer for converted output, sized once: the negotiated
    // frame, or full 1080p if the device might renegotiate larger.
    let bgra_capacity =
        bridge_convert::bgra_size(format.width, format.height).max(1920 * 1080 * 4);
    let mut bgra = vec![0u8; bgra_capacity];
    let mut bgra_format = format;
    bgra_format.pixel_format = PixelFormat::Bgra;
    bgra_format.stride = format.width * 4;

    let mut timeouts: u32 = 0;
    let mut zero_copy_logged = false;

    while !shared.should_stop.load(Ordering::Acquire) {
        let dequeued_at = Instant::now();
        let (data, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                timeouts += 1;
                if timeouts > PROBE_AFTER_TIMEOUTS {
                    if device.query_caps().is_err() {
                        shared.set_error("device disconnected or not responding");
                        break;
                    }
                    timeouts = 0;
                }
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                shared.set_error("device disconnected");
                break;
            }
            Err(e) => {
                shared.set_error(&format!("capture error: {e}"));
                break;
            }
        };
        timeouts = 0;

        let used = (meta.bytesused as usize).min(data.len());
        if used == 0 {
            continue;
        }
        let payload = &data[..used];

        let timestamp_ns = if meta.flags.contains(BufFlags::TIMESTAMP_MONOTONIC) {
            meta.timestamp.sec * 1_000_000_000 + meta.timestamp.usec * 1_000
        } else {
            monotonic_ns()
        };

        let callback = shared.frame_cb.lock().unwrap().clone();
        let Some(callback) = callback else {
            continue;
        };

        if !needs_conversion {
            // YUYV goes straight through; the NDI sender repacks inline.
            if !zero_copy_logged {
                tracing::info!("v4l2: zero-copy path active for YUYV");
                zero_copy_logged = true;
            }
            callback(&Frame {
                data: payload,
                timestamp_ns,
                format: &format,
            });
            shared.stats.record_frame(dequeued_at, true);
        } else if is_bgr3 {
            let pixels = (format.width * format.height) as usize;
            if payload.len() >= pixels * 3 {
                bgr24_to_bgra(payload, pixels, &mut bgra);
                callback(&Frame {
                    data: &bgra[..pixels * 4],
                    timestamp_ns,
                    format: &bgra_format,
                });
                shared.stats.record_frame(dequeued_at, false);
            } else {
                shared.stats.record_drop();
            }
        } else if format.pixel_format.is_convertible() {
            match bridge_convert::convert_to_bgra(
                payload,
                format.width,
                format.height,
                format.stride,
                format.pixel_format,
                format.color,
                &mut bgra,
            ) {
                Ok(()) => {
                    let len = bridge_convert::bgra_size(format.width, format.height);
                    callback(&Frame {
                        data: &bgra[..len],
                        timestamp_ns,
                        format: &bgra_format,
                    });
                    shared.stats.record_frame(dequeued_at, false);
                }
                Err(e) => {
                    tracing::warn!("v4l2: conversion failed: {e}");
                    shared.stats.record_drop();
                }
            }
        } else {
            // MJPEG and friends pass through; downstream decides.
            callback(&Frame {
                data: payload,
                timestamp_ns,
                format: &format,
            });
            shared.stats.record_frame(dequeued_at, false);
        }
    }

    tracing::info!("v4l2: capture thread exiting");
}

/// BGR24 to BGRA is an alpha insertion: source bytes are already B,G,R.
fn bgr24_to_bgra(src: &[u8], pixels: usize, dst: &mut [u8]) {
    for i in 0..pixels {
        dst[i * 4] = src[i * 3];
        dst[i * 4 + 1] = src[i * 3 + 1];
        dst[i * 4 + 2] = src[i * 3 + 2];
        dst[i * 4 + 3] = 255;
    }
}

/// SCHED_FIFO 90, pin to core 3, lock memory. All best-effort: the
/// appliance image grants CAP_SYS_NICE and CAP_IPC_LOCK, dev machines
/// usually do not.
fn apply_realtime_settings() {
    // SAFETY: plain syscall with a stack-local param struct.
    let rc = unsafe {
        let param = libc::sched_param {
            sched_priority: REALTIME_PRIORITY,
        };
        libc::sched_setscheduler(0, libc::SCHED_FIFO, &param)
    };
    if rc == 0 {
        tracing::info!("v4l2: SCHED_FIFO priority {REALTIME_PRIORITY} enabled");
    } else {
        tracing::warn!("v4l2: no real-time priority (needs CAP_SYS_NICE)");
    }

    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    if cores > PINNED_CORE {
        let mut set = nix::sched::CpuSet::new();
        if set.set(PINNED_CORE).is_ok()
            && nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set).is_ok()
        {
            tracing::info!("v4l2: capture thread pinned to core {PINNED_CORE}");
        } else {
            tracing::debug!("v4l2: could not set CPU affinity");
        }
    }

    // SAFETY: locks this process's pages; no pointers involved.
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        tracing::debug!("v4l2: mlockall unavailable (needs CAP_IPC_LOCK)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr24_inserts_alpha() {
        let src = [1u8, 2, 3, 4, 5, 6];
        let mut dst = [0u8; 8];
        bgr24_to_bgra(&src, 2, &mut dst);
        assert_eq!(dst, [1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn s1_yuyv_1080p_shape() {
        // The format a YUYV 1080p60 negotiation must produce.
        let mut format = VideoFormat::new(1920, 1080, 3840, PixelFormat::Yuyv);
        format.fps_num = 60;
        format.fps_den = 1;
        assert!(format.is_valid());
        assert_eq!(format.stride, 3840);
        assert_eq!(format.frame_size(), 4_147_200);
    }

    #[test]
    fn backend_starts_idle() {
        let capture = V4l2Capture::new();
        assert!(!capture.is_capturing());
        assert!(!capture.has_error());
        assert_eq!(capture.statistics(), StatsSnapshot::default());
    }

    #[test]
    fn missing_device_is_reported() {
        let mut capture = V4l2Capture::new();
        let err = capture.start_capture("no-such-capture-card");
        assert!(matches!(
            err,
            Err(CaptureError::DeviceNotFound(_) | CaptureError::NoDevices)
        ));
    }

    #[test]
    fn stop_without_start_is_idempotent() {
        let mut capture = V4l2Capture::new();
        capture.stop_capture();
        capture.stop_capture();
        assert!(!capture.is_capturing());
    }
}
