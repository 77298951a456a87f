//! Media Foundation capture backend (Windows).
//!
//! A source reader on the first video stream, UYVY output negotiated when
//! the driver allows it. Recoverable device errors (invalidated, locked,
//! HW MFT failed to start, no more types) tear the whole stack down and
//! rebuild it with a capped linear backoff; the device list is
//! re-enumerated and the friendly name re-resolved each attempt, because
//! a replug hands out a fresh activation object even for an unchanged
//! name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use windows::core::{Interface, GUID};
use windows::Win32::Foundation::E_NOINTERFACE;
use windows::Win32::Media::MediaFoundation::{
    IMFActivate, IMFMediaSource, IMFMediaType, IMFSourceReader, MFCreateAttributes,
    MFCreateMediaType, MFCreateSourceReaderFromMediaSource, MFEnumDeviceSources, MFShutdown,
    MFStartup, MFVideoFormat_NV12, MFVideoFormat_UYVY, MFVideoFormat_YUY2, MFMediaType_Video,
    MFSTARTUP_NOSOCKET, MF_API_VERSION, MF_DEVSOURCE_ATTRIBUTE_FRIENDLY_NAME,
    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE, MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_GUID,
    MF_E_DEVICE_INVALIDATED, MF_E_HW_MFT_FAILED_START_STREAMING, MF_E_NO_MORE_TYPES,
    MF_E_VIDEO_RECORDING_DEVICE_LOCKED, MF_MT_FRAME_RATE, MF_MT_FRAME_SIZE,
    MF_MT_INTERLACE_MODE, MF_MT_MAJOR_TYPE, MF_MT_SUBTYPE, MF_SDK_VERSION,
    MF_SOURCE_READERF_ENDOFSTREAM, MF_SOURCE_READER_ALL_STREAMS,
    MF_SOURCE_READER_FIRST_VIDEO_STREAM, MFVideoInterlace_Progressive,
};
use windows::Win32::System::Com::{CoInitializeEx, CoTaskMemFree, CoUninitialize,
    COINIT_MULTITHREADED};

use bridge_convert::{ColorInfo, PixelFormat};

use crate::backend::{CaptureDevice, ErrorCallback, FrameCallback};
use crate::backoff::RetryBackoff;
use crate::frame::{monotonic_ns, CaptureStats, DeviceInfo, Frame, StatsSnapshot, VideoFormat};
use crate::CaptureError;

const MF_VERSION: u32 = ((MF_SDK_VERSION as u32) << 16) | MF_API_VERSION as u32;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_STEP: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Recoverable device errors per the taxonomy observed in the field.
fn is_device_error(hr: windows::core::HRESULT) -> bool {
    hr == MF_E_DEVICE_INVALIDATED
        || hr == E_NOINTERFACE
        || hr == MF_E_HW_MFT_FAILED_START_STREAMING
        || hr == MF_E_VIDEO_RECORDING_DEVICE_LOCKED
        || hr == MF_E_NO_MORE_TYPES
}

/// Some failures leave the framework itself wedged and need MFShutdown +
/// MFStartup before the next attempt.
fn requires_framework_reinit(hr: windows::core::HRESULT) -> bool {
    hr == MF_E_VIDEO_RECORDING_DEVICE_LOCKED || hr == MF_E_HW_MFT_FAILED_START_STREAMING
}

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
        tracing::error!("mf: {message}");
        *self.last_error.lock().unwrap() = Some(message.to_string());
        self.has_error.store(true, Ordering::Release);
        if let Some(cb) = self.error_cb.lock().unwrap().clone() {
            cb(message);
        }
    }
}

pub struct MfCapture {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MfCapture {
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
}

impl Default for MfCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MfCapture {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

/// COM + Media Foundation lifetime scoped to the capture thread.
struct MfSession {
    com_ok: bool,
    mf_ok: bool,
}

impl MfSession {
    fn start() -> Self {
        // SAFETY: standard COM/MF bring-up on a fresh thread.
        unsafe {
            let com_ok = CoInitializeEx(None, COINIT_MULTITHREADED).is_ok();
            let mf_ok = MFStartup(MF_VERSION, MFSTARTUP_NOSOCKET).is_ok();
            Self { com_ok, mf_ok }
        }
    }

    fn reinit_framework(&mut self) {
        // SAFETY: shutdown/startup pair on the owning thread.
        unsafe {
            if self.mf_ok {
                let _ = MFShutdown();
            }
            self.mf_ok = MFStartup(MF_VERSION, MFSTARTUP_NOSOCKET).is_ok();
        }
    }
}

impl Drop for MfSession {
    fn drop(&mut self) {
        // SAFETY: mirrors start(), on the same thread.
        unsafe {
            if self.mf_ok {
                let _ = MFShutdown();
            }
            if self.com_ok {
                CoUninitialize();
            }
        }
    }
}

fn enumerate_activates() -> windows::core::Result<Vec<(IMFActivate, String)>> {
    let mut devices = Vec::new();
    // SAFETY: documented MFEnumDeviceSources calling convention; the
    // returned array is released element-wise then freed as a block.
    unsafe {
        let mut attributes = None;
        MFCreateAttributes(&mut attributes, 1)?;
        let attributes = attributes.expect("MFCreateAttributes succeeded");
        attributes.SetGUID(
            &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
            &MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_GUID,
        )?;

        let mut activates: *mut Option<IMFActivate> = std::ptr::null_mut();
        let mut count = 0u32;
        MFEnumDeviceSources(&attributes, &mut activates, &mut count)?;

        for i in 0..count as usize {
            let Some(activate) = (*activates.add(i)).take() else {
                continue;
            };
            let mut name_ptr = windows::core::PWSTR::null();
            let mut name_len = 0u32;
            let name = if activate
                .GetAllocatedString(
                    &MF_DEVSOURCE_ATTRIBUTE_FRIENDLY_NAME,
                    &mut name_ptr,
                    &mut name_len,
                )
                .is_ok()
            {
                let name = name_ptr.to_string().unwrap_or_default();
                CoTaskMemFree(Some(name_ptr.as_ptr().cast()));
                name
            } else {
                format!("Video capture device {i}")
            };
            devices.push((activate, name));
        }
        CoTaskMemFree(Some(activates.cast()));
    }
    Ok(devices)
}

impl CaptureDevice for MfCapture {
    fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        let _session = MfSession::start();
        match enumerate_activates() {
            Ok(devices) => devices
                .into_iter()
                .map(|(_, name)| DeviceInfo {
                    id: name.clone(),
                    name,
                    serial: None,
                    supports_capture: true,
                    supports_streaming: true,
                })
                .collect(),
            Err(e) => {
                tracing::error!("mf: device enumeration failed: {e}");
                Vec::new()
            }
        }
    }

    fn start_capture(&mut self, selector: &str) -> Result<(), CaptureError> {
        if self.shared.capturing.load(Ordering::Acquire) {
            return Err(CaptureError::AlreadyRunning);
        }

        self.shared.stats.reset();
        self.shared.has_error.store(false, Ordering::Release);
        self.shared.should_stop.store(false, Ordering::Release);
        *self.shared.last_error.lock().unwrap() = None;

        let shared = Arc::clone(&self.shared);
        let selector = selector.to_string();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();
        let thread = std::thread::Builder::new()
            .name("mf-capture".into())
            .spawn(move || capture_thread(&selector, &shared, &ready_tx))
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

struct NegotiatedReader {
    reader: IMFSourceReader,
    format: VideoFormat,
    subtype: GUID,
}

fn open_reader(selector: &str) -> Result<NegotiatedReader, String> {
    let devices = enumerate_activates().map_err(|e| format!("enumeration failed: {e}"))?;
    if devices.is_empty() {
        return Err("no video capture devices found".into());
    }

    let (activate, name) = if selector.is_empty() {
        devices.into_iter().next().expect("checked non-empty")
    } else {
        let lowered = selector.to_lowercase();
        devices
            .into_iter()
            .find(|(_, name)| name.to_lowercase().contains(&lowered))
            .ok_or_else(|| format!("device not found: {selector}"))?
    };
    tracing::info!("mf: opening '{name}'");

    // SAFETY: source reader construction and media type negotiation follow
    // the documented call sequence; every interface is reference counted.
    unsafe {
        let source: IMFMediaSource = activate
            .ActivateObject()
            .map_err(|e| format!("ActivateObject failed: {e}"))?;
        let reader = MFCreateSourceReaderFromMediaSource(&source, None)
            .map_err(|e| format!("source reader creation failed: {e}"))?;

        // Only the first video stream is read.
        let _ = reader.SetStreamSelection(MF_SOURCE_READER_ALL_STREAMS.0 as u32, false);
        reader
            .SetStreamSelection(MF_SOURCE_READER_FIRST_VIDEO_STREAM.0 as u32, true)
            .map_err(|e| format!("stream selection failed: {e}"))?;

        // Ask for UYVY; a refusal keeps the device-native subtype and the
        // capture loop converts instead.
        if let Ok(requested) = MFCreateMediaType() {
            let _ = requested.SetGUID(&MF_MT_MAJOR_TYPE, &MFMediaType_Video);
            let _ = requested.SetGUID(&MF_MT_SUBTYPE, &MFVideoFormat_UYVY);
            if reader
                .SetCurrentMediaType(MF_SOURCE_READER_FIRST_VIDEO_STREAM.0 as u32, None, &requested)
                .is_err()
            {
                tracing::info!("mf: device refused UYVY, using native subtype");
            }
        }

        let negotiated: IMFMediaType = reader
            .GetCurrentMediaType(MF_SOURCE_READER_FIRST_VIDEO_STREAM.0 as u32)
            .map_err(|e| format!("GetCurrentMediaType failed: {e}"))?;

        let size = negotiated
            .GetUINT64(&MF_MT_FRAME_SIZE)
            .map_err(|e| format!("no frame size: {e}"))?;
        let (width, height) = ((size >> 32) as u32, size as u32);
        let rate = negotiated.GetUINT64(&MF_MT_FRAME_RATE).unwrap_or(30 << 32 | 1);
        let (fps_num, fps_den) = ((rate >> 32) as u32, (rate as u32).max(1));
        let interlace = negotiated
            .GetUINT32(&MF_MT_INTERLACE_MODE)
            .unwrap_or(MFVideoInterlace_Progressive.0 as u32);
        let subtype = negotiated.GetGUID(&MF_MT_SUBTYPE).unwrap_or(MFVideoFormat_UYVY);

        if width == 0 || height == 0 {
            return Err("device reported empty frame size".into());
        }

        let mut format = VideoFormat::new(width, height, width * 2, PixelFormat::Uyvy);
        format.fps_num = fps_num.max(1);
        format.fps_den = fps_den;
        format.interlaced = interlace != MFVideoInterlace_Progressive.0 as u32;
        format.color = ColorInfo::detect(width, height);

        tracing::info!(
            "mf: negotiated {width}x{height} @ {}/{} fps, subtype {:?}",
            format.fps_num,
            format.fps_den,
            subtype,
        );
        Ok(NegotiatedReader {
            reader,
            format,
            subtype,
        })
    }
}

fn capture_thread(
    selector: &str,
    shared: &Arc<Shared>,
    ready: &std::sync::mpsc::Sender<Result<(), String>>,
) {
    let mut session = MfSession::start();
    let mut backoff = RetryBackoff::new(BACKOFF_INITIAL, BACKOFF_STEP, BACKOFF_CAP);
    let mut first_attempt = true;

    while !shared.should_stop.load(Ordering::Acquire) {
        let negotiated = match open_reader(selector) {
            Ok(n) => n,
            Err(message) => {
                if first_attempt {
                    let _ = ready.send(Err(message));
                    return;
                }
                shared.set_error(&message);
                std::thread::sleep(backoff.next_delay());
                continue;
            }
        };
        if first_attempt {
            let _ = ready.send(Ok(()));
            first_attempt = false;
        }
        backoff.reset();

        match run_capture_loop(&negotiated, shared) {
            LoopExit::Stop => break,
            LoopExit::Recoverable(hr, message) => {
                shared.set_error(&message);
                if requires_framework_reinit(hr) {
                    tracing::warn!("mf: reinitialising Media Foundation");
                    session.reinit_framework();
                }
                std::thread::sleep(backoff.next_delay());
            }
        }
    }
    drop(session);
}

enum LoopExit {
    Stop,
    Recoverable(windows::core::HRESULT, String),
}

fn run_capture_loop(negotiated: &NegotiatedReader, shared: &Arc<Shared>) -> LoopExit {
    let format = negotiated.format;
    let w = format.width as usize;
    let h = format.height as usize;
    let mut uyvy = vec![0u8; w * h * 2];

    while !shared.should_stop.load(Ordering::Acquire) {
        let mut stream_index = 0u32;
        let mut flags = 0u32;
        let mut sample_time = 0i64;
        let mut sample = None;
        // SAFETY: synchronous ReadSample with out-pointers to locals.
        let result = unsafe {
            negotiated.reader.ReadSample(
                MF_SOURCE_READER_FIRST_VIDEO_STREAM.0 as u32,
                0,
                Some(&mut stream_index),
                Some(&mut flags),
                Some(&mut sample_time),
                Some(&mut sample),
            )
        };

        if let Err(e) = result {
            let hr = e.code();
            if is_device_error(hr) {
                return LoopExit::Recoverable(hr, format!("device error: {e}"));
            }
            tracing::warn!("mf: ReadSample failed: {e}");
            shared.stats.record_drop();
            continue;
        }

        if flags & MF_SOURCE_READERF_ENDOFSTREAM.0 as u32 != 0 {
            return LoopExit::Recoverable(
                MF_E_DEVICE_INVALIDATED,
                "end of stream from capture device".into(),
            );
        }

        let Some(sample) = sample else {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        };

        let arrived = Instant::now();
        // 100 ns units to nanoseconds; fall back to the process clock.
        let timestamp_ns = if sample_time > 0 {
            sample_time * 100
        } else {
            monotonic_ns()
        };

        let callback = shared.frame_cb.lock().unwrap().clone();
        let Some(callback) = callback else {
            continue;
        };

        // SAFETY: contiguous buffer lock/unlock brackets the copy.
        let delivered = unsafe {
            let Ok(buffer) = sample.ConvertToContiguousBuffer() else {
                shared.stats.record_drop();
                continue;
            };
            let mut data: *mut u8 = std::ptr::null_mut();
            let mut current = 0u32;
            if buffer.Lock(&mut data, None, Some(&mut current)).is_err() {
                shared.stats.record_drop();
                continue;
            }
            let bytes = std::slice::from_raw_parts(data, current as usize);
            let ok = deliver_as_uyvy(bytes, &format, negotiated.subtype, &mut uyvy);
            if ok {
                callback(&Frame {
                    data: &uyvy[..w * h * 2],
                    timestamp_ns,
                    format: &format,
                });
            }
            let _ = buffer.Unlock();
            ok
        };

        if delivered {
            shared.stats.record_frame(arrived, false);
        } else {
            shared.stats.record_drop();
        }
    }
    LoopExit::Stop
}

/// Repack the sample into the UYVY staging buffer. UYVY passes through,
/// YUY2 byte-swaps, NV12 upsamples 4:2:0 chroma.
fn deliver_as_uyvy(src: &[u8], format: &VideoFormat, subtype: GUID, dst: &mut [u8]) -> bool {
    let w = format.width;
    let h = format.height;
    if subtype == MFVideoFormat_UYVY {
        let len = (w * h * 2) as usize;
        if src.len() < len {
            return false;
        }
        dst[..len].copy_from_slice(&src[..len]);
        true
    } else if subtype == MFVideoFormat_YUY2 {
        bridge_convert::yuyv_to_uyvy(src, w, h, 0, dst).is_ok()
    } else if subtype == MFVideoFormat_NV12 {
        bridge_convert::nv12_to_uyvy(src, w, h, 0, dst).is_ok()
    } else {
        false
    }
}
