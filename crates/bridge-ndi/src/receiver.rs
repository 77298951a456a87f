//! NDI receive wrapper: one receiver per display, frames dispatched from
//! a dedicated thread.

use std::ffi::{c_void, CStr, CString};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::ffi::{
    NdiLib, NDIlib_audio_frame_interleaved_16s_t, NDIlib_audio_frame_v2_t,
    NDIlib_frame_type_e, NDIlib_metadata_frame_t, NDIlib_recv_bandwidth_e,
    NDIlib_recv_color_format_e, NDIlib_recv_create_v3_t, NDIlib_video_frame_v2_t,
};
use crate::{NdiError, NdiFinder, NdiRuntime};

const CAPTURE_TIMEOUT_MS: u32 = 100;

/// Sanity caps applied before touching SDK-provided audio.
const MAX_AUDIO_CHANNELS: i32 = 32;
const MAX_AUDIO_SAMPLES: i32 = 192_000;

/// A received video frame, borrowed from the SDK for the callback's
/// duration.
#[derive(Debug, Clone, Copy)]
pub struct NdiVideoFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub fourcc: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    /// SDK timestamp in 100 ns units.
    pub timestamp: i64,
}

/// A received audio frame; conversion to interleaved S16 goes through
/// the SDK utility.
pub struct NdiAudioFrame<'a> {
    raw: &'a NDIlib_audio_frame_v2_t,
    lib: &'a NdiLib,
}

impl NdiAudioFrame<'_> {
    #[must_use]
    pub fn channels(&self) -> i32 {
        self.raw.no_channels
    }

    #[must_use]
    pub fn samples(&self) -> i32 {
        self.raw.no_samples
    }

    #[must_use]
    pub fn sample_rate(&self) -> i32 {
        self.raw.sample_rate
    }

    /// Convert the SDK's float (possibly planar) audio into interleaved
    /// S16 in `out`. Returns false for empty or out-of-range frames.
    pub fn to_interleaved_s16(&self, out: &mut Vec<i16>) -> bool {
        let channels = self.raw.no_channels;
        let samples = self.raw.no_samples;
        if self.raw.p_data.is_null() || channels <= 0 || samples <= 0 {
            return false;
        }
        if channels > MAX_AUDIO_CHANNELS || samples > MAX_AUDIO_SAMPLES {
            tracing::error!(
                "audio frame out of range: {channels} channels, {samples} samples"
            );
            return false;
        }

        out.resize(channels as usize * samples as usize, 0);
        let mut interleaved = NDIlib_audio_frame_interleaved_16s_t {
            reference_level: 0,
            p_data: out.as_mut_ptr(),
            ..Default::default()
        };
        // SAFETY: destination sized to channels * samples above; the
        // utility reads the source frame and fills the destination.
        unsafe {
            (self.lib.util_audio_to_interleaved_16s_v2)(self.raw, &mut interleaved);
        }
        true
    }
}

/// Callbacks dispatched on the receive thread. Each SDK frame is freed
/// after the callback returns, so implementations copy what they keep.
pub trait ReceiveHandler: Send {
    fn on_video(&mut self, frame: &NdiVideoFrame<'_>);
    fn on_audio(&mut self, frame: &NdiAudioFrame<'_>);
    fn on_metadata(&mut self, _xml: &str) {}
}

#[derive(Default)]
struct StatsInner {
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    fps_milli: AtomicU32,
    width: AtomicU32,
    height: AtomicU32,
}

/// Receiver statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReceiverStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub fps: f32,
    pub width: u32,
    pub height: u32,
}

struct RecvInstance(*mut c_void);
// SAFETY: the SDK allows receive instances to be used from another
// thread; ownership is handed to exactly one receive thread.
unsafe impl Send for RecvInstance {}

pub struct NdiReceiver {
    runtime: NdiRuntime,
    instance: *mut c_void,
    source_name: String,
    stats: Arc<StatsInner>,
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

// SAFETY: see RecvInstance; the instance is destroyed only after the
// receive thread has been joined.
unsafe impl Send for NdiReceiver {}

impl NdiReceiver {
    /// Create a receiver for the named source out of the finder's
    /// current list. Bandwidth highest, fields off, BGRX/BGRA colour.
    pub fn connect(
        runtime: NdiRuntime,
        finder: &NdiFinder,
        source_name: &str,
    ) -> Result<Self, NdiError> {
        let raw = finder
            .raw_source(source_name)
            .ok_or_else(|| NdiError::SourceNotFound(source_name.to_string()))?;
        let recv_name = CString::new("ndi-bridge display")
            .map_err(|_| NdiError::InvalidName("receiver".into()))?;

        let create = NDIlib_recv_create_v3_t {
            source_to_connect_to: raw,
            color_format: NDIlib_recv_color_format_e::BGRX_BGRA,
            bandwidth: NDIlib_recv_bandwidth_e::Highest,
            allow_video_fields: false,
            p_ndi_recv_name: recv_name.as_ptr(),
        };
        // SAFETY: the raw source pointers stay valid while the borrowed
        // finder is untouched, which holds for the duration of this call.
        let instance = unsafe { (runtime.lib().recv_create_v3)(&create) };
        if instance.is_null() {
            return Err(NdiError::CreateFailed("receiver"));
        }
        tracing::info!("connected to NDI source '{source_name}'");

        Ok(Self {
            runtime,
            instance,
            source_name: source_name.to_string(),
            stats: Arc::new(StatsInner::default()),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Start the receive thread; frames are dispatched to `handler`.
    pub fn start(&mut self, handler: Box<dyn ReceiveHandler>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let instance = RecvInstance(self.instance);
        let runtime = self.runtime.clone();
        let stats = Arc::clone(&self.stats);
        let running = Arc::clone(&self.running);
        let name = self.source_name.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name("ndi-recv".into())
                .spawn(move || receive_loop(&runtime, instance, handler, &stats, &running, &name))
                .expect("spawn receive thread"),
        );
    }

    /// Stop the receive thread; returns once it has joined (bounded by
    /// the 100 ms capture timeout).
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    #[must_use]
    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            fps: self.stats.fps_milli.load(Ordering::Relaxed) as f32 / 1000.0,
            width: self.stats.width.load(Ordering::Relaxed),
            height: self.stats.height.load(Ordering::Relaxed),
        }
    }
}

impl Drop for NdiReceiver {
    fn drop(&mut self) {
        self.stop();
        // SAFETY: thread joined, nothing else references the instance.
        unsafe { (self.runtime.lib().recv_destroy)(self.instance) };
        tracing::debug!("NDI receiver for '{}' destroyed", self.source_name);
    }
}

fn receive_loop(
    runtime: &NdiRuntime,
    instance: RecvInstance,
    mut handler: Box<dyn ReceiveHandler>,
    stats: &StatsInner,
    running: &AtomicBool,
    source_name: &str,
) {
    let lib = runtime.lib();
    tracing::info!("receive thread for '{source_name}' started");

    while running.load(Ordering::Acquire) {
        let mut video = NDIlib_video_frame_v2_t::default();
        let mut audio = NDIlib_audio_frame_v2_t::default();
        let mut metadata = NDIlib_metadata_frame_t::default();

        // SAFETY: out-structs are defaulted; every frame type returned
        // is freed exactly once after dispatch.
        let frame_type = unsafe {
            (lib.recv_capture_v2)(
                instance.0,
                &mut video,
                &mut audio,
                &mut metadata,
                CAPTURE_TIMEOUT_MS,
            )
        };

        match frame_type {
            NDIlib_frame_type_e::Video => {
                let stride = if video.line_stride_in_bytes > 0 {
                    video.line_stride_in_bytes as u32
                } else {
                    video.xres as u32 * 4
                };
                let len = stride as usize * video.yres.max(0) as usize;
                if !video.p_data.is_null() && len > 0 {
                    stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    stats.width.store(video.xres as u32, Ordering::Relaxed);
                    stats.height.store(video.yres as u32, Ordering::Relaxed);
                    if video.frame_rate_D > 0 {
                        let fps_milli =
                            video.frame_rate_N as u64 * 1000 / video.frame_rate_D as u64;
                        stats.fps_milli.store(fps_milli as u32, Ordering::Relaxed);
                    }
                    // SAFETY: SDK guarantees len bytes behind p_data for
                    // the reported geometry until the frame is freed.
                    let data = unsafe { std::slice::from_raw_parts(video.p_data, len) };
                    handler.on_video(&NdiVideoFrame {
                        data,
                        width: video.xres as u32,
                        height: video.yres as u32,
                        stride,
                        fourcc: video.FourCC as u32,
                        fps_num: video.frame_rate_N as u32,
                        fps_den: video.frame_rate_D.max(1) as u32,
                        timestamp: video.timestamp,
                    });
                }
                // SAFETY: frees the frame captured above.
                unsafe { (lib.recv_free_video_v2)(instance.0, &video) };
            }
            NDIlib_frame_type_e::Audio => {
                handler.on_audio(&NdiAudioFrame { raw: &audio, lib });
                // SAFETY: frees the frame captured above.
                unsafe { (lib.recv_free_audio_v2)(instance.0, &audio) };
            }
            NDIlib_frame_type_e::Metadata => {
                if !metadata.p_data.is_null() {
                    // SAFETY: SDK metadata is NUL-terminated UTF-8 XML.
                    let xml = unsafe { CStr::from_ptr(metadata.p_data) };
                    handler.on_metadata(&xml.to_string_lossy());
                }
                // SAFETY: frees the frame captured above.
                unsafe { (lib.recv_free_metadata)(instance.0, &metadata) };
            }
            NDIlib_frame_type_e::Error => {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("receive error from '{source_name}'");
                std::thread::sleep(Duration::from_millis(100));
            }
            NDIlib_frame_type_e::None | NDIlib_frame_type_e::StatusChange => {}
        }
    }

    tracing::info!("receive thread for '{source_name}' stopped");
}
