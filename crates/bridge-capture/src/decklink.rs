//! Blackmagic DeckLink capture backend (Windows).
//!
//! The SDK calls us back on its own threads, so the callback object only
//! holds the shared state handle and dispatches; it never blocks. Input
//! is enabled with format autodetection: the first format-changed
//! notification restarts the streams on the detected mode, later ones
//! just update the recorded format. A watchdog thread turns a 5 s frame
//! gap or a run of more than 10 consecutive bad frames into a
//! supervisor-visible error.

#![allow(non_snake_case)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use windows::core::{implement, interface, Interface, IUnknown, IUnknown_Vtbl, BSTR, GUID, HRESULT};
use windows::Win32::Foundation::{E_FAIL, S_OK};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED,
};

use bridge_convert::{ColorInfo, PixelFormat};

use crate::backend::{CaptureDevice, ErrorCallback, FrameCallback};
use crate::frame::{monotonic_ns, CaptureStats, DeviceInfo, Frame, StatsSnapshot, VideoFormat};
use crate::CaptureError;

const ITERATOR_RETRIES: u32 = 3;
const ITERATOR_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const FRAME_GAP_LIMIT: Duration = Duration::from_secs(5);
const NO_INPUT_LOG_INTERVAL: Duration = Duration::from_secs(10);

// BMD FourCC constants from DeckLinkAPI.idl.
const BMD_MODE_HD1080P6000: u32 = u32::from_be_bytes(*b"Hp60");
const BMD_MODE_HD1080P5994: u32 = u32::from_be_bytes(*b"Hp59");
const BMD_FORMAT_8BIT_YUV: u32 = u32::from_be_bytes(*b"2vuy");
const BMD_FORMAT_8BIT_BGRA: u32 = u32::from_be_bytes(*b"BGRA");
const BMD_VIDEO_INPUT_FLAG_DEFAULT: u32 = 0;
const BMD_VIDEO_INPUT_ENABLE_FORMAT_DETECTION: u32 = 1;
const BMD_FRAME_HAS_NO_INPUT_SOURCE: u32 = 0x8000_0000;
const BMD_DETECTED_INPUT_YCBCR422: u32 = 1 << 0;
const BMD_DETECTED_INPUT_RGB444: u32 = 1 << 1;
const NS_TIMESCALE: i64 = 1_000_000_000;

/// Interface bindings, IIDs from DeckLinkAPI.idl (SDK 12.x).
mod sdk {
    use super::*;
    use core::ffi::c_void;

    pub const CLSID_CDECKLINK_ITERATOR: GUID =
        GUID::from_u128(0xBA6C6F44_6DA5_4DCE_94AA_EE2D1372A676);

    #[interface("50FB36CD-3063-4B73-BDBB-958087F2D8BA")]
    pub unsafe trait IDeckLinkIterator: IUnknown {
        fn Next(&self, decklink: *mut Option<IDeckLink>) -> HRESULT;
    }

    #[interface("C418FBDD-0587-48ED-8FE5-640F0A14AF91")]
    pub unsafe trait IDeckLink: IUnknown {
        fn GetModelName(&self, name: *mut BSTR) -> HRESULT;
        fn GetDisplayName(&self, name: *mut BSTR) -> HRESULT;
    }

    #[interface("AF22762B-DFAC-4846-AA79-FA8883560995")]
    pub unsafe trait IDeckLinkInput: IUnknown {
        fn DoesSupportVideoMode(
            &self,
            connection: u32,
            mode: u32,
            pixel_format: u32,
            conversion: u32,
            flags: u32,
            actual_mode: *mut u32,
            supported: *mut i32,
        ) -> HRESULT;
        fn GetDisplayMode(&self, mode: u32, display_mode: *mut Option<IDeckLinkDisplayMode>)
            -> HRESULT;
        fn GetDisplayModeIterator(
            &self,
            iterator: *mut Option<IDeckLinkDisplayModeIterator>,
        ) -> HRESULT;
        fn SetScreenPreviewCallback(&self, preview: *mut c_void) -> HRESULT;
        fn EnableVideoInput(&self, mode: u32, pixel_format: u32, flags: u32) -> HRESULT;
        fn DisableVideoInput(&self) -> HRESULT;
        fn SetVideoInputFrameMemoryAllocator(&self, allocator: *mut c_void) -> HRESULT;
        fn EnableAudioInput(&self, rate: u32, sample_type: u32, channels: u32) -> HRESULT;
        fn DisableAudioInput(&self) -> HRESULT;
        fn SetAudioInputFrameMemoryAllocator(&self, allocator: *mut c_void) -> HRESULT;
        fn StartStreams(&self) -> HRESULT;
        fn StopStreams(&self) -> HRESULT;
        fn PauseStreams(&self) -> HRESULT;
        fn FlushStreams(&self) -> HRESULT;
        fn SetCallback(&self, callback: *mut c_void) -> HRESULT;
    }

    #[interface("9C88499F-F601-4021-B80B-032E4EB41C35")]
    pub unsafe trait IDeckLinkDisplayModeIterator: IUnknown {
        fn Next(&self, display_mode: *mut Option<IDeckLinkDisplayMode>) -> HRESULT;
    }

    #[interface("3EB2C1AB-0A3D-4523-A3AD-F40D7FB14E78")]
    pub unsafe trait IDeckLinkDisplayMode: IUnknown {
        fn GetName(&self, name: *mut BSTR) -> HRESULT;
        fn GetDisplayMode(&self) -> u32;
        fn GetWidth(&self) -> i64;
        fn GetHeight(&self) -> i64;
        fn GetFrameRate(&self, duration: *mut i64, timescale: *mut i64) -> HRESULT;
        fn GetFieldDominance(&self) -> u32;
        fn GetFlags(&self) -> u32;
    }

    #[interface("05CFE374-537C-4094-9A57-680525118F44")]
    pub unsafe trait IDeckLinkVideoInputFrame: IUnknown {
        fn GetWidth(&self) -> i64;
        fn GetHeight(&self) -> i64;
        fn GetRowBytes(&self) -> i64;
        fn GetPixelFormat(&self) -> u32;
        fn GetFlags(&self) -> u32;
        fn GetBytes(&self, buffer: *mut *mut c_void) -> HRESULT;
        fn GetTimecode(&self, format: u32, timecode: *mut *mut c_void) -> HRESULT;
        fn GetAncillaryData(&self, ancillary: *mut *mut c_void) -> HRESULT;
        fn GetStreamTime(
            &self,
            frame_time: *mut i64,
            frame_duration: *mut i64,
            timescale: i64,
        ) -> HRESULT;
        fn GetHardwareReferenceTimestamp(
            &self,
            timescale: i64,
            frame_time: *mut i64,
            frame_duration: *mut i64,
        ) -> HRESULT;
    }

    #[interface("C86DE4F6-A29F-42E3-AB3A-1363E29F0788")]
    pub unsafe trait IDeckLinkInputCallback: IUnknown {
        fn VideoInputFormatChanged(
            &self,
            events: u32,
            new_mode: Option<&IDeckLinkDisplayMode>,
            detected_flags: u32,
        ) -> HRESULT;
        fn VideoInputFrameArrived(
            &self,
            video_frame: Option<&IDeckLinkVideoInputFrame>,
            audio_packet: *mut c_void,
        ) -> HRESULT;
    }
}

use sdk::{
    IDeckLink, IDeckLinkDisplayMode, IDeckLinkInput, IDeckLinkInputCallback,
    IDeckLinkInputCallback_Impl, IDeckLinkIterator, IDeckLinkVideoInputFrame,
};

struct Shared {
    stats: CaptureStats,
    capturing: AtomicBool,
    should_stop: AtomicBool,
    has_error: AtomicBool,
    last_error: Mutex<Option<String>>,
    frame_cb: Mutex<Option<FrameCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
    format: Mutex<VideoFormat>,
    /// Millisecond timestamp of the last good frame, for the watchdog.
    last_frame_ms: AtomicU64,
    consecutive_errors: AtomicU32,
}

impl Shared {
    fn set_error(&self, message: &str) {
        tracing::error!("decklink: {message}");
        *self.last_error.lock().unwrap() = Some(message.to_string());
        self.has_error.store(true, Ordering::Release);
        if let Some(cb) = self.error_cb.lock().unwrap().clone() {
            cb(message);
        }
    }
}

pub struct DeckLinkCapture {
    shared: Arc<Shared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl DeckLinkCapture {
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
                format: Mutex::new(VideoFormat::new(1920, 1080, 3840, PixelFormat::Uyvy)),
                last_frame_ms: AtomicU64::new(0),
                consecutive_errors: AtomicU32::new(0),
            }),
            worker: None,
        }
    }
}

impl Default for DeckLinkCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeckLinkCapture {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

/// Create the COM iterator, retrying: the DeckLink service takes a few
/// seconds to come up after boot.
fn create_iterator() -> Result<IDeckLinkIterator, String> {
    let mut last = String::new();
    for attempt in 0..ITERATOR_RETRIES {
        // SAFETY: documented CoCreateInstance call.
        match unsafe { CoCreateInstance(&sdk::CLSID_CDECKLINK_ITERATOR, None, CLSCTX_ALL) } {
            Ok(iterator) => return Ok(iterator),
            Err(e) => {
                last = format!("DeckLink iterator creation failed: {e}");
                if attempt + 1 < ITERATOR_RETRIES {
                    tracing::warn!("decklink: {last}, retrying");
                    std::thread::sleep(ITERATOR_RETRY_DELAY);
                }
            }
        }
    }
    Err(last)
}

fn device_name(device: &IDeckLink) -> String {
    let mut name = BSTR::default();
    // SAFETY: out-param BSTR, freed on drop.
    if unsafe { device.GetDisplayName(&mut name) }.is_ok() && !name.is_empty() {
        return name.to_string();
    }
    if unsafe { device.GetModelName(&mut name) }.is_ok() {
        return name.to_string();
    }
    "DeckLink".to_string()
}

/// Prefer 1080p60, then 1080p59.94, else the first mode the iterator
/// yields. Returns `(mode fourcc, width, height, fps_num, fps_den)`.
fn select_mode(input: &IDeckLinkInput) -> Option<(u32, u32, u32, u32, u32)> {
    let mut iterator = None;
    // SAFETY: out-param interface pointers throughout.
    unsafe {
        if input.GetDisplayModeIterator(&mut iterator).is_err() {
            return None;
        }
        let iterator = iterator?;
        let mut first = None;
        loop {
            let mut mode: Option<IDeckLinkDisplayMode> = None;
            if iterator.Next(&mut mode).is_err() {
                break;
            }
            let Some(mode) = mode else { break };
            let id = mode.GetDisplayMode();
            let mut duration = 0i64;
            let mut timescale = 0i64;
            let _ = mode.GetFrameRate(&mut duration, &mut timescale);
            let entry = (
                id,
                mode.GetWidth() as u32,
                mode.GetHeight() as u32,
                timescale.max(1) as u32,
                duration.max(1) as u32,
            );
            if id == BMD_MODE_HD1080P6000 || id == BMD_MODE_HD1080P5994 {
                return Some(entry);
            }
            if first.is_none() {
                first = Some(entry);
            }
        }
        first
    }
}

#[implement(IDeckLinkInputCallback)]
struct InputCallback {
    shared: Arc<Shared>,
    input: IDeckLinkInput,
    restarted_once: AtomicBool,
    last_no_input_log: Mutex<Option<Instant>>,
}

impl IDeckLinkInputCallback_Impl for InputCallback {
    fn VideoInputFormatChanged(
        &self,
        _events: u32,
        new_mode: Option<&IDeckLinkDisplayMode>,
        detected_flags: u32,
    ) -> HRESULT {
        let Some(mode) = new_mode else { return S_OK };

        let pixel = if detected_flags & BMD_DETECTED_INPUT_RGB444 != 0 {
            (BMD_FORMAT_8BIT_BGRA, PixelFormat::Bgra)
        } else {
            (BMD_FORMAT_8BIT_YUV, PixelFormat::Uyvy)
        };
        // SAFETY: the SDK keeps `mode` valid for the callback duration.
        let (width, height, duration, timescale) = unsafe {
            let mut duration = 0i64;
            let mut timescale = 0i64;
            let _ = mode.GetFrameRate(&mut duration, &mut timescale);
            (mode.GetWidth() as u32, mode.GetHeight() as u32, duration, timescale)
        };

        {
            let mut format = self.shared.format.lock().unwrap();
            format.width = width;
            format.height = height;
            format.pixel_format = pixel.1;
            format.stride = width * pixel.1.bytes_per_pixel().max(2) as u32;
            format.fps_num = timescale.max(1) as u32;
            format.fps_den = duration.max(1) as u32;
            format.color = ColorInfo::detect(width, height);
        }
        tracing::info!(
            "decklink: input format changed to {width}x{height} ({})",
            pixel.1
        );

        // Only the first change restarts the streams; the detection flag
        // keeps later notifications informational.
        if !self.restarted_once.swap(true, Ordering::AcqRel) {
            // SAFETY: SDK restart sequence on the SDK's own thread.
            unsafe {
                let _ = self.input.StopStreams();
                let _ = self.input.EnableVideoInput(
                    mode.GetDisplayMode(),
                    pixel.0,
                    BMD_VIDEO_INPUT_FLAG_DEFAULT | BMD_VIDEO_INPUT_ENABLE_FORMAT_DETECTION,
                );
                let _ = self.input.FlushStreams();
                let _ = self.input.StartStreams();
            }
        }
        S_OK
    }

    fn VideoInputFrameArrived(
        &self,
        video_frame: Option<&IDeckLinkVideoInputFrame>,
        _audio_packet: *mut core::ffi::c_void,
    ) -> HRESULT {
        let Some(frame) = video_frame else { return S_OK };

        // SAFETY: the frame stays valid until this callback returns.
        let flags = unsafe { frame.GetFlags() };
        if flags & BMD_FRAME_HAS_NO_INPUT_SOURCE != 0 {
            let mut slot = self.last_no_input_log.lock().unwrap();
            let due = slot.map_or(true, |at| at.elapsed() >= NO_INPUT_LOG_INTERVAL);
            if due {
                tracing::warn!("decklink: no input signal");
                *slot = Some(Instant::now());
            }
            return S_OK;
        }

        // SAFETY: as above; out-params are stack locals.
        let (width, height, row_bytes, bytes) = unsafe {
            let mut bytes: *mut core::ffi::c_void = std::ptr::null_mut();
            let ok = frame.GetBytes(&mut bytes).is_ok();
            (
                frame.GetWidth() as u32,
                frame.GetHeight() as u32,
                frame.GetRowBytes() as u32,
                if ok { bytes } else { std::ptr::null_mut() },
            )
        };
        if bytes.is_null() {
            let streak = self.shared.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
            self.shared.stats.record_drop();
            if streak > MAX_CONSECUTIVE_ERRORS {
                self.shared.set_error("too many consecutive bad frames");
            }
            return E_FAIL;
        }

        // SAFETY: out-params are stack locals.
        let timestamp_ns = unsafe {
            let mut frame_time = 0i64;
            let mut frame_duration = 0i64;
            if frame
                .GetStreamTime(&mut frame_time, &mut frame_duration, NS_TIMESCALE)
                .is_ok()
            {
                frame_time
            } else {
                monotonic_ns()
            }
        };

        let arrived = Instant::now();
        let mut format = *self.shared.format.lock().unwrap();
        format.width = width;
        format.height = height;
        format.stride = row_bytes;
        // SAFETY: plain attribute read on the live frame.
        let pixel_format = unsafe { frame.GetPixelFormat() };
        format.pixel_format = if pixel_format == BMD_FORMAT_8BIT_BGRA {
            PixelFormat::Bgra
        } else {
            PixelFormat::Uyvy
        };

        let len = format.frame_size();
        // SAFETY: the SDK guarantees row_bytes * height readable bytes
        // behind the CPU-access buffer until the callback returns.
        let data = unsafe { std::slice::from_raw_parts(bytes.cast::<u8>(), len) };

        // The SDK buffer is only valid until this callback returns, so
        // the user callback must copy or convert before it comes back.
        if let Some(cb) = self.shared.frame_cb.lock().unwrap().clone() {
            cb(&Frame {
                data,
                timestamp_ns,
                format: &format,
            });
        }

        self.shared.consecutive_errors.store(0, Ordering::Release);
        self.shared
            .last_frame_ms
            .store(monotonic_ns() as u64 / 1_000_000, Ordering::Release);
        self.shared.stats.record_frame(arrived, false);
        S_OK
    }
}

fn worker_thread(
    selector: String,
    shared: Arc<Shared>,
    ready: &std::sync::mpsc::Sender<Result<(), String>>,
) {
    // SAFETY: COM bring-up scoped to this thread.
    unsafe {
        let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
    }

    let result = (|| -> Result<(IDeckLink, IDeckLinkInput), String> {
        let iterator = create_iterator()?;
        let mut matched = None;
        loop {
            let mut device: Option<IDeckLink> = None;
            // SAFETY: iterator protocol; S_FALSE ends enumeration.
            if unsafe { iterator.Next(&mut device) } != S_OK {
                break;
            }
            let Some(device) = device else { break };
            let name = device_name(&device);
            // SAFETY: QueryInterface via cast.
            let Ok(input) = device.cast::<IDeckLinkInput>() else {
                tracing::debug!("decklink: '{name}' has no input interface");
                continue;
            };
            if selector.is_empty() || name.to_lowercase().contains(&selector.to_lowercase()) {
                matched = Some((device, input));
                break;
            }
        }
        matched.ok_or_else(|| {
            if selector.is_empty() {
                "no DeckLink input devices found".to_string()
            } else {
                format!("DeckLink device not found: {selector}")
            }
        })
    })();

    let (device, input) = match result {
        Ok(pair) => pair,
        Err(message) => {
            let _ = ready.send(Err(message));
            // SAFETY: mirrors the CoInitializeEx above.
            unsafe { CoUninitialize() };
            return;
        }
    };
    tracing::info!("decklink: using '{}'", device_name(&device));

    let Some((mode_id, width, height, fps_num, fps_den)) = select_mode(&input) else {
        let _ = ready.send(Err("no display modes available".into()));
        unsafe { CoUninitialize() };
        return;
    };
    {
        let mut format = shared.format.lock().unwrap();
        *format = VideoFormat::new(width, height, width * 2, PixelFormat::Uyvy);
        format.fps_num = fps_num;
        format.fps_den = fps_den;
    }

    let callback: IDeckLinkInputCallback = InputCallback {
        shared: Arc::clone(&shared),
        input: input.clone(),
        restarted_once: AtomicBool::new(false),
        last_no_input_log: Mutex::new(None),
    }
    .into();

    // SAFETY: SDK start sequence; the callback reference is held by the
    // SDK until SetCallback(null).
    let started = unsafe {
        input.SetCallback(callback.as_raw()) == S_OK
            && input.EnableVideoInput(
                mode_id,
                BMD_FORMAT_8BIT_YUV,
                BMD_VIDEO_INPUT_FLAG_DEFAULT | BMD_VIDEO_INPUT_ENABLE_FORMAT_DETECTION,
            ) == S_OK
            && input.StartStreams() == S_OK
    };
    if !started {
        let _ = ready.send(Err("failed to start DeckLink streams".into()));
        unsafe {
            let _ = input.SetCallback(std::ptr::null_mut());
            CoUninitialize();
        }
        return;
    }
    let _ = ready.send(Ok(()));
    shared
        .last_frame_ms
        .store(monotonic_ns() as u64 / 1_000_000, Ordering::Release);

    // Watchdog: the SDK drives frames, this thread only watches for gaps.
    while !shared.should_stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_secs(1));
        let last_ms = shared.last_frame_ms.load(Ordering::Acquire);
        let now_ms = monotonic_ns() as u64 / 1_000_000;
        if now_ms.saturating_sub(last_ms) > FRAME_GAP_LIMIT.as_millis() as u64
            && !shared.has_error.load(Ordering::Acquire)
        {
            shared.set_error("no frames from DeckLink for 5 seconds");
        }
    }

    // SAFETY: SDK stop sequence mirrors the start.
    unsafe {
        let _ = input.StopStreams();
        let _ = input.DisableVideoInput();
        let _ = input.SetCallback(std::ptr::null_mut());
        CoUninitialize();
    }
}

impl CaptureDevice for DeckLinkCapture {
    fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        // SAFETY: COM scoped to this call.
        unsafe {
            let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
        }
        let mut devices = Vec::new();
        if let Ok(iterator) = create_iterator() {
            loop {
                let mut device: Option<IDeckLink> = None;
                // SAFETY: iterator protocol.
                if unsafe { iterator.Next(&mut device) } != S_OK {
                    break;
                }
                let Some(device) = device else { break };
                let has_input = device.cast::<IDeckLinkInput>().is_ok();
                let name = device_name(&device);
                devices.push(DeviceInfo {
                    id: name.clone(),
                    name,
                    serial: None,
                    supports_capture: has_input,
                    supports_streaming: has_input,
                });
            }
        }
        // SAFETY: mirrors the CoInitializeEx above.
        unsafe { CoUninitialize() };
        devices
    }

    fn start_capture(&mut self, selector: &str) -> Result<(), CaptureError> {
        if self.shared.capturing.load(Ordering::Acquire) {
            return Err(CaptureError::AlreadyRunning);
        }

        self.shared.stats.reset();
        self.shared.has_error.store(false, Ordering::Release);
        self.shared.should_stop.store(false, Ordering::Release);
        self.shared.consecutive_errors.store(0, Ordering::Release);
        *self.shared.last_error.lock().unwrap() = None;

        let shared = Arc::clone(&self.shared);
        let selector = selector.to_string();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();
        let worker = std::thread::Builder::new()
            .name("decklink-capture".into())
            .spawn(move || worker_thread(selector, shared, &ready_tx))
            .map_err(CaptureError::Io)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.shared.capturing.store(true, Ordering::Release);
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = worker.join();
                Err(CaptureError::Device(message))
            }
            Err(_) => {
                let _ = worker.join();
                Err(CaptureError::Device("capture thread died during setup".into()))
            }
        }
    }

    fn stop_capture(&mut self) {
        self.shared.should_stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
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
