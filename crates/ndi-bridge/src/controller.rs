//! Capture/send lifecycle supervision.
//!
//! One worker thread drives the state machine:
//!
//! ```text
//! Idle -start()-> Initialising -ok-> Running -error/stall/restart-> Restarting -> Initialising
//! Initialising -fail-> Recovering -(retries left)-> Initialising
//!                                 -(exhausted)----> Stopped
//! ```
//!
//! While Running the worker wakes every second on a condvar and checks
//! the captured-frame counter against a stall deadline, the backend's
//! error flag, and the external restart flag. The frame hot path is the
//! backend callback calling straight into the sink; no queue sits in
//! between.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bridge_capture::{CaptureDevice, Frame};

/// Where captured frames go. Production wires this to an NDI sender;
/// tests substitute their own.
pub trait FrameSink: Send {
    /// Deliver one frame; false counts it as dropped.
    fn send(&mut self, frame: &Frame<'_>) -> bool;
}

/// Builds a fresh sink for every (re)initialisation attempt.
pub type SinkFactory = Box<dyn FnMut() -> Result<Box<dyn FrameSink>, String> + Send>;

pub type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Initialising,
    Running,
    Restarting,
    Recovering,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Capture device selector; empty picks the first device.
    pub device: String,
    pub ndi_name: String,
    pub auto_retry: bool,
    pub retry_delay: Duration,
    /// -1 retries forever.
    pub max_retries: i32,
    /// Supervisor wake interval.
    pub tick: Duration,
    /// How long the captured counter may stay flat while capturing.
    pub stall_window: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            ndi_name: "NDI Bridge".into(),
            auto_retry: true,
            retry_delay: Duration::from_secs(5),
            max_retries: -1,
            tick: Duration::from_secs(1),
            stall_window: Duration::from_secs(5),
        }
    }
}

/// Identical error messages within this window reach the user once.
const ERROR_DEDUP_WINDOW: Duration = Duration::from_secs(1);

struct Shared {
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    wake: Condvar,
    stop_requested: AtomicBool,
    restart_requested: AtomicBool,
    frames_captured: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    init_attempts: AtomicU64,
    status_cb: Mutex<Option<StatusCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
    last_error: Mutex<Option<(String, Instant)>>,
}

impl Shared {
    fn set_state(&self, state: ControllerState) {
        *self.state.lock().unwrap() = state;
        self.wake.notify_all();
    }

    fn report_status(&self, message: &str) {
        tracing::info!("{message}");
        if let Some(cb) = self.status_cb.lock().unwrap().as_ref() {
            cb(message);
        }
    }

    /// Rate-limited error report: identical messages inside the dedup
    /// window are suppressed.
    fn report_error(&self, message: &str, recoverable: bool) {
        {
            let mut last = self.last_error.lock().unwrap();
            if let Some((text, at)) = last.as_ref() {
                if text == message && at.elapsed() < ERROR_DEDUP_WINDOW {
                    return;
                }
            }
            *last = Some((message.to_string(), Instant::now()));
        }
        tracing::error!("{message}");
        if let Some(cb) = self.error_cb.lock().unwrap().as_ref() {
            cb(message, recoverable);
        }
    }

    /// Interruptible sleep: returns early on stop.
    fn sleep(&self, duration: Duration) {
        let guard = self.state.lock().unwrap();
        let _unused = self
            .wake
            .wait_timeout_while(guard, duration, |_| {
                !self.stop_requested.load(Ordering::Acquire)
            })
            .unwrap();
    }
}

/// Supervises one capture backend and its frame sink.
pub struct AppController<B> {
    shared: Arc<Shared>,
    worker: Option<std::thread::JoinHandle<()>>,
    /// Consumed by start().
    parts: Option<(B, SinkFactory)>,
}

impl<B: CaptureDevice + Send + 'static> AppController<B> {
    pub fn new(config: ControllerConfig, backend: B, sink_factory: SinkFactory) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ControllerState::Idle),
                wake: Condvar::new(),
                stop_requested: AtomicBool::new(false),
                restart_requested: AtomicBool::new(false),
                frames_captured: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                init_attempts: AtomicU64::new(0),
                status_cb: Mutex::new(None),
                error_cb: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            worker: None,
            parts: Some((backend, sink_factory)),
        }
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.shared.status_cb.lock().unwrap() = Some(callback);
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.shared.error_cb.lock().unwrap() = Some(callback);
    }

    /// Launch the worker thread. Errors if already started.
    pub fn start(&mut self) -> Result<(), String> {
        let (backend, sink_factory) = self
            .parts
            .take()
            .ok_or_else(|| "controller already started".to_string())?;
        let shared = Arc::clone(&self.shared);
        self.worker = Some(
            std::thread::Builder::new()
                .name("bridge-supervisor".into())
                .spawn(move || worker_loop(backend, sink_factory, &shared))
                .map_err(|e| e.to_string())?,
        );
        Ok(())
    }

    /// Stop the pipeline and join the worker.
    pub fn stop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Ask the worker to tear down and reinitialise the pipeline.
    pub fn request_restart(&self) {
        self.shared.restart_requested.store(true, Ordering::Release);
        self.shared.wake.notify_all();
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.shared.state.lock().unwrap()
    }

    /// `(captured, sent, dropped)` frame counters.
    #[must_use]
    pub fn frame_stats(&self) -> (u64, u64, u64) {
        (
            self.shared.frames_captured.load(Ordering::Relaxed),
            self.shared.frames_sent.load(Ordering::Relaxed),
            self.shared.frames_dropped.load(Ordering::Relaxed),
        )
    }

    /// How many times the worker entered Initialising.
    #[must_use]
    pub fn init_attempts(&self) -> u64 {
        self.shared.init_attempts.load(Ordering::Relaxed)
    }

    /// Block until the worker reaches Stopped, up to `timeout`.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.state.lock().unwrap();
        while *guard != ControllerState::Stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _) = self
                .shared
                .wake
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }
        true
    }
}

impl<B> Drop for AppController<B> {
    fn drop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

enum RunExit {
    Stop,
    Restart,
    BackendError,
    Stall,
}

fn worker_loop<B: CaptureDevice>(
    mut backend: B,
    mut sink_factory: SinkFactory,
    shared: &Arc<Shared>,
) {
    shared.report_status("bridge supervisor started");
    let mut retry_count: i32 = 0;

    while !shared.stop_requested.load(Ordering::Acquire) {
        shared.set_state(ControllerState::Initialising);
        shared.init_attempts.fetch_add(1, Ordering::Relaxed);

        match initialise(&mut backend, &mut sink_factory, shared) {
            Ok(()) => {
                retry_count = 0;
                shared.restart_requested.store(false, Ordering::Release);
                shared.set_state(ControllerState::Running);
                shared.report_status("pipeline running");

                let exit = monitor(&backend, shared);
                backend.stop_capture();

                match exit {
                    RunExit::Stop => break,
                    RunExit::Restart | RunExit::BackendError | RunExit::Stall => {
                        shared.set_state(ControllerState::Restarting);
                        shared.report_status("restarting capture pipeline");
                        shared.sleep(shared.config.retry_delay);
                        shared.restart_requested.store(false, Ordering::Release);
                    }
                }
            }
            Err(message) => {
                shared.report_error(&message, shared.config.auto_retry);
                shared.set_state(ControllerState::Recovering);

                retry_count += 1;
                let exhausted = shared.config.max_retries >= 0
                    && retry_count > shared.config.max_retries;
                if !shared.config.auto_retry || exhausted {
                    if exhausted {
                        shared.report_error("maximum retries exceeded, stopping", false);
                    }
                    break;
                }
                shared.report_status(&format!(
                    "recovery attempt {retry_count}{}",
                    if shared.config.max_retries >= 0 {
                        format!("/{}", shared.config.max_retries)
                    } else {
                        String::new()
                    }
                ));
                shared.sleep(shared.config.retry_delay);
            }
        }
    }

    backend.stop_capture();
    shared.set_state(ControllerState::Stopped);
    shared.report_status("bridge supervisor stopped");
}

/// Build the sink, wire the callbacks, start the capture.
fn initialise<B: CaptureDevice>(
    backend: &mut B,
    sink_factory: &mut SinkFactory,
    shared: &Arc<Shared>,
) -> Result<(), String> {
    let sink = sink_factory()?;
    let sink = Arc::new(Mutex::new(sink));

    // Callbacks go in before the capture starts so the first frame
    // already has somewhere to land.
    let frame_shared = Arc::clone(shared);
    backend.set_frame_callback(Arc::new(move |frame: &Frame<'_>| {
        frame_shared.frames_captured.fetch_add(1, Ordering::Relaxed);
        let delivered = sink.lock().unwrap().send(frame);
        if delivered {
            frame_shared.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            frame_shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }));

    let error_shared = Arc::clone(shared);
    backend.set_error_callback(Arc::new(move |message: &str| {
        error_shared.report_error(&format!("capture error: {message}"), true);
        error_shared.restart_requested.store(true, Ordering::Release);
        error_shared.wake.notify_all();
    }));

    backend
        .start_capture(&shared.config.device)
        .map_err(|e| format!("failed to start capture: {e}"))
}

/// The Running state: 1 s ticks checking stall, backend error and the
/// restart flag.
fn monitor<B: CaptureDevice>(backend: &B, shared: &Arc<Shared>) -> RunExit {
    let mut last_count = shared.frames_captured.load(Ordering::Relaxed);
    let mut last_change = Instant::now();

    loop {
        {
            let guard = shared.state.lock().unwrap();
            let _unused = shared
                .wake
                .wait_timeout(guard, shared.config.tick)
                .unwrap();
        }

        if shared.stop_requested.load(Ordering::Acquire) {
            return RunExit::Stop;
        }
        if shared.restart_requested.load(Ordering::Acquire) {
            return RunExit::Restart;
        }
        if backend.has_error() {
            let message = backend
                .last_error()
                .unwrap_or_else(|| "capture device error".into());
            shared.report_error(&message, true);
            return RunExit::BackendError;
        }

        let count = shared.frames_captured.load(Ordering::Relaxed);
        if count != last_count {
            last_count = count;
            last_change = Instant::now();
        } else if last_change.elapsed() >= shared.config.stall_window && backend.is_capturing() {
            // Alive but producing nothing: treat as recoverable.
            shared.report_error("no frames received for 5 seconds", true);
            return RunExit::Stall;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_capture::{
        backend::{ErrorCallback as BackendErrorCb, FrameCallback},
        CaptureError, DeviceInfo, StatsSnapshot, VideoFormat,
    };
    use bridge_convert::PixelFormat;
    use std::sync::atomic::AtomicU32;

    /// Scriptable backend: fails on demand, exposes its callbacks so the
    /// test can push frames and errors.
    #[derive(Default)]
    struct FakeState {
        start_calls: AtomicU32,
        fail_from_attempt: AtomicU32,
        capturing: AtomicBool,
        has_error: AtomicBool,
        frame_cb: Mutex<Option<FrameCallback>>,
        error_cb: Mutex<Option<BackendErrorCb>>,
    }

    #[derive(Clone)]
    struct FakeBackend(Arc<FakeState>);

    impl FakeBackend {
        fn new() -> Self {
            Self(Arc::new(FakeState {
                fail_from_attempt: AtomicU32::new(u32::MAX),
                ..FakeState::default()
            }))
        }

        fn push_frame(&self) {
            let cb = self.0.frame_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                let format = VideoFormat::new(2, 2, 4, PixelFormat::Yuyv);
                cb(&Frame {
                    data: &[0u8; 8],
                    timestamp_ns: 0,
                    format: &format,
                });
            }
        }

        fn raise_error(&self, message: &str) {
            let cb = self.0.error_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(message);
            }
        }
    }

    impl CaptureDevice for FakeBackend {
        fn enumerate_devices(&self) -> Vec<DeviceInfo> {
            Vec::new()
        }

        fn start_capture(&mut self, _selector: &str) -> Result<(), CaptureError> {
            let attempt = self.0.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.0.fail_from_attempt.load(Ordering::SeqCst) {
                return Err(CaptureError::Device("scripted failure".into()));
            }
            self.0.has_error.store(false, Ordering::Release);
            self.0.capturing.store(true, Ordering::Release);
            Ok(())
        }

        fn stop_capture(&mut self) {
            self.0.capturing.store(false, Ordering::Release);
        }

        fn set_frame_callback(&mut self, callback: FrameCallback) {
            *self.0.frame_cb.lock().unwrap() = Some(callback);
        }

        fn set_error_callback(&mut self, callback: BackendErrorCb) {
            *self.0.error_cb.lock().unwrap() = Some(callback);
        }

        fn is_capturing(&self) -> bool {
            self.0.capturing.load(Ordering::Acquire)
        }

        fn has_error(&self) -> bool {
            self.0.has_error.load(Ordering::Acquire)
        }

        fn last_error(&self) -> Option<String> {
            self.has_error().then(|| "scripted failure".to_string())
        }

        fn statistics(&self) -> StatsSnapshot {
            StatsSnapshot::default()
        }
    }

    struct CountingSink(Arc<AtomicU64>);

    impl FrameSink for CountingSink {
        fn send(&mut self, _frame: &Frame<'_>) -> bool {
            self.0.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    fn counting_factory(counter: Arc<AtomicU64>) -> SinkFactory {
        Box::new(move || Ok(Box::new(CountingSink(Arc::clone(&counter))) as Box<dyn FrameSink>))
    }

    fn fast_config() -> ControllerConfig {
        ControllerConfig {
            retry_delay: Duration::from_millis(20),
            tick: Duration::from_millis(20),
            stall_window: Duration::from_millis(150),
            ..ControllerConfig::default()
        }
    }

    fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn frames_flow_to_the_sink() {
        let backend = FakeBackend::new();
        let sent = Arc::new(AtomicU64::new(0));
        let mut controller =
            AppController::new(fast_config(), backend.clone(), counting_factory(sent.clone()));
        controller.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            controller.state() == ControllerState::Running
        }));
        for _ in 0..5 {
            backend.push_frame();
        }
        assert_eq!(sent.load(Ordering::Relaxed), 5);
        let (captured, delivered, dropped) = controller.frame_stats();
        assert_eq!(captured, 5);
        assert_eq!(delivered, 5);
        assert_eq!(dropped, 0);
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Stopped);
    }

    #[test]
    fn stall_triggers_recoverable_restart() {
        let backend = FakeBackend::new();
        let errors = Arc::new(Mutex::new(Vec::<String>::new()));
        let sent = Arc::new(AtomicU64::new(0));
        let mut controller =
            AppController::new(fast_config(), backend.clone(), counting_factory(sent));
        let sink_errors = Arc::clone(&errors);
        controller.set_error_callback(Box::new(move |message, recoverable| {
            assert!(recoverable || message.contains("retries"));
            sink_errors.lock().unwrap().push(message.to_string());
        }));
        controller.start().unwrap();

        // Capturing but never a frame: the stall window fires and the
        // pipeline reinitialises.
        assert!(wait_until(Duration::from_secs(3), || {
            controller.init_attempts() >= 2
        }));
        assert!(errors
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains("no frames received")));
        controller.stop();
    }

    #[test]
    fn retry_cap_gives_exactly_initial_plus_retries_attempts() {
        let backend = FakeBackend::new();
        backend.0.fail_from_attempt.store(1, Ordering::SeqCst);
        let sent = Arc::new(AtomicU64::new(0));
        let config = ControllerConfig {
            max_retries: 3,
            ..fast_config()
        };
        let mut controller = AppController::new(config, backend.clone(), counting_factory(sent));
        controller.start().unwrap();

        assert!(controller.wait_for_completion(Duration::from_secs(3)));
        assert_eq!(controller.state(), ControllerState::Stopped);
        // One initial attempt plus three retries.
        assert_eq!(controller.init_attempts(), 4);
        assert_eq!(backend.0.start_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn identical_errors_are_rate_limited() {
        let backend = FakeBackend::new();
        let delivered = Arc::new(AtomicU64::new(0));
        let sent = Arc::new(AtomicU64::new(0));
        let mut controller =
            AppController::new(fast_config(), backend.clone(), counting_factory(sent));
        let counter = Arc::clone(&delivered);
        controller.set_error_callback(Box::new(move |_message, _recoverable| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        controller.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            controller.state() == ControllerState::Running
        }));

        // Spam the same error every 100 ms for under a second: the 1 s
        // dedup window lets at most one through per window.
        for _ in 0..8 {
            backend.raise_error("transient glitch");
            std::thread::sleep(Duration::from_millis(100));
        }
        assert!(delivered.load(Ordering::Relaxed) <= 2);
        controller.stop();
    }

    #[test]
    fn running_failure_consumes_retry_budget_then_stops() {
        // S6 shape: start clean, force a device error while running,
        // every reinitialisation fails, three retries then Stopped.
        let backend = FakeBackend::new();
        let sent = Arc::new(AtomicU64::new(0));
        let config = ControllerConfig {
            max_retries: 3,
            ..fast_config()
        };
        let mut controller = AppController::new(config, backend.clone(), counting_factory(sent));
        controller.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            controller.state() == ControllerState::Running
        }));

        // Fail all subsequent starts, then invalidate the device.
        backend.0.fail_from_attempt.store(2, Ordering::SeqCst);
        backend.raise_error("device invalidated");

        assert!(controller.wait_for_completion(Duration::from_secs(5)));
        // Four re-entries into Initialising after the good run: the
        // restart attempt plus three retries, then the cap stops it.
        assert_eq!(controller.init_attempts(), 5);
        assert_eq!(controller.state(), ControllerState::Stopped);
    }

    #[test]
    fn stop_from_running_is_orderly() {
        let backend = FakeBackend::new();
        let sent = Arc::new(AtomicU64::new(0));
        let mut controller =
            AppController::new(fast_config(), backend.clone(), counting_factory(sent));
        controller.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            controller.state() == ControllerState::Running
        }));
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert!(!backend.is_capturing());
    }
}
