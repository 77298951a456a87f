// Capture device backends for the NDI bridge.
//
// - frame.rs: device descriptors, video formats, typed frames, statistics
// - queue.rs: bounded single-producer/single-consumer frame ring
// - backend.rs: the capture contract and the tagged backend dispatcher
// - v4l2.rs: Video4Linux2 backend (Linux)
// - media_foundation.rs / decklink.rs: Windows backends

pub mod backend;
pub mod backoff;
pub mod frame;
pub mod queue;

#[cfg(target_os = "linux")]
pub mod v4l2;

#[cfg(windows)]
pub mod decklink;
#[cfg(windows)]
pub mod media_foundation;

pub use backend::{Backend, BackendKind, CaptureDevice, ErrorCallback, FrameCallback};
pub use frame::{CaptureStats, DeviceInfo, Frame, StatsSnapshot, VideoFormat};
pub use queue::{FrameQueue, OwnedFrame, PopResult};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture devices found")]
    NoDevices,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device does not support capture streaming: {0}")]
    NotACaptureDevice(String),

    #[error("no usable pixel format on {0}")]
    NoUsableFormat(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("capture already running")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
