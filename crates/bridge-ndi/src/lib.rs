// NDI SDK integration.
//
// The SDK is a runtime dependency only: ffi.rs resolves every entry point
// through libloading when the first NdiRuntime is acquired, so builds and
// tests never link against libndi. One process-wide reference count keeps
// NDIlib_initialize/NDIlib_destroy balanced no matter how many senders
// and receivers exist.

pub mod ffi;
mod finder;
mod receiver;
mod runtime;
mod sender;

pub use finder::{NdiFinder, NdiSource};
pub use receiver::{
    NdiAudioFrame, NdiReceiver, NdiVideoFrame, ReceiveHandler, ReceiverStats,
};
pub use runtime::NdiRuntime;
pub use sender::{NdiSender, VideoFrameInfo};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NdiError {
    #[error("NDI runtime not available: {0}")]
    NotAvailable(String),

    #[error("CPU not supported by the NDI runtime")]
    CpuUnsupported,

    #[error("NDI library initialization failed")]
    InitFailed,

    #[error("invalid NDI name: {0}")]
    InvalidName(String),

    #[error("failed to create NDI {0}")]
    CreateFailed(&'static str),

    #[error("NDI source not found: {0}")]
    SourceNotFound(String),

    #[error("unsupported pixel format for NDI send: {0}")]
    UnsupportedFormat(bridge_convert::PixelFormat),
}
