// Display side of the NDI bridge.
//
// - drm.rs: KMS mode-set, dumb-buffer page flipping, letterboxing
// - audio.rs: stereo ring + PipeWire playback stream
// - manager.rs: stream-to-display mapping lifecycle
// - status.rs: per-display status files

pub mod audio;

#[cfg(target_os = "linux")]
pub mod drm;
#[cfg(target_os = "linux")]
pub mod manager;
#[cfg(target_os = "linux")]
pub mod status;

pub use audio::AudioRing;
#[cfg(target_os = "linux")]
pub use audio::PipeWireAudioOutput;
#[cfg(target_os = "linux")]
pub use drm::{fit_rect, DisplayInfo, DrmDisplay, Rect};
#[cfg(target_os = "linux")]
pub use manager::StreamManager;
#[cfg(target_os = "linux")]
pub use status::{read_entries, status_dir, StatusEntry, StatusReporter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("no DRM card available: {0}")]
    NoCard(String),

    #[error("DRM device does not support dumb buffers")]
    NoDumbBuffers,

    #[error("unknown display id {0}")]
    UnknownDisplay(usize),

    #[error("display {0} is not connected")]
    NotConnected(usize),

    #[error("no encoder for display {0}")]
    NoEncoder(usize),

    #[error("no CRTC for display {0}")]
    NoCrtc(usize),

    #[error("no mode for display {0}")]
    NoMode(usize),

    #[error("mode set failed: {0}")]
    ModeSet(String),

    #[error("no display open")]
    NotOpen,

    #[error("bad frame: {0}")]
    BadFrame(&'static str),

    #[error("audio: {0}")]
    Audio(String),

    #[error("drm: {0}")]
    Io(String),

    #[error(transparent)]
    Ndi(#[from] bridge_ndi::NdiError),
}

impl DisplayError {
    pub(crate) fn io<E: std::fmt::Display>(e: E) -> Self {
        Self::Io(e.to_string())
    }
}
