//! The capture backend contract and the tagged dispatcher.
//!
//! Backends are a fixed closed set, so dispatch is an enum rather than a
//! trait object: the frame hot path pays no vtable indirection.

use std::str::FromStr;
use std::sync::Arc;

use crate::frame::{DeviceInfo, Frame, StatsSnapshot};
use crate::CaptureError;

/// Invoked on the capture thread for every frame. Must return within one
/// frame period (~16 ms at 60 fps): it is the NDI send hot path.
pub type FrameCallback = Arc<dyn Fn(&Frame<'_>) + Send + Sync>;

/// Invoked on the capture thread when the backend hits a device error.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Common contract implemented by every capture backend.
pub trait CaptureDevice {
    fn enumerate_devices(&self) -> Vec<DeviceInfo>;

    /// Open, negotiate a format and start the capture thread. Blocks until
    /// streaming is established or returns the failure.
    fn start_capture(&mut self, selector: &str) -> Result<(), CaptureError>;

    /// Idempotent; returns within about a second.
    fn stop_capture(&mut self);

    fn set_frame_callback(&mut self, callback: FrameCallback);
    fn set_error_callback(&mut self, callback: ErrorCallback);

    fn is_capturing(&self) -> bool;
    fn has_error(&self) -> bool;
    fn last_error(&self) -> Option<String>;
    fn statistics(&self) -> StatsSnapshot;
}

/// Which backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    #[cfg(target_os = "linux")]
    V4l2,
    #[cfg(windows)]
    MediaFoundation,
    #[cfg(windows)]
    DeckLink,
}

impl BackendKind {
    /// The platform default: V4L2 on Linux, Media Foundation on Windows.
    #[must_use]
    pub fn default_for_platform() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::V4l2
        }
        #[cfg(windows)]
        {
            Self::MediaFoundation
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            #[cfg(target_os = "linux")]
            "v4l2" => Ok(Self::V4l2),
            #[cfg(windows)]
            "mf" => Ok(Self::MediaFoundation),
            #[cfg(windows)]
            "dl" => Ok(Self::DeckLink),
            other => Err(format!("unknown capture type: {other}")),
        }
    }
}

/// Tagged backend value: one variant per compiled-in backend.
pub enum Backend {
    #[cfg(target_os = "linux")]
    V4l2(crate::v4l2::V4l2Capture),
    #[cfg(windows)]
    MediaFoundation(crate::media_foundation::MfCapture),
    #[cfg(windows)]
    DeckLink(crate::decklink::DeckLinkCapture),
}

impl Backend {
    #[must_use]
    pub fn new(kind: BackendKind) -> Self {
        match kind {
            #[cfg(target_os = "linux")]
            BackendKind::V4l2 => Self::V4l2(crate::v4l2::V4l2Capture::new()),
            #[cfg(windows)]
            BackendKind::MediaFoundation => {
                Self::MediaFoundation(crate::media_foundation::MfCapture::new())
            }
            #[cfg(windows)]
            BackendKind::DeckLink => Self::DeckLink(crate::decklink::DeckLinkCapture::new()),
        }
    }

    fn inner(&self) -> &dyn CaptureDevice {
        match self {
            #[cfg(target_os = "linux")]
            Self::V4l2(b) => b,
            #[cfg(windows)]
            Self::MediaFoundation(b) => b,
            #[cfg(windows)]
            Self::DeckLink(b) => b,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn CaptureDevice {
        match self {
            #[cfg(target_os = "linux")]
            Self::V4l2(b) => b,
            #[cfg(windows)]
            Self::MediaFoundation(b) => b,
            #[cfg(windows)]
            Self::DeckLink(b) => b,
        }
    }
}

impl CaptureDevice for Backend {
    fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        self.inner().enumerate_devices()
    }

    fn start_capture(&mut self, selector: &str) -> Result<(), CaptureError> {
        self.inner_mut().start_capture(selector)
    }

    fn stop_capture(&mut self) {
        self.inner_mut().stop_capture();
    }

    fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.inner_mut().set_frame_callback(callback);
    }

    fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.inner_mut().set_error_callback(callback);
    }

    fn is_capturing(&self) -> bool {
        self.inner().is_capturing()
    }

    fn has_error(&self) -> bool {
        self.inner().has_error()
    }

    fn last_error(&self) -> Option<String> {
        self.inner().last_error()
    }

    fn statistics(&self) -> StatsSnapshot {
        self.inner().statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses() {
        #[cfg(target_os = "linux")]
        assert_eq!("v4l2".parse::<BackendKind>().unwrap(), BackendKind::V4l2);
        assert!("quicktime".parse::<BackendKind>().is_err());
    }
}
