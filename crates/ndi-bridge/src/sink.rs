//! The production frame sink: capture frames straight into an NDI
//! sender.

use bridge_capture::Frame;
use bridge_ndi::{NdiRuntime, NdiSender, VideoFrameInfo};

use crate::controller::{FrameSink, SinkFactory};

pub struct NdiFrameSink {
    sender: NdiSender,
}

impl FrameSink for NdiFrameSink {
    fn send(&mut self, frame: &Frame<'_>) -> bool {
        let info = VideoFrameInfo {
            data: frame.data,
            width: frame.format.width,
            height: frame.format.height,
            stride: frame.format.stride,
            pixel_format: frame.format.pixel_format,
            fps_num: frame.format.fps_num,
            fps_den: frame.format.fps_den,
            timestamp_ns: frame.timestamp_ns,
            interlaced: frame.format.interlaced,
        };
        match self.sender.send_video(&info) {
            Ok(()) => true,
            Err(e) => {
                // Unsupported formats and send failures drop the frame;
                // the next one gets its chance.
                tracing::debug!("NDI send skipped a frame: {e}");
                false
            }
        }
    }
}

/// A factory producing a fresh sender (and runtime reference) per
/// pipeline initialisation.
pub fn ndi_sink_factory(ndi_name: String) -> SinkFactory {
    Box::new(move || {
        let runtime = NdiRuntime::acquire().map_err(|e| e.to_string())?;
        let sender = NdiSender::new(runtime, &ndi_name).map_err(|e| e.to_string())?;
        Ok(Box::new(NdiFrameSink { sender }) as Box<dyn FrameSink>)
    })
}
