//! NDI send wrapper: one sender instance per bridge.

use std::ffi::CString;

use bridge_convert::PixelFormat;

use crate::ffi::{
    NDIlib_FourCC_video_type_e as FourCC, NDIlib_frame_format_type_e, NDIlib_send_create_t,
    NDIlib_send_instance_t, NDIlib_video_frame_v2_t, NDILIB_SEND_TIMECODE_SYNTHESIZE,
};
use crate::{NdiError, NdiRuntime};

const CONNECTION_QUERY_TIMEOUT_MS: u32 = 5000;

/// One video frame handed to [`NdiSender::send_video`].
#[derive(Debug, Clone, Copy)]
pub struct VideoFrameInfo<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixel_format: PixelFormat,
    pub fps_num: u32,
    pub fps_den: u32,
    pub timestamp_ns: i64,
    pub interlaced: bool,
}

/// An NDI sender. Video is clocked by the SDK; audio is not sent.
pub struct NdiSender {
    runtime: NdiRuntime,
    instance: NDIlib_send_instance_t,
    name: String,
    frames_sent: u64,
    /// Reused staging buffer for the inline YUYV -> UYVY repack.
    repack: Vec<u8>,
}

// SAFETY: the SDK documents send instances as safe to use from one
// thread at a time; NdiSender is owned by a single capture pipeline.
unsafe impl Send for NdiSender {}

impl NdiSender {
    /// Create a sender broadcasting under `name`.
    pub fn new(runtime: NdiRuntime, name: &str) -> Result<Self, NdiError> {
        let c_name =
            CString::new(name).map_err(|_| NdiError::InvalidName(name.to_string()))?;
        let create = NDIlib_send_create_t {
            p_ndi_name: c_name.as_ptr(),
            p_groups: std::ptr::null(),
            clock_video: true,
            clock_audio: false,
        };
        // SAFETY: create struct and name outlive the call.
        let instance = unsafe { (runtime.lib().send_create)(&create) };
        if instance.is_null() {
            return Err(NdiError::CreateFailed("sender"));
        }
        tracing::info!("NDI sender '{name}' created");
        Ok(Self {
            runtime,
            instance,
            name: name.to_string(),
            frames_sent: 0,
            repack: Vec::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Send one frame. YUYV input is repacked inline to UYVY; the SDK
    /// call itself carries no delivery guarantee, completion counts as
    /// success.
    pub fn send_video(&mut self, info: &VideoFrameInfo<'_>) -> Result<(), NdiError> {
        let (fourcc, data, stride) = match info.pixel_format {
            PixelFormat::Uyvy => (FourCC::UYVY, info.data, info.stride),
            PixelFormat::Bgra => (FourCC::BGRA, info.data, info.stride),
            PixelFormat::Yuyv => {
                let len = (info.width * info.height * 2) as usize;
                self.repack.resize(len, 0);
                bridge_convert::yuyv_to_uyvy(
                    info.data,
                    info.width,
                    info.height,
                    info.stride,
                    &mut self.repack,
                )
                .map_err(|_| NdiError::UnsupportedFormat(info.pixel_format))?;
                (FourCC::UYVY, self.repack.as_slice(), info.width * 2)
            }
            other => return Err(NdiError::UnsupportedFormat(other)),
        };

        let frame = NDIlib_video_frame_v2_t {
            xres: info.width as i32,
            yres: info.height as i32,
            FourCC: fourcc,
            frame_rate_N: info.fps_num as i32,
            frame_rate_D: info.fps_den.max(1) as i32,
            picture_aspect_ratio: info.width as f32 / info.height.max(1) as f32,
            frame_format_type: if info.interlaced {
                NDIlib_frame_format_type_e::Interlaced
            } else {
                NDIlib_frame_format_type_e::Progressive
            },
            timecode: NDILIB_SEND_TIMECODE_SYNTHESIZE,
            p_data: data.as_ptr().cast_mut(),
            line_stride_in_bytes: stride as i32,
            p_metadata: std::ptr::null(),
            timestamp: info.timestamp_ns / 100,
        };

        // SAFETY: synchronous send; the SDK copies before returning.
        unsafe { (self.runtime.lib().send_send_video_v2)(self.instance, &frame) };
        self.frames_sent += 1;
        Ok(())
    }

    /// Number of connected receivers, querying the SDK with a 5 s cap.
    #[must_use]
    pub fn connection_count(&self) -> i32 {
        // SAFETY: valid instance for the lifetime of self.
        unsafe {
            (self.runtime.lib().send_get_no_connections)(
                self.instance,
                CONNECTION_QUERY_TIMEOUT_MS,
            )
        }
    }
}

impl Drop for NdiSender {
    fn drop(&mut self) {
        tracing::debug!("destroying NDI sender '{}'", self.name);
        // SAFETY: instance created in new(), destroyed exactly once.
        unsafe { (self.runtime.lib().send_destroy)(self.instance) };
    }
}
