//! Raw NDI SDK types and the runtime-loaded entry point table.
//!
//! Layouts follow `Processing.NDI.Lib.h` (SDK v5/v6); only the calls the
//! bridge uses are resolved.

#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, c_int, c_void};
use std::ptr;

use libloading::Library;

pub type NDIlib_find_instance_t = *mut c_void;
pub type NDIlib_recv_instance_t = *mut c_void;
pub type NDIlib_send_instance_t = *mut c_void;

/// Tells the SDK to synthesize the timecode itself.
pub const NDILIB_SEND_TIMECODE_SYNTHESIZE: i64 = i64::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NDIlib_frame_type_e {
    None = 0,
    Video = 1,
    Audio = 2,
    Metadata = 3,
    Error = 4,
    StatusChange = 100,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NDIlib_FourCC_video_type_e {
    UYVY = 0x5956_5955,
    UYVA = 0x4156_5955,
    P216 = 0x3631_3250,
    PA16 = 0x3631_4150,
    YV12 = 0x3231_5659,
    I420 = 0x3032_3449,
    NV12 = 0x3231_564E,
    BGRA = 0x4152_4742,
    BGRX = 0x5852_4742,
    RGBA = 0x4142_4752,
    RGBX = 0x5842_4752,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NDIlib_recv_bandwidth_e {
    MetadataOnly = -10,
    AudioOnly = 10,
    Lowest = 0,
    Highest = 100,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NDIlib_recv_color_format_e {
    BGRX_BGRA = 0,
    UYVY_BGRA = 1,
    RGBX_RGBA = 2,
    UYVY_RGBA = 3,
    Fastest = 100,
    Best = 101,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NDIlib_frame_format_type_e {
    Interlaced = 0,
    Progressive = 1,
    Field0 = 2,
    Field1 = 3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NDIlib_source_t {
    pub p_ndi_name: *const c_char,
    pub p_url_address: *const c_char,
}

impl Default for NDIlib_source_t {
    fn default() -> Self {
        Self {
            p_ndi_name: ptr::null(),
            p_url_address: ptr::null(),
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct NDIlib_find_create_t {
    pub show_local_sources: bool,
    pub p_groups: *const c_char,
    pub p_extra_ips: *const c_char,
}

impl Default for NDIlib_find_create_t {
    fn default() -> Self {
        Self {
            show_local_sources: true,
            p_groups: ptr::null(),
            p_extra_ips: ptr::null(),
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct NDIlib_send_create_t {
    pub p_ndi_name: *const c_char,
    pub p_groups: *const c_char,
    pub clock_video: bool,
    pub clock_audio: bool,
}

#[repr(C)]
#[derive(Debug)]
pub struct NDIlib_recv_create_v3_t {
    pub source_to_connect_to: NDIlib_source_t,
    pub color_format: NDIlib_recv_color_format_e,
    pub bandwidth: NDIlib_recv_bandwidth_e,
    pub allow_video_fields: bool,
    pub p_ndi_recv_name: *const c_char,
}

#[repr(C)]
#[derive(Debug)]
pub struct NDIlib_video_frame_v2_t {
    pub xres: c_int,
    pub yres: c_int,
    pub FourCC: NDIlib_FourCC_video_type_e,
    pub frame_rate_N: c_int,
    pub frame_rate_D: c_int,
    pub picture_aspect_ratio: f32,
    pub frame_format_type: NDIlib_frame_format_type_e,
    pub timecode: i64,
    pub p_data: *mut u8,
    pub line_stride_in_bytes: c_int,
    pub p_metadata: *const c_char,
    pub timestamp: i64,
}

impl Default for NDIlib_video_frame_v2_t {
    fn default() -> Self {
        Self {
            xres: 0,
            yres: 0,
            FourCC: NDIlib_FourCC_video_type_e::BGRA,
            frame_rate_N: 30000,
            frame_rate_D: 1001,
            picture_aspect_ratio: 0.0,
            frame_format_type: NDIlib_frame_format_type_e::Progressive,
            timecode: NDILIB_SEND_TIMECODE_SYNTHESIZE,
            p_data: ptr::null_mut(),
            line_stride_in_bytes: 0,
            p_metadata: ptr::null(),
            timestamp: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct NDIlib_audio_frame_v2_t {
    pub sample_rate: c_int,
    pub no_channels: c_int,
    pub no_samples: c_int,
    pub timecode: i64,
    /// 32-bit float planar audio.
    pub p_data: *mut f32,
    pub channel_stride_in_bytes: c_int,
    pub p_metadata: *const c_char,
    pub timestamp: i64,
}

impl Default for NDIlib_audio_frame_v2_t {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            no_channels: 2,
            no_samples: 0,
            timecode: NDILIB_SEND_TIMECODE_SYNTHESIZE,
            p_data: ptr::null_mut(),
            channel_stride_in_bytes: 0,
            p_metadata: ptr::null(),
            timestamp: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct NDIlib_audio_frame_interleaved_16s_t {
    pub sample_rate: c_int,
    pub no_channels: c_int,
    pub no_samples: c_int,
    pub timecode: i64,
    pub reference_level: c_int,
    pub p_data: *mut i16,
}

impl Default for NDIlib_audio_frame_interleaved_16s_t {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            no_channels: 2,
            no_samples: 0,
            timecode: 0,
            reference_level: 0,
            p_data: ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct NDIlib_metadata_frame_t {
    pub length: c_int,
    pub timecode: i64,
    pub p_data: *mut c_char,
}

impl Default for NDIlib_metadata_frame_t {
    fn default() -> Self {
        Self {
            length: 0,
            timecode: NDILIB_SEND_TIMECODE_SYNTHESIZE,
            p_data: ptr::null_mut(),
        }
    }
}

/// Resolved SDK entry points. The library handle is kept alive for as
/// long as any runtime reference exists.
pub struct NdiLib {
    _lib: Library,
    pub initialize: unsafe extern "C" fn() -> bool,
    pub destroy: unsafe extern "C" fn(),
    pub version: unsafe extern "C" fn() -> *const c_char,
    pub is_supported_cpu: unsafe extern "C" fn() -> bool,

    pub find_create_v2:
        unsafe extern "C" fn(*const NDIlib_find_create_t) -> NDIlib_find_instance_t,
    pub find_destroy: unsafe extern "C" fn(NDIlib_find_instance_t),
    pub find_wait_for_sources: unsafe extern "C" fn(NDIlib_find_instance_t, u32) -> bool,
    pub find_get_current_sources:
        unsafe extern "C" fn(NDIlib_find_instance_t, *mut u32) -> *const NDIlib_source_t,

    pub send_create: unsafe extern "C" fn(*const NDIlib_send_create_t) -> NDIlib_send_instance_t,
    pub send_destroy: unsafe extern "C" fn(NDIlib_send_instance_t),
    pub send_send_video_v2:
        unsafe extern "C" fn(NDIlib_send_instance_t, *const NDIlib_video_frame_v2_t),
    pub send_get_no_connections: unsafe extern "C" fn(NDIlib_send_instance_t, u32) -> c_int,

    pub recv_create_v3:
        unsafe extern "C" fn(*const NDIlib_recv_create_v3_t) -> NDIlib_recv_instance_t,
    pub recv_destroy: unsafe extern "C" fn(NDIlib_recv_instance_t),
    pub recv_capture_v2: unsafe extern "C" fn(
        NDIlib_recv_instance_t,
        *mut NDIlib_video_frame_v2_t,
        *mut NDIlib_audio_frame_v2_t,
        *mut NDIlib_metadata_frame_t,
        u32,
    ) -> NDIlib_frame_type_e,
    pub recv_free_video_v2:
        unsafe extern "C" fn(NDIlib_recv_instance_t, *const NDIlib_video_frame_v2_t),
    pub recv_free_audio_v2:
        unsafe extern "C" fn(NDIlib_recv_instance_t, *const NDIlib_audio_frame_v2_t),
    pub recv_free_metadata:
        unsafe extern "C" fn(NDIlib_recv_instance_t, *const NDIlib_metadata_frame_t),

    pub util_audio_to_interleaved_16s_v2: unsafe extern "C" fn(
        *const NDIlib_audio_frame_v2_t,
        *mut NDIlib_audio_frame_interleaved_16s_t,
    ),
}

#[cfg(target_os = "linux")]
const LIBRARY_NAMES: &[&str] = &["libndi.so.6", "libndi.so.5", "libndi.so"];
#[cfg(target_os = "macos")]
const LIBRARY_NAMES: &[&str] = &["libndi.dylib"];
#[cfg(windows)]
const LIBRARY_NAMES: &[&str] = &["Processing.NDI.Lib.x64.dll"];

impl NdiLib {
    /// Load the SDK and resolve every entry point the bridge uses.
    pub fn load() -> Result<Self, String> {
        let mut last_error = String::new();
        for name in LIBRARY_NAMES {
            // SAFETY: loading a shared library; symbols are resolved
            // against the documented SDK signatures below.
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    tracing::debug!("loaded NDI runtime from {name}");
                    return unsafe { Self::resolve(lib) };
                }
                Err(e) => last_error = format!("{name}: {e}"),
            }
        }
        Err(format!(
            "no NDI runtime found (install the NDI SDK or runtime): {last_error}"
        ))
    }

    unsafe fn resolve(lib: Library) -> Result<Self, String> {
        unsafe fn sym<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, String> {
            lib.get::<T>(name)
                .map(|s| *s)
                .map_err(|e| format!("missing NDI symbol {}: {e}", String::from_utf8_lossy(name)))
        }

        Ok(Self {
            initialize: sym(&lib, b"NDIlib_initialize\0")?,
            destroy: sym(&lib, b"NDIlib_destroy\0")?,
            version: sym(&lib, b"NDIlib_version\0")?,
            is_supported_cpu: sym(&lib, b"NDIlib_is_supported_CPU\0")?,
            find_create_v2: sym(&lib, b"NDIlib_find_create_v2\0")?,
            find_destroy: sym(&lib, b"NDIlib_find_destroy\0")?,
            find_wait_for_sources: sym(&lib, b"NDIlib_find_wait_for_sources\0")?,
            find_get_current_sources: sym(&lib, b"NDIlib_find_get_current_sources\0")?,
            send_create: sym(&lib, b"NDIlib_send_create\0")?,
            send_destroy: sym(&lib, b"NDIlib_send_destroy\0")?,
            send_send_video_v2: sym(&lib, b"NDIlib_send_send_video_v2\0")?,
            send_get_no_connections: sym(&lib, b"NDIlib_send_get_no_connections\0")?,
            recv_create_v3: sym(&lib, b"NDIlib_recv_create_v3\0")?,
            recv_destroy: sym(&lib, b"NDIlib_recv_destroy\0")?,
            recv_capture_v2: sym(&lib, b"NDIlib_recv_capture_v2\0")?,
            recv_free_video_v2: sym(&lib, b"NDIlib_recv_free_video_v2\0")?,
            recv_free_audio_v2: sym(&lib, b"NDIlib_recv_free_audio_v2\0")?,
            recv_free_metadata: sym(&lib, b"NDIlib_recv_free_metadata\0")?,
            util_audio_to_interleaved_16s_v2: sym(
                &lib,
                b"NDIlib_util_audio_to_interleaved_16s_v2\0",
            )?,
            _lib: lib,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_values_match_the_sdk() {
        assert_eq!(NDIlib_FourCC_video_type_e::UYVY as u32, 0x5956_5955);
        assert_eq!(NDIlib_FourCC_video_type_e::BGRA as u32, 0x4152_4742);
        assert_eq!(NDIlib_FourCC_video_type_e::BGRX as u32, 0x5852_4742);
        assert_eq!(NDIlib_FourCC_video_type_e::RGBA as u32, 0x4142_4752);
    }

    #[test]
    fn frame_type_discriminants() {
        assert_eq!(NDIlib_frame_type_e::None as i32, 0);
        assert_eq!(NDIlib_frame_type_e::Video as i32, 1);
        assert_eq!(NDIlib_frame_type_e::Audio as i32, 2);
        assert_eq!(NDIlib_frame_type_e::Error as i32, 4);
    }

    #[test]
    fn defaults_are_null_safe() {
        let source = NDIlib_source_t::default();
        assert!(source.p_ndi_name.is_null());

        let video = NDIlib_video_frame_v2_t::default();
        assert!(video.p_data.is_null());
        assert_eq!(video.timecode, NDILIB_SEND_TIMECODE_SYNTHESIZE);

        let audio = NDIlib_audio_frame_interleaved_16s_t::default();
        assert!(audio.p_data.is_null());
        assert_eq!(audio.reference_level, 0);
    }
}
