// Pixel format conversion for the NDI bridge.
//
// - format.rs: pixel format tags and colour space detection
// - scalar.rs: portable integer conversion kernels
// - avx2.rs: 16-pixel-at-a-time AVX2 kernels (x86_64 only)
//
// The public entry points dispatch to AVX2 when the CPU supports it and
// fall back to the scalar kernels otherwise. Both paths produce identical
// output byte-for-byte.

mod format;
mod scalar;

#[cfg(target_arch = "x86_64")]
mod avx2;

pub use format::{ColorInfo, ColorRange, ColorSpace, Coefficients, PixelFormat};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(PixelFormat),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("destination too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}

/// Size in bytes of a BGRA image at the given dimensions.
#[must_use]
pub fn bgra_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

/// Convert a frame to tightly packed BGRA (stride = width * 4, alpha 255).
///
/// `src_stride` is the source row pitch in bytes. For NV12 the UV plane is
/// expected at `src[src_stride * height..]` with the same pitch.
///
/// # Errors
///
/// `InvalidArgument` on zero dimensions or short buffers,
/// `UnsupportedFormat` for MJPEG and unknown tags. Never panics.
pub fn convert_to_bgra(
    src: &[u8],
    width: u32,
    height: u32,
    src_stride: u32,
    format: PixelFormat,
    color: ColorInfo,
    dst: &mut [u8],
) -> Result<(), ConvertError> {
    if width == 0 || height == 0 {
        return Err(ConvertError::InvalidArgument("zero dimension"));
    }
    let need = bgra_size(width, height);
    if dst.len() < need {
        return Err(ConvertError::BufferTooSmall {
            need,
            have: dst.len(),
        });
    }

    let w = width as usize;
    let h = height as usize;
    let stride = if src_stride == 0 {
        w * format.bytes_per_pixel().max(1)
    } else {
        src_stride as usize
    };

    match format {
        PixelFormat::Bgra => {
            let min = stride * (h - 1) + w * 4;
            if src.len() < min {
                return Err(ConvertError::InvalidArgument("source too small"));
            }
            for y in 0..h {
                let src_row = &src[y * stride..y * stride + w * 4];
                dst[y * w * 4..(y + 1) * w * 4].copy_from_slice(src_row);
            }
            Ok(())
        }
        PixelFormat::Rgb24 => {
            let min = stride * (h - 1) + w * 3;
            if src.len() < min {
                return Err(ConvertError::InvalidArgument("source too small"));
            }
            scalar::rgb24_to_bgra(src, w, h, stride, dst);
            Ok(())
        }
        PixelFormat::Uyvy | PixelFormat::Yuyv => {
            let min = stride * (h - 1) + w * 2;
            if src.len() < min {
                return Err(ConvertError::InvalidArgument("source too small"));
            }
            let co = color.coefficients();
            let swapped = format == PixelFormat::Yuyv;
            #[cfg(target_arch = "x86_64")]
            if std::arch::is_x86_feature_detected!("avx2") {
                // SAFETY: AVX2 support was just verified at runtime.
                unsafe { avx2::packed422_to_bgra(src, w, h, stride, swapped, &co, dst) };
                return Ok(());
            }
            scalar::packed422_to_bgra(src, w, h, stride, swapped, &co, dst);
            Ok(())
        }
        PixelFormat::Nv12 => {
            if height % 2 != 0 {
                return Err(ConvertError::InvalidArgument("odd height for NV12"));
            }
            let min = stride * h + stride * (h / 2 - 1) + w;
            if src.len() < min {
                return Err(ConvertError::InvalidArgument("source too small"));
            }
            let co = color.coefficients();
            #[cfg(target_arch = "x86_64")]
            if std::arch::is_x86_feature_detected!("avx2") {
                // SAFETY: AVX2 support was just verified at runtime.
                unsafe { avx2::nv12_to_bgra(src, w, h, stride, &co, dst) };
                return Ok(());
            }
            scalar::nv12_to_bgra(src, w, h, stride, &co, dst);
            Ok(())
        }
        PixelFormat::Yuv420 | PixelFormat::Mjpeg | PixelFormat::Unknown => {
            Err(ConvertError::UnsupportedFormat(format))
        }
    }
}

/// Repack YUYV into UYVY in place of a separate conversion, swapping the
/// luma and chroma byte positions within each pixel pair.
///
/// Used on the NDI send hot path, so the AVX2 shuffle is preferred.
///
/// # Errors
///
/// `InvalidArgument` on zero dimensions or short buffers.
pub fn yuyv_to_uyvy(
    src: &[u8],
    width: u32,
    height: u32,
    src_stride: u32,
    dst: &mut [u8],
) -> Result<(), ConvertError> {
    if width == 0 || height == 0 {
        return Err(ConvertError::InvalidArgument("zero dimension"));
    }
    let w = width as usize;
    let h = height as usize;
    let stride = if src_stride == 0 { w * 2 } else { src_stride as usize };
    let need = w * h * 2;
    if dst.len() < need {
        return Err(ConvertError::BufferTooSmall {
            need,
            have: dst.len(),
        });
    }
    if src.len() < stride * (h - 1) + w * 2 {
        return Err(ConvertError::InvalidArgument("source too small"));
    }

    #[cfg(target_arch = "x86_64")]
    if std::arch::is_x86_feature_detected!("avx2") {
        // SAFETY: AVX2 support was just verified at runtime.
        unsafe { avx2::swap_pairs(src, w, h, stride, dst) };
        return Ok(());
    }
    scalar::swap_pairs(src, w, h, stride, dst);
    Ok(())
}

/// Upsample NV12 into packed UYVY: each chroma pair covers a 2x2 block,
/// so it is repeated across the two luma rows.
///
/// # Errors
///
/// `InvalidArgument` on zero or odd dimensions and short buffers.
pub fn nv12_to_uyvy(
    src: &[u8],
    width: u32,
    height: u32,
    src_stride: u32,
    dst: &mut [u8],
) -> Result<(), ConvertError> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(ConvertError::InvalidArgument("bad NV12 dimensions"));
    }
    let w = width as usize;
    let h = height as usize;
    let stride = if src_stride == 0 { w } else { src_stride as usize };
    let need = w * h * 2;
    if dst.len() < need {
        return Err(ConvertError::BufferTooSmall {
            need,
            have: dst.len(),
        });
    }
    if src.len() < stride * h * 3 / 2 {
        return Err(ConvertError::InvalidArgument("source too small"));
    }

    let uv_plane = &src[stride * h..];
    for y in 0..h {
        let y_row = &src[y * stride..];
        let uv_row = &uv_plane[(y / 2) * stride..];
        let dst_row = &mut dst[y * w * 2..(y + 1) * w * 2];
        for x in (0..w).step_by(2) {
            dst_row[x * 2] = uv_row[x];
            dst_row[x * 2 + 1] = y_row[x];
            dst_row[x * 2 + 2] = uv_row[x + 1];
            dst_row[x * 2 + 3] = y_row[x + 1];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn bgra_of(src: &[u8], w: u32, h: u32, fmt: PixelFormat) -> Vec<u8> {
        let mut dst = vec![0u8; bgra_size(w, h)];
        convert_to_bgra(src, w, h, 0, fmt, ColorInfo::default(), &mut dst).unwrap();
        dst
    }

    #[test]
    fn rejects_zero_dimensions() {
        let mut dst = [0u8; 16];
        let err = convert_to_bgra(&[0; 16], 0, 1, 0, PixelFormat::Uyvy, ColorInfo::default(), &mut dst);
        assert_eq!(err, Err(ConvertError::InvalidArgument("zero dimension")));
    }

    #[test]
    fn rejects_mjpeg() {
        let mut dst = [0u8; 16];
        let err = convert_to_bgra(&[0; 16], 2, 1, 0, PixelFormat::Mjpeg, ColorInfo::default(), &mut dst);
        assert_eq!(err, Err(ConvertError::UnsupportedFormat(PixelFormat::Mjpeg)));
    }

    #[test]
    fn rejects_short_destination() {
        let mut dst = [0u8; 4];
        let err = convert_to_bgra(&[0; 8], 2, 1, 0, PixelFormat::Uyvy, ColorInfo::default(), &mut dst);
        assert!(matches!(err, Err(ConvertError::BufferTooSmall { .. })));
    }

    #[test]
    fn bgra_input_is_identity() {
        let src: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
        assert_eq!(bgra_of(&src, 4, 4, PixelFormat::Bgra), src);
    }

    #[test]
    fn uyvy_black_and_white_literals() {
        // Limited-range black (16) and white (235), neutral chroma.
        let black = [128u8, 16, 128, 16];
        let out = bgra_of(&black, 2, 1, PixelFormat::Uyvy);
        assert_eq!(out, [0, 0, 0, 255, 0, 0, 0, 255]);

        let white = [128u8, 235, 128, 235];
        let out = bgra_of(&white, 2, 1, PixelFormat::Uyvy);
        for px in out.chunks_exact(4) {
            assert!(px[0] >= 254 && px[1] >= 254 && px[2] >= 254);
            assert_eq!(px[3], 255);
        }
    }

    #[test]
    fn nv12_repack_duplicates_chroma_rows() {
        // 2x2 NV12: Y = [1,2,3,4], UV = [10, 20]. Both output rows carry
        // the same chroma pair.
        let src = [1u8, 2, 3, 4, 10, 20];
        let mut dst = [0u8; 8];
        nv12_to_uyvy(&src, 2, 2, 0, &mut dst).unwrap();
        assert_eq!(dst, [10, 1, 20, 2, 10, 3, 20, 4]);
    }

    #[test]
    fn yuyv_repack_swaps_pairs() {
        let yuyv = [10u8, 20, 30, 40, 50, 60, 70, 80];
        let mut uyvy = [0u8; 8];
        yuyv_to_uyvy(&yuyv, 4, 1, 0, &mut uyvy).unwrap();
        assert_eq!(uyvy, [20, 10, 40, 30, 60, 50, 80, 70]);
    }

    proptest! {
        // Every output channel stays in range and alpha is constant 255.
        #[test]
        fn output_always_clamped(y in 0u8..=255, u in 0u8..=255, v in 0u8..=255) {
            let src = [u, y, v, y];
            let out = bgra_of(&src, 2, 1, PixelFormat::Uyvy);
            for px in out.chunks_exact(4) {
                prop_assert_eq!(px[3], 255);
            }
        }

        // UYVY and YUYV agree when fed byte-swapped input.
        #[test]
        fn packed422_parity(data in proptest::collection::vec(0u8..=255, 64)) {
            let w = 16u32;
            let uyvy = bgra_of(&data, w, 2, PixelFormat::Uyvy);
            let mut swapped = data.clone();
            for pair in swapped.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
            let yuyv = bgra_of(&swapped, w, 2, PixelFormat::Yuyv);
            prop_assert_eq!(uyvy, yuyv);
        }
    }
}
