//! AVX2 conversion kernels, 16 source pixels per iteration.
//!
//! The arithmetic mirrors the scalar kernels exactly: products are formed
//! with `madd_epi16` coefficient pairs at full 32-bit precision, the +128
//! rounding bias is applied before the arithmetic shift, and clamping uses
//! 16-bit min/max. Width tails re-enter the scalar row helpers at the
//! aligned column so every byte matches the scalar output.

use std::arch::x86_64::*;

use crate::format::Coefficients;
use crate::scalar;

/// Pack two i16 coefficients into the i32 lane layout `madd_epi16` expects.
#[inline]
fn pair(lo: i32, hi: i32) -> i32 {
    ((hi as i16 as u16 as u32) << 16 | (lo as i16 as u16 as u32)) as i32
}

struct Kernel {
    ce_r: __m256i,
    cd_g: __m256i,
    e1_g: __m256i,
    cd_b: __m256i,
    bias: __m256i,
    ones: __m256i,
    y_off: __m256i,
    uv_off: __m256i,
    zero: __m256i,
    max: __m256i,
    alpha: __m256i,
}

impl Kernel {
    #[target_feature(enable = "avx2")]
    unsafe fn new(co: &Coefficients) -> Self {
        Self {
            ce_r: _mm256_set1_epi32(pair(co.y, co.v_r)),
            cd_g: _mm256_set1_epi32(pair(co.y, co.u_g)),
            e1_g: _mm256_set1_epi32(pair(co.v_g, 128)),
            cd_b: _mm256_set1_epi32(pair(co.y, co.u_b)),
            bias: _mm256_set1_epi32(128),
            ones: _mm256_set1_epi16(1),
            y_off: _mm256_set1_epi16(16),
            uv_off: _mm256_set1_epi16(128),
            zero: _mm256_setzero_si256(),
            max: _mm256_set1_epi16(255),
            alpha: _mm256_set1_epi16(-256),
        }
    }

    /// madd both pair registers, bias, shift, and repack to 16 in-order i16.
    #[target_feature(enable = "avx2")]
    unsafe fn channel2(&self, lo: __m256i, hi: __m256i, coeff: __m256i) -> __m256i {
        let lo32 = _mm256_srai_epi32(
            _mm256_add_epi32(_mm256_madd_epi16(lo, coeff), self.bias),
            8,
        );
        let hi32 = _mm256_srai_epi32(
            _mm256_add_epi32(_mm256_madd_epi16(hi, coeff), self.bias),
            8,
        );
        _mm256_packs_epi32(lo32, hi32)
    }

    /// Convert 16 pixels of widened YUV (4:4:4) and store 64 BGRA bytes.
    #[target_feature(enable = "avx2")]
    unsafe fn store16(&self, y: __m128i, u: __m128i, v: __m128i, dst: *mut u8) {
        let c = _mm256_sub_epi16(_mm256_cvtepu8_epi16(y), self.y_off);
        let d = _mm256_sub_epi16(_mm256_cvtepu8_epi16(u), self.uv_off);
        let e = _mm256_sub_epi16(_mm256_cvtepu8_epi16(v), self.uv_off);

        let ce_lo = _mm256_unpacklo_epi16(c, e);
        let ce_hi = _mm256_unpackhi_epi16(c, e);
        let cd_lo = _mm256_unpacklo_epi16(c, d);
        let cd_hi = _mm256_unpackhi_epi16(c, d);
        let e1_lo = _mm256_unpacklo_epi16(e, self.ones);
        let e1_hi = _mm256_unpackhi_epi16(e, self.ones);

        let r = self.channel2(ce_lo, ce_hi, self.ce_r);
        let b = self.channel2(cd_lo, cd_hi, self.cd_b);
        // G carries the bias through the second madd pair (v_g, 128).
        let g_lo = _mm256_srai_epi32(
            _mm256_add_epi32(
                _mm256_madd_epi16(cd_lo, self.cd_g),
                _mm256_madd_epi16(e1_lo, self.e1_g),
            ),
            8,
        );
        let g_hi = _mm256_srai_epi32(
            _mm256_add_epi32(
                _mm256_madd_epi16(cd_hi, self.cd_g),
                _mm256_madd_epi16(e1_hi, self.e1_g),
            ),
            8,
        );
        let g = _mm256_packs_epi32(g_lo, g_hi);

        let r = _mm256_min_epi16(_mm256_max_epi16(r, self.zero), self.max);
        let g = _mm256_min_epi16(_mm256_max_epi16(g, self.zero), self.max);
        let b = _mm256_min_epi16(_mm256_max_epi16(b, self.zero), self.max);

        // 16-bit BG and RA words, then interleave into 32-bit BGRA pixels.
        let bg = _mm256_or_si256(b, _mm256_slli_epi16(g, 8));
        let ra = _mm256_or_si256(r, self.alpha);
        let lo = _mm256_unpacklo_epi16(bg, ra); // px 0-3 | 8-11
        let hi = _mm256_unpackhi_epi16(bg, ra); // px 4-7 | 12-15
        let out0 = _mm256_permute2x128_si256(lo, hi, 0x20);
        let out1 = _mm256_permute2x128_si256(lo, hi, 0x31);
        _mm256_storeu_si256(dst.cast::<__m256i>(), out0);
        _mm256_storeu_si256(dst.add(32).cast::<__m256i>(), out1);
    }
}

/// Gather one component from a 32-byte 4:2:2 chunk into 16 contiguous
/// bytes. The shuffle runs per 128-bit lane (8 pixels each), the 64-bit
/// permute stitches the two lane-local halves back into order.
#[target_feature(enable = "avx2")]
unsafe fn gather(chunk: __m256i, mask: __m256i) -> __m128i {
    let lanes = _mm256_shuffle_epi8(chunk, mask);
    _mm256_castsi256_si128(_mm256_permute4x64_epi64(lanes, 0xE8))
}

#[target_feature(enable = "avx2")]
unsafe fn lane_mask(idx: [i8; 8]) -> __m256i {
    let z = -128i8;
    _mm256_setr_epi8(
        idx[0], idx[1], idx[2], idx[3], idx[4], idx[5], idx[6], idx[7], z, z, z, z, z, z, z, z,
        idx[0], idx[1], idx[2], idx[3], idx[4], idx[5], idx[6], idx[7], z, z, z, z, z, z, z, z,
    )
}

/// UYVY or YUYV (when `swapped`) to packed BGRA, 16 pixels per iteration.
#[target_feature(enable = "avx2")]
pub(crate) unsafe fn packed422_to_bgra(
    src: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    swapped: bool,
    co: &Coefficients,
    dst: &mut [u8],
) {
    let kernel = Kernel::new(co);
    let (y_mask, u_mask, v_mask) = if swapped {
        (
            lane_mask([0, 2, 4, 6, 8, 10, 12, 14]),
            lane_mask([1, 1, 5, 5, 9, 9, 13, 13]),
            lane_mask([3, 3, 7, 7, 11, 11, 15, 15]),
        )
    } else {
        (
            lane_mask([1, 3, 5, 7, 9, 11, 13, 15]),
            lane_mask([0, 0, 4, 4, 8, 8, 12, 12]),
            lane_mask([2, 2, 6, 6, 10, 10, 14, 14]),
        )
    };

    let aligned = width - width % 16;
    for row in 0..height {
        let src_row = src.as_ptr().add(row * stride);
        let dst_row = dst.as_mut_ptr().add(row * width * 4);
        let mut x = 0;
        while x < aligned {
            let chunk = _mm256_loadu_si256(src_row.add(x * 2).cast::<__m256i>());
            kernel.store16(
                gather(chunk, y_mask),
                gather(chunk, u_mask),
                gather(chunk, v_mask),
                dst_row.add(x * 4),
            );
            x += 16;
        }
    }
    if aligned < width {
        scalar::packed422_rows(src, width, height, stride, aligned, swapped, co, dst);
    }
}

/// NV12 to packed BGRA, two luma rows against one chroma row.
#[target_feature(enable = "avx2")]
pub(crate) unsafe fn nv12_to_bgra(
    src: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    co: &Coefficients,
    dst: &mut [u8],
) {
    let kernel = Kernel::new(co);
    let u_mask = _mm_setr_epi8(0, 0, 2, 2, 4, 4, 6, 6, 8, 8, 10, 10, 12, 12, 14, 14);
    let v_mask = _mm_setr_epi8(1, 1, 3, 3, 5, 5, 7, 7, 9, 9, 11, 11, 13, 13, 15, 15);

    let uv_offset = stride * height;
    let aligned = width - width % 16;
    for row in (0..height).step_by(2) {
        let y_row0 = src.as_ptr().add(row * stride);
        let y_row1 = src.as_ptr().add((row + 1) * stride);
        let uv_row = src.as_ptr().add(uv_offset + (row / 2) * stride);
        let dst_row0 = dst.as_mut_ptr().add(row * width * 4);
        let dst_row1 = dst.as_mut_ptr().add((row + 1) * width * 4);

        let mut x = 0;
        while x < aligned {
            let uv = _mm_loadu_si128(uv_row.add(x).cast::<__m128i>());
            let u = _mm_shuffle_epi8(uv, u_mask);
            let v = _mm_shuffle_epi8(uv, v_mask);
            let y0 = _mm_loadu_si128(y_row0.add(x).cast::<__m128i>());
            let y1 = _mm_loadu_si128(y_row1.add(x).cast::<__m128i>());
            kernel.store16(y0, u, v, dst_row0.add(x * 4));
            kernel.store16(y1, u, v, dst_row1.add(x * 4));
            x += 16;
        }
    }
    if aligned < width {
        scalar::nv12_rows(src, width, height, stride, aligned, co, dst);
    }
}

/// Byte-swap 16-bit pairs: YUYV rows become UYVY rows.
#[target_feature(enable = "avx2")]
pub(crate) unsafe fn swap_pairs(
    src: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    dst: &mut [u8],
) {
    let mask = _mm256_setr_epi8(
        1, 0, 3, 2, 5, 4, 7, 6, 9, 8, 11, 10, 13, 12, 15, 14, 1, 0, 3, 2, 5, 4, 7, 6, 9, 8, 11,
        10, 13, 12, 15, 14,
    );
    let aligned = width - width % 16;
    for row in 0..height {
        let src_row = src.as_ptr().add(row * stride);
        let dst_row = dst.as_mut_ptr().add(row * width * 2);
        let mut x = 0;
        while x < aligned {
            let chunk = _mm256_loadu_si256(src_row.add(x * 2).cast::<__m256i>());
            _mm256_storeu_si256(
                dst_row.add(x * 2).cast::<__m256i>(),
                _mm256_shuffle_epi8(chunk, mask),
            );
            x += 16;
        }
    }
    if aligned < width {
        scalar::swap_pairs_rows(src, width, height, stride, aligned, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Coefficients, PixelFormat};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn avx2() -> bool {
        std::arch::is_x86_feature_detected!("avx2")
    }

    fn scalar_bgra(src: &[u8], w: usize, h: usize, fmt: PixelFormat) -> Vec<u8> {
        let co = Coefficients::BT601;
        let mut dst = vec![0u8; w * h * 4];
        match fmt {
            PixelFormat::Uyvy => scalar::packed422_to_bgra(src, w, h, w * 2, false, &co, &mut dst),
            PixelFormat::Yuyv => scalar::packed422_to_bgra(src, w, h, w * 2, true, &co, &mut dst),
            PixelFormat::Nv12 => scalar::nv12_to_bgra(src, w, h, w, &co, &mut dst),
            _ => unreachable!(),
        }
        dst
    }

    fn simd_bgra(src: &[u8], w: usize, h: usize, fmt: PixelFormat) -> Vec<u8> {
        let co = Coefficients::BT601;
        let mut dst = vec![0u8; w * h * 4];
        unsafe {
            match fmt {
                PixelFormat::Uyvy => packed422_to_bgra(src, w, h, w * 2, false, &co, &mut dst),
                PixelFormat::Yuyv => packed422_to_bgra(src, w, h, w * 2, true, &co, &mut dst),
                PixelFormat::Nv12 => nv12_to_bgra(src, w, h, w, &co, &mut dst),
                _ => unreachable!(),
            }
        }
        dst
    }

    #[test]
    fn simd_matches_scalar_full_hd_gradient() {
        if !avx2() {
            return;
        }
        let (w, h) = (1920usize, 32usize);
        let src: Vec<u8> = (0..w * h * 2).map(|i| (i * 7 % 251) as u8).collect();
        assert_eq!(
            simd_bgra(&src, w, h, PixelFormat::Uyvy),
            scalar_bgra(&src, w, h, PixelFormat::Uyvy)
        );
    }

    #[test]
    fn simd_matches_scalar_on_tails() {
        if !avx2() {
            return;
        }
        // Widths that leave 2..14 pixel tails after the 16-wide loop.
        for w in [18usize, 30, 46, 1282] {
            let h = 4usize;
            let src: Vec<u8> = (0..w * h * 2).map(|i| (i * 13 % 255) as u8).collect();
            assert_eq!(
                simd_bgra(&src, w, h, PixelFormat::Yuyv),
                scalar_bgra(&src, w, h, PixelFormat::Yuyv),
                "width {w}"
            );
        }
    }

    #[test]
    fn simd_matches_scalar_nv12() {
        if !avx2() {
            return;
        }
        for w in [32usize, 48, 50] {
            let h = 8usize;
            let src: Vec<u8> = (0..w * h * 3 / 2).map(|i| (i * 11 % 253) as u8).collect();
            assert_eq!(
                simd_bgra(&src, w, h, PixelFormat::Nv12),
                scalar_bgra(&src, w, h, PixelFormat::Nv12),
                "width {w}"
            );
        }
    }

    #[test]
    fn swap_pairs_matches_scalar() {
        if !avx2() {
            return;
        }
        let (w, h) = (50usize, 3usize);
        let src: Vec<u8> = (0..w * h * 2).map(|i| i as u8).collect();
        let mut simd = vec![0u8; w * h * 2];
        let mut reference = vec![0u8; w * h * 2];
        unsafe { swap_pairs(&src, w, h, w * 2, &mut simd) };
        scalar::swap_pairs(&src, w, h, w * 2, &mut reference);
        assert_eq!(simd, reference);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn simd_equivalence_random(data in proptest::collection::vec(0u8..=255, 16 * 2 * 2)) {
            if !avx2() {
                return Ok(());
            }
            let (w, h) = (16usize, 2usize);
            prop_assert_eq!(
                simd_bgra(&data, w, h, PixelFormat::Uyvy),
                scalar_bgra(&data, w, h, PixelFormat::Uyvy)
            );
        }
    }
}
