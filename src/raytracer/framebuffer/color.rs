use glam::Vec4;

use super::ColorFormat;

#[inline]
pub fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.0031308 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

#[inline]
fn unorm8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// Linear RGBA quantised to 8 bits per channel.
#[inline]
pub fn encode_rgba8(color: Vec4) -> [u8; 4] {
    [unorm8(color.x), unorm8(color.y), unorm8(color.z), unorm8(color.w)]
}

/// sRGB-encoded color with linear alpha.
#[inline]
pub fn encode_srgba(color: Vec4) -> [u8; 4] {
    [
        unorm8(linear_to_srgb(color.x.clamp(0.0, 1.0))),
        unorm8(linear_to_srgb(color.y.clamp(0.0, 1.0))),
        unorm8(linear_to_srgb(color.z.clamp(0.0, 1.0))),
        unorm8(color.w),
    ]
}

/// Encodes a run of float colors into the 8-bit `dst` for the given format.
/// Float formats keep their data in the float buffer and are left untouched.
pub fn encode_into(format: ColorFormat, src: &[Vec4], dst: &mut [[u8; 4]]) {
    debug_assert_eq!(src.len(), dst.len());
    match format {
        ColorFormat::Rgba8 => {
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = encode_rgba8(s);
            }
        }
        ColorFormat::Srgba => {
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = encode_srgba(s);
            }
        }
        ColorFormat::Rgba32f | ColorFormat::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba8_clamps_and_rounds() {
        assert_eq!(encode_rgba8(Vec4::new(0.5, 2.0, -1.0, 1.0)), [128, 255, 0, 255]);
    }

    #[test]
    fn test_srgba_keeps_alpha_linear() {
        let encoded = encode_srgba(Vec4::new(0.5, 0.0, 1.0, 0.5));
        assert_eq!(encoded[0], 188);
        assert_eq!(encoded[1], 0);
        assert_eq!(encoded[2], 255);
        assert_eq!(encoded[3], 128);
    }
}
