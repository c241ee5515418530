use std::path::Path;

use glam::{Vec3, Vec4};
use image::{ImageBuffer, Rgba, RgbaImage};

use super::Exporter;
use crate::raytracer::error::{FrameBufferError, Result};
use crate::raytracer::framebuffer::color::{encode_rgba8, encode_srgba};
use crate::raytracer::framebuffer::{Channel, ChannelData, FrameBuffer};

/// Writes one mapped channel of a frame buffer to an 8-bit PNG.
///
/// Color is written as stored (8-bit formats) or sRGB-encoded (float formats).
/// Depth is normalised over its finite range with misses in white; normals
/// are remapped from `[-1, 1]`; IDs are hashed to flat colors.
#[derive(Clone, Copy, Debug)]
pub struct PngExporter {
    channel: Channel,
}

impl PngExporter {
    pub fn color() -> Self {
        Self { channel: Channel::Color }
    }

    pub fn channel(channel: Channel) -> Self {
        Self { channel }
    }

    fn render(&self, data: ChannelData<'_>, width: u32, height: u32) -> RgbaImage {
        let pixel = |x: u32, y: u32| (y * width + x) as usize;
        match data {
            ChannelData::Color8(c) => ImageBuffer::from_fn(width, height, |x, y| Rgba(c[pixel(x, y)])),
            ChannelData::Rgba32f(c) => {
                let encode = if self.channel == Channel::Variance {
                    encode_rgba8
                } else {
                    encode_srgba
                };
                ImageBuffer::from_fn(width, height, |x, y| Rgba(encode(c[pixel(x, y)])))
            }
            ChannelData::Depth(d) => {
                let (min, max) = d
                    .iter()
                    .filter(|v| v.is_finite())
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
                let scale = if max > min { 1.0 / (max - min) } else { 0.0 };
                ImageBuffer::from_fn(width, height, |x, y| {
                    let v = d[pixel(x, y)];
                    let z = if v.is_finite() { (v - min) * scale } else { 1.0 };
                    Rgba(encode_rgba8(Vec4::new(z, z, z, 1.0)))
                })
            }
            ChannelData::Vec3(v) => {
                let remap = self.channel == Channel::Normal;
                ImageBuffer::from_fn(width, height, |x, y| {
                    let c = v[pixel(x, y)];
                    let c = if remap { c * 0.5 + Vec3::splat(0.5) } else { c };
                    Rgba(encode_rgba8(c.extend(1.0)))
                })
            }
            ChannelData::Id(ids) => ImageBuffer::from_fn(width, height, |x, y| Rgba(id_color(ids[pixel(x, y)]))),
        }
    }
}

fn id_color(id: u32) -> [u8; 4] {
    if id == u32::MAX {
        return [0, 0, 0, 255];
    }
    let h = id.wrapping_mul(0x9E37_79B9).rotate_left(13) ^ 0x5bd1_e995;
    [(h >> 16) as u8, (h >> 8) as u8, h as u8, 255]
}

impl Exporter for PngExporter {
    fn export(&self, framebuffer: &dyn FrameBuffer, path: &Path) -> Result<()> {
        let size = framebuffer.size();
        let mapped = framebuffer
            .map_buffer(self.channel)
            .ok_or(FrameBufferError::ChannelUnavailable(self.channel))?;
        let image = self.render(mapped.data(), size.x, size.y);
        framebuffer.unmap(mapped);
        image.save(path)?;
        log::info!("wrote {:?} channel to {}", self.channel, path.display());
        Ok(())
    }
}
