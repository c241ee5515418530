//! Post-processing attached to a frame buffer.
//!
//! Pixel operations run once per tile, after accumulation and before color
//! encoding. Frame operations run once per frame on the whole image, after
//! every tile of the frame is in. Frame operations must form a suffix of the
//! attached list.

mod denoiser;
mod frame_ops;
mod tonemapping;

use std::fmt;

use glam::{UVec2, Vec3, Vec4};

use crate::raytracer::camera::Camera;
use crate::raytracer::error::{FrameBufferError, Result};
use crate::raytracer::framebuffer::{Channel, ChannelFlags, FrameBufferDesc};
use crate::raytracer::tile::Tile;

pub use denoiser::{CrossBilateralDenoiser, DenoiseFrameOp, DenoiseInput, Denoiser};
pub use frame_ops::{BlurFrameOp, DebugFrameOp, DepthFrameOp};
pub use tonemapping::{TileDebugOp, ToneMap, ToneMapOp};

/// Names accepted by [`ImageOpDesc::from_name`].
pub const REGISTERED_IMAGE_OPS: [&str; 6] = [
    "tonemapper",
    "tile_debug",
    "frame_debug",
    "frame_blur",
    "frame_depth",
    "frame_denoise",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageOpKind {
    Pixel,
    Frame,
}

/// Description of an image operation, instantiated at `commit()`.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageOpDesc {
    ToneMapper { tonemap: ToneMap, exposure: f32 },
    /// Adds a constant color to every pixel of a tile.
    TileDebug { add_color: Vec3 },
    /// Forces the red channel to full intensity.
    FrameDebug,
    FrameBlur,
    FrameDepth,
    FrameDenoise,
}

impl ImageOpDesc {
    /// Looks an operation up by name. `tonemapper` takes an optional operator
    /// suffix, e.g. `tonemapper:reinhard`.
    pub fn from_name(name: &str) -> Result<Self> {
        let (base, arg) = match name.split_once(':') {
            Some((base, arg)) => (base, Some(arg)),
            None => (name, None),
        };
        let desc = match (base, arg) {
            ("tonemapper", arg) => ImageOpDesc::ToneMapper {
                tonemap: match arg {
                    None => ToneMap::Aces,
                    Some(op) => ToneMap::from_name(op).ok_or_else(|| FrameBufferError::UnknownImageOp(name.to_owned()))?,
                },
                exposure: 1.0,
            },
            ("tile_debug", None) => ImageOpDesc::TileDebug {
                add_color: Vec3::new(0.0, 0.0, 0.2),
            },
            ("frame_debug", None) => ImageOpDesc::FrameDebug,
            ("frame_blur", None) => ImageOpDesc::FrameBlur,
            ("frame_depth", None) => ImageOpDesc::FrameDepth,
            ("frame_denoise", None) => ImageOpDesc::FrameDenoise,
            _ => return Err(FrameBufferError::UnknownImageOp(name.to_owned())),
        };
        Ok(desc)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ImageOpDesc::ToneMapper { .. } => "tonemapper",
            ImageOpDesc::TileDebug { .. } => "tile_debug",
            ImageOpDesc::FrameDebug => "frame_debug",
            ImageOpDesc::FrameBlur => "frame_blur",
            ImageOpDesc::FrameDepth => "frame_depth",
            ImageOpDesc::FrameDenoise => "frame_denoise",
        }
    }

    pub fn kind(&self) -> ImageOpKind {
        match self {
            ImageOpDesc::ToneMapper { .. } | ImageOpDesc::TileDebug { .. } => ImageOpKind::Pixel,
            _ => ImageOpKind::Frame,
        }
    }

    fn required_channels(&self) -> &'static [(ChannelFlags, Channel)] {
        const COLOR: (ChannelFlags, Channel) = (ChannelFlags::COLOR, Channel::Color);
        const DEPTH: (ChannelFlags, Channel) = (ChannelFlags::DEPTH, Channel::Depth);
        match self {
            ImageOpDesc::FrameDepth => &[COLOR, DEPTH],
            _ => &[COLOR],
        }
    }

    fn check_channels(&self, fb: &FrameBufferDesc) -> Result<()> {
        for &(flag, channel) in self.required_channels() {
            let present = if flag == ChannelFlags::COLOR {
                fb.has_color()
            } else {
                fb.has(flag)
            };
            if !present {
                return Err(FrameBufferError::MissingChannel {
                    op: self.name(),
                    channel,
                });
            }
        }
        Ok(())
    }

    fn attach_pixel(&self) -> Option<Box<dyn PixelOp>> {
        match *self {
            ImageOpDesc::ToneMapper { tonemap, exposure } => Some(Box::new(ToneMapOp::new(tonemap, exposure))),
            ImageOpDesc::TileDebug { add_color } => Some(Box::new(TileDebugOp::new(add_color))),
            _ => None,
        }
    }

    fn attach_frame(&self) -> Option<Box<dyn FrameOp>> {
        match self {
            ImageOpDesc::FrameDebug => Some(Box::new(DebugFrameOp)),
            ImageOpDesc::FrameBlur => Some(Box::new(BlurFrameOp::default())),
            ImageOpDesc::FrameDepth => Some(Box::new(DepthFrameOp)),
            ImageOpDesc::FrameDenoise => Some(Box::new(DenoiseFrameOp::new(CrossBilateralDenoiser::default()))),
            _ => None,
        }
    }
}

/// Per-tile operation. Called concurrently on disjoint tiles.
pub trait PixelOp: Send + Sync {
    fn name(&self) -> &'static str;

    fn begin_frame(&mut self) {}

    fn end_frame(&mut self) {}

    fn process(&self, tile: &mut Tile);
}

/// Whole-image operation, run once the frame is complete.
pub trait FrameOp: Send {
    fn name(&self) -> &'static str;

    fn begin_frame(&mut self) {}

    fn end_frame(&mut self) {}

    fn process(&mut self, view: &mut FrameView<'_>, camera: Option<&Camera>);
}

/// The image as seen by frame operations. Only color is writable.
pub struct FrameView<'a> {
    pub size: UVec2,
    pub color: &'a mut [Vec4],
    pub depth: Option<&'a [f32]>,
    pub normal: Option<&'a [Vec3]>,
    pub albedo: Option<&'a [Vec3]>,
}

impl FrameView<'_> {
    #[inline]
    pub fn width(&self) -> usize {
        self.size.x as usize
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.size.y as usize
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize) -> usize {
        y * self.width() + x
    }
}

/// The pixel stage of a pipeline, shareable across accumulation threads.
#[derive(Default)]
pub struct PixelOps(Vec<Box<dyn PixelOp>>);

impl PixelOps {
    #[inline]
    pub fn process(&self, tile: &mut Tile) {
        for op in &self.0 {
            op.process(tile);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Default)]
pub struct ImagePipeline {
    pixel_ops: PixelOps,
    frame_ops: Vec<Box<dyn FrameOp>>,
}

impl ImagePipeline {
    /// Instantiates `descs` for a frame buffer. Buffers that never see the
    /// whole image pass `allow_frame_ops = false`; their frame operations are
    /// validated and then dropped.
    pub fn build(descs: &[ImageOpDesc], fb: &FrameBufferDesc, allow_frame_ops: bool) -> Result<Self> {
        let mut pipeline = ImagePipeline::default();
        let mut seen_frame_op = false;
        for (index, desc) in descs.iter().enumerate() {
            match desc.kind() {
                ImageOpKind::Pixel if seen_frame_op => {
                    return Err(FrameBufferError::ImageOpOrder {
                        index,
                        name: desc.name(),
                    });
                }
                ImageOpKind::Pixel => {
                    desc.check_channels(fb)?;
                    pipeline.pixel_ops.0.extend(desc.attach_pixel());
                }
                ImageOpKind::Frame => {
                    seen_frame_op = true;
                    if !allow_frame_ops {
                        log::warn!("frame operation {} ignored: framebuffer never holds the whole image", desc.name());
                        continue;
                    }
                    desc.check_channels(fb)?;
                    pipeline.frame_ops.extend(desc.attach_frame());
                }
            }
        }
        Ok(pipeline)
    }

    pub fn pixel_ops(&self) -> &PixelOps {
        &self.pixel_ops
    }

    pub fn num_pixel_ops(&self) -> usize {
        self.pixel_ops.len()
    }

    pub fn num_frame_ops(&self) -> usize {
        self.frame_ops.len()
    }

    pub fn has_frame_ops(&self) -> bool {
        !self.frame_ops.is_empty()
    }

    pub fn begin_frame(&mut self) {
        for op in &mut self.pixel_ops.0 {
            op.begin_frame();
        }
        for op in &mut self.frame_ops {
            op.begin_frame();
        }
    }

    pub fn end_frame(&mut self) {
        for op in &mut self.pixel_ops.0 {
            op.end_frame();
        }
        for op in &mut self.frame_ops {
            op.end_frame();
        }
    }

    pub fn process_frame(&mut self, view: &mut FrameView<'_>, camera: Option<&Camera>) {
        for op in &mut self.frame_ops {
            op.process(view, camera);
        }
    }
}

impl fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("pixel_ops", &self.pixel_ops.0.iter().map(|op| op.name()).collect::<Vec<_>>())
            .field("frame_ops", &self.frame_ops.iter().map(|op| op.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracer::framebuffer::ColorFormat;

    fn fb_desc(channels: ChannelFlags) -> FrameBufferDesc {
        FrameBufferDesc::new(UVec2::new(16, 16), ColorFormat::Rgba32f, channels)
    }

    #[test]
    fn test_registry_names_round_trip() {
        for name in REGISTERED_IMAGE_OPS {
            assert_eq!(ImageOpDesc::from_name(name).unwrap().name(), name);
        }
        assert!(matches!(
            ImageOpDesc::from_name("frame_ssao"),
            Err(FrameBufferError::UnknownImageOp(_))
        ));
        assert_eq!(
            ImageOpDesc::from_name("tonemapper:reinhard").unwrap(),
            ImageOpDesc::ToneMapper {
                tonemap: ToneMap::Reinhard,
                exposure: 1.0
            }
        );
    }

    #[test]
    fn test_frame_ops_must_be_a_suffix() {
        let descs = [
            ImageOpDesc::from_name("tonemapper").unwrap(),
            ImageOpDesc::FrameBlur,
            ImageOpDesc::from_name("tile_debug").unwrap(),
        ];
        let err = ImagePipeline::build(&descs, &fb_desc(ChannelFlags::COLOR), true).unwrap_err();
        assert!(matches!(err, FrameBufferError::ImageOpOrder { index: 2, .. }));

        let ok = ImagePipeline::build(&descs[..2], &fb_desc(ChannelFlags::COLOR), true).unwrap();
        assert_eq!(ok.num_pixel_ops(), 1);
        assert_eq!(ok.num_frame_ops(), 1);
    }

    #[test]
    fn test_missing_channels() {
        let err = ImagePipeline::build(&[ImageOpDesc::FrameDepth], &fb_desc(ChannelFlags::COLOR), true).unwrap_err();
        assert!(matches!(
            err,
            FrameBufferError::MissingChannel {
                channel: Channel::Depth,
                ..
            }
        ));
        let no_color = ImagePipeline::build(&[ImageOpDesc::FrameBlur], &fb_desc(ChannelFlags::DEPTH), true);
        assert!(no_color.is_err());
    }
}
