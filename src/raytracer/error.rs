//! Error types for frame buffer configuration and export.
//!
//! Configuration problems (bad sizes, bad channel/format combinations, badly
//! ordered image operations) are reported synchronously from constructors and
//! `commit()`. The per-tile accumulation path never produces errors.

use thiserror::Error;

use crate::raytracer::framebuffer::{Channel, ChannelFlags, ColorFormat};

#[derive(Error, Debug)]
pub enum FrameBufferError {
    /// Width or height was zero.
    #[error("framebuffer has invalid size {width}x{height}, dimensions must be greater than 0")]
    InvalidSize { width: u32, height: u32 },

    /// Render task size must be a power of two that divides the tile size.
    #[error("render task size {width}x{height} must be a power of two dividing the tile size {tile_size}")]
    InvalidRenderTaskSize {
        width: u32,
        height: u32,
        tile_size: u32,
    },

    #[error("invalid channel configuration {channels:?} with color format {format:?}: {reason}")]
    InvalidChannels {
        channels: ChannelFlags,
        format: ColorFormat,
        reason: &'static str,
    },

    /// A pixel operation was placed after a frame operation.
    #[error("image operation #{index} ({name}) is a pixel operation but follows a frame operation")]
    ImageOpOrder { index: usize, name: &'static str },

    #[error("image operation {op} requires the {channel:?} channel")]
    MissingChannel { op: &'static str, channel: Channel },

    #[error("unknown image operation '{0}'")]
    UnknownImageOp(String),

    #[error("render task size mismatch: dense buffer uses {dense:?}, sparse buffer uses {sparse:?}")]
    MismatchedRenderTaskSize {
        dense: glam::UVec2,
        sparse: glam::UVec2,
    },

    /// The sparse buffer does not store the tile covering this region.
    #[error("tile {tile_id} is not stored in this sparse framebuffer")]
    TileNotOwned { tile_id: u32 },

    #[error("samples per pixel must be at least 1")]
    InvalidSamplesPerPixel,

    /// The channel is disabled, or the buffer cannot be mapped at all.
    #[error("{0:?} channel cannot be mapped from this framebuffer")]
    ChannelUnavailable(Channel),

    #[error("image export failed: {0}")]
    Export(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameBufferError>;
