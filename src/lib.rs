//! Progressive, adaptively sampled frame buffers for a tiled ray tracer.
//!
//! Renderers produce [`Tile`]s of samples for render tasks handed out by a
//! load balancer. A [`FrameBuffer`] folds them into a running mean, tracks a
//! per-task error estimate so converged tasks stop receiving samples, and runs
//! the attached image operations. [`LocalFrameBuffer`] holds the whole image;
//! [`SparseFrameBuffer`] holds a subset of tiles and is composed into a dense
//! buffer by [`MultiDeviceLoadBalancer`].

pub mod raytracer;

pub use raytracer::camera::Camera;
pub use raytracer::config::{AdaptiveSamplingConfig, RenderConfig};
pub use raytracer::error::{FrameBufferError, Result};
pub use raytracer::framebuffer::{
    Channel, ChannelData, ChannelFlags, ColorFormat, FrameBuffer, FrameBufferDesc, LocalFrameBuffer, MappedBuffer,
    SparseFrameBuffer, SyncEvent,
};
pub use raytracer::imageop::ImageOpDesc;
pub use raytracer::renderloop::{
    FrameContext, FrameFuture, FrameStats, LoadBalancer, MultiDeviceLoadBalancer, ParallelRenderLoop, PixelRenderer,
    TileRenderer,
};
pub use raytracer::tile::{RenderTaskDesc, Sample, Tile, TILE_SIZE};
