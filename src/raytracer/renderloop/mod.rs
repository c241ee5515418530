//! Dispatch of render tasks to a renderer and their accumulation.
//!
//! A load balancer drives one frame at a time: it opens the frame, asks the
//! frame buffer which tasks still need samples, renders those tasks in
//! parallel and only then closes the frame. Renderers are external
//! collaborators and only see [`TileRenderer`].

mod multi_device;
mod parallel;

use glam::UVec2;

use crate::raytracer::camera::Camera;
use crate::raytracer::config::AdaptiveSamplingConfig;
use crate::raytracer::framebuffer::FrameBuffer;
use crate::raytracer::tile::{RenderTaskDesc, Sample, Tile};

pub use multi_device::MultiDeviceLoadBalancer;
pub use parallel::{FrameFuture, ParallelRenderLoop};

/// Per-frame inputs shared by every task.
#[derive(Clone, Copy, Debug)]
pub struct FrameContext<'a> {
    pub camera: &'a Camera,
    pub image_size: UVec2,
    pub frame_id: i32,
    pub samples_per_pixel: u32,
}

/// Produces the samples of one render task. The tile passed in covers exactly
/// `task.region` and carries `task.accum_id`.
pub trait TileRenderer: Sync {
    fn render_task(&self, task: &RenderTaskDesc, ctx: &FrameContext<'_>, tile: &mut Tile);
}

/// Renderer working one pixel sample at a time.
pub trait PixelRenderer: Sync {
    fn render_pixel(&self, pixel: UVec2, sample_index: u32, ctx: &FrameContext<'_>) -> Sample;
}

impl<P: PixelRenderer> TileRenderer for P {
    fn render_task(&self, task: &RenderTaskDesc, ctx: &FrameContext<'_>, tile: &mut Tile) {
        let spp = ctx.samples_per_pixel.max(1);
        let first = task.accum_id.max(0) as u32 * spp;
        for (p, out) in tile.iter_mut() {
            let mut sample = self.render_pixel(p, first, ctx);
            if spp > 1 {
                let mut color = sample.color;
                for i in 1..spp {
                    color += self.render_pixel(p, first + i, ctx).color;
                }
                sample.color = color / spp as f32;
            }
            *out = sample;
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub frame_id: i32,
    pub tasks_rendered: usize,
    pub pixels_rendered: usize,
    pub variance: f32,
    pub cancelled: bool,
}

impl FrameStats {
    /// Nothing was left to render: every task is below the error threshold.
    pub fn converged(&self) -> bool {
        self.tasks_rendered == 0 && !self.cancelled
    }
}

pub trait LoadBalancer<F: FrameBuffer> {
    /// Renders one frame into `fb`. `end_frame` runs only after every
    /// dispatched task of the frame has been accumulated.
    fn render_frame<R: TileRenderer>(
        &mut self,
        fb: &mut F,
        renderer: &R,
        camera: &Camera,
        config: &AdaptiveSamplingConfig,
    ) -> FrameStats;
}
