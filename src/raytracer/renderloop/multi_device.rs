use rayon::prelude::*;

use super::parallel::{collect_tasks, render_tasks};
use super::{FrameContext, FrameStats, LoadBalancer, TileRenderer};
use crate::raytracer::camera::Camera;
use crate::raytracer::config::AdaptiveSamplingConfig;
use crate::raytracer::error::Result;
use crate::raytracer::framebuffer::{FrameBuffer, FrameBufferDesc, LocalFrameBuffer, SparseFrameBuffer, SyncEvent};
use crate::raytracer::imageop::{ImageOpDesc, ImageOpKind};
use crate::raytracer::tile::num_tiles;

/// Splits the image over several sparse frame buffers ("devices"), renders
/// them side by side and composes the result into one dense buffer.
///
/// Tiles are dealt round-robin. Pixel operations run on the devices, frame
/// operations once on the composed image. After every frame the dense
/// buffer's refined task errors are pushed back so each device schedules
/// from the same adaptive state.
#[derive(Debug)]
pub struct MultiDeviceLoadBalancer {
    devices: Vec<SparseFrameBuffer>,
}

impl MultiDeviceLoadBalancer {
    pub fn new(desc: FrameBufferDesc, num_devices: usize) -> Result<Self> {
        let num_devices = num_devices.max(1);
        let tiles = num_tiles(desc.size);
        let mut assignments = vec![Vec::new(); num_devices];
        for tile_id in 0..tiles.x * tiles.y {
            assignments[tile_id as usize % num_devices].push(tile_id);
        }
        let devices = assignments
            .iter()
            .map(|ids| SparseFrameBuffer::new(desc, ids))
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "multi-device load balancer: {} tiles over {} devices",
            tiles.x * tiles.y,
            num_devices
        );
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[SparseFrameBuffer] {
        &self.devices
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Attaches the pixel stage of `ops` to every device. Frame operations
    /// belong on the composed buffer and are not forwarded.
    pub fn set_image_ops(&mut self, ops: &[ImageOpDesc]) -> Result<()> {
        let pixel_ops: Vec<ImageOpDesc> = ops
            .iter()
            .filter(|op| op.kind() == ImageOpKind::Pixel)
            .cloned()
            .collect();
        for device in &mut self.devices {
            device.set_image_ops(pixel_ops.clone());
            device.commit()?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for device in &mut self.devices {
            device.clear();
        }
    }

    fn push_back_errors(&mut self, fb: &LocalFrameBuffer) {
        for device in &mut self.devices {
            let locals: Vec<u32> = device.active_local_tasks().collect();
            for local in locals {
                let Some(task_id) = fb.task_id_at(device.task_grid_pos(local)) else {
                    continue;
                };
                device.set_task_error(local, fb.task_error(task_id));
                device.set_task_accum_id(local, fb.task_accum_id(task_id));
            }
        }
    }
}

impl LoadBalancer<LocalFrameBuffer> for MultiDeviceLoadBalancer {
    fn render_frame<R: TileRenderer>(
        &mut self,
        fb: &mut LocalFrameBuffer,
        renderer: &R,
        camera: &Camera,
        config: &AdaptiveSamplingConfig,
    ) -> FrameStats {
        fb.begin_frame();
        let status = fb.status().clone();
        let ctx = FrameContext {
            camera,
            image_size: fb.size(),
            frame_id: fb.frame_id(),
            samples_per_pixel: config.samples_per_pixel,
        };

        let per_device: Vec<(usize, usize)> = self
            .devices
            .par_iter_mut()
            .map(|device| {
                device.begin_frame();
                let tasks = collect_tasks(device, config);
                let mut tiles = render_tasks(&tasks, renderer, &ctx, &status);
                let pixels = tiles.iter().map(|t| t.region().area()).sum();
                device.accumulate_tiles(&mut tiles);
                device.end_frame(config.error_threshold, None);
                device.post_process();
                (tiles.len(), pixels)
            })
            .collect();

        for device in &self.devices {
            if let Err(err) = fb.write_sparse(device) {
                log::warn!("device output not composed: {err}");
            }
        }
        status.set_completed(SyncEvent::WorldRendered);

        fb.end_frame(config.error_threshold, Some(camera));
        fb.post_process();
        self.push_back_errors(fb);
        status.set_completed(SyncEvent::FrameFinished);

        let (tasks_rendered, pixels_rendered) = per_device
            .iter()
            .fold((0, 0), |(t, p), &(dt, dp)| (t + dt, p + dp));
        log::trace!(
            "frame {}: {} tasks over {} devices, variance {}",
            fb.frame_id(),
            tasks_rendered,
            self.devices.len(),
            fb.variance()
        );

        FrameStats {
            frame_id: fb.frame_id(),
            tasks_rendered,
            pixels_rendered,
            variance: fb.variance(),
            cancelled: status.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracer::framebuffer::{Channel, ChannelData, ChannelFlags, ColorFormat};
    use crate::raytracer::renderloop::{ParallelRenderLoop, PixelRenderer};
    use crate::raytracer::tile::Sample;
    use glam::{UVec2, Vec4};

    /// Color depends only on the pixel and sample, so dense and composed
    /// renders can be compared exactly.
    struct Gradient;

    impl PixelRenderer for Gradient {
        fn render_pixel(&self, pixel: UVec2, sample_index: u32, _ctx: &FrameContext<'_>) -> Sample {
            let noise = if sample_index % 2 == 0 { 0.25 } else { -0.25 };
            Sample::with_color(Vec4::new(pixel.x as f32 / 200.0 + noise, pixel.y as f32 / 100.0, 0.5, 1.0))
        }
    }

    /// Hashed noise whose amplitude changes every 32 pixel columns, from none
    /// in the first stripe to strong in the last.
    struct Stripes;

    impl PixelRenderer for Stripes {
        fn render_pixel(&self, pixel: UVec2, sample_index: u32, _ctx: &FrameContext<'_>) -> Sample {
            let amplitude = (pixel.x / 32) as f32 * 0.1;
            let mut h = pixel.x.wrapping_mul(0x8da6_b343)
                ^ pixel.y.wrapping_mul(0xd816_3841)
                ^ sample_index.wrapping_mul(0xcb1a_b31f);
            h ^= h >> 15;
            h = h.wrapping_mul(0x2c1b_3c6d);
            h ^= h >> 12;
            let noise = (h & 0xffff) as f32 / 65535.0 * 2.0 - 1.0;
            let v = 0.5 + amplitude * noise;
            Sample::with_color(Vec4::new(v, v, v, 1.0))
        }
    }

    fn desc() -> FrameBufferDesc {
        FrameBufferDesc::new(
            UVec2::new(200, 100),
            ColorFormat::Rgba32f,
            ChannelFlags::COLOR | ChannelFlags::ACCUM | ChannelFlags::VARIANCE,
        )
    }

    #[test]
    fn test_round_robin_tile_assignment() {
        let balancer = MultiDeviceLoadBalancer::new(desc(), 3).unwrap();
        // 4x2 tiles.
        let ids: Vec<Vec<u32>> = balancer.devices().iter().map(|d| d.tile_ids().collect()).collect();
        assert_eq!(ids, vec![vec![0, 3, 6], vec![1, 4, 7], vec![2, 5]]);
    }

    #[test]
    fn test_composed_frames_match_dense_rendering() {
        let camera = Camera::default();
        let config = AdaptiveSamplingConfig {
            error_threshold: 0.0,
            ..AdaptiveSamplingConfig::default()
        };

        let mut dense = LocalFrameBuffer::with_desc(desc()).unwrap();
        let mut composed = LocalFrameBuffer::with_desc(desc()).unwrap();
        let mut balancer = MultiDeviceLoadBalancer::new(desc(), 2).unwrap();
        for _ in 0..3 {
            ParallelRenderLoop.render_frame(&mut dense, &Gradient, &camera, &config);
            let stats = balancer.render_frame(&mut composed, &Gradient, &camera, &config);
            assert_eq!(stats.tasks_rendered, composed.total_render_tasks() as usize);
        }

        let a = dense.map_buffer(Channel::Color).unwrap();
        let b = composed.map_buffer(Channel::Color).unwrap();
        let (ChannelData::Rgba32f(a), ChannelData::Rgba32f(b)) = (a.data(), b.data()) else {
            panic!("float color expected");
        };
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((*x - *y).abs().max_element() < 1e-5);
        }
        for task in 0..dense.total_render_tasks() {
            assert_eq!(dense.task_accum_id(task), 3);
            assert_eq!(composed.task_accum_id(task), 3);
        }
    }

    #[test]
    fn test_adaptive_task_sets_match_dense_rendering() {
        let camera = Camera::default();
        let config = AdaptiveSamplingConfig {
            error_threshold: 0.05,
            samples_per_pixel: 8,
            max_frames: 24,
        };

        let mut dense = LocalFrameBuffer::with_desc(desc()).unwrap();
        let mut composed = LocalFrameBuffer::with_desc(desc()).unwrap();
        let mut balancer = MultiDeviceLoadBalancer::new(desc(), 2).unwrap();
        let total = dense.total_render_tasks() as usize;
        let mut adaptive_frames = 0;
        for frame in 0..config.max_frames {
            let a = ParallelRenderLoop.render_frame(&mut dense, &Stripes, &camera, &config);
            let b = balancer.render_frame(&mut composed, &Stripes, &camera, &config);
            assert_eq!(a.tasks_rendered, b.tasks_rendered, "frame {frame}");
            for task in 0..dense.total_render_tasks() {
                assert_eq!(dense.task_error(task), composed.task_error(task), "frame {frame}, task {task}");
            }
            assert_eq!(a.variance, b.variance, "frame {frame}");
            if a.tasks_rendered < total {
                adaptive_frames += 1;
            }
        }
        assert!(adaptive_frames > 0);
    }

    #[test]
    fn test_errors_are_pushed_back_to_devices() {
        let camera = Camera::default();
        let config = AdaptiveSamplingConfig::default();
        let mut composed = LocalFrameBuffer::with_desc(desc()).unwrap();
        let mut balancer = MultiDeviceLoadBalancer::new(desc(), 2).unwrap();
        for _ in 0..2 {
            balancer.render_frame(&mut composed, &Gradient, &camera, &config);
        }
        for device in balancer.devices() {
            for local in device.active_local_tasks() {
                let dense_id = composed.task_id_at(device.task_grid_pos(local)).unwrap();
                assert_eq!(device.task_error(local), composed.task_error(dense_id));
                assert_eq!(device.task_accum_id(local), composed.task_accum_id(dense_id));
            }
        }
    }
}
