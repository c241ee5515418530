use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use super::{FrameContext, FrameStats, LoadBalancer, TileRenderer};
use crate::raytracer::camera::Camera;
use crate::raytracer::config::AdaptiveSamplingConfig;
use crate::raytracer::framebuffer::{FrameBuffer, FrameStatus, SyncEvent};
use crate::raytracer::tile::{RenderTaskDesc, Tile};

/// Renders every task of a frame on the rayon pool, straight into one
/// frame buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParallelRenderLoop;

/// Renders `tasks` in parallel. Tasks that have not started when the frame is
/// cancelled are skipped; running ones finish.
pub(super) fn render_tasks<R: TileRenderer>(
    tasks: &[RenderTaskDesc],
    renderer: &R,
    ctx: &FrameContext<'_>,
    status: &FrameStatus,
) -> Vec<Tile> {
    tasks
        .par_iter()
        .filter_map(|task| {
            if status.is_cancelled() {
                return None;
            }
            let mut tile = Tile::new(task.region, task.accum_id);
            renderer.render_task(task, ctx, &mut tile);
            Some(tile)
        })
        .collect()
}

/// Descriptors of the tasks `fb` wants rendered this frame.
pub(super) fn collect_tasks<F: FrameBuffer + ?Sized>(fb: &mut F, config: &AdaptiveSamplingConfig) -> Vec<RenderTaskDesc> {
    let ids = fb
        .render_task_ids(config.error_threshold, config.samples_per_pixel)
        .to_vec();
    ids.into_iter().map(|id| fb.task_desc(id)).collect()
}

impl ParallelRenderLoop {
    /// Everything after `begin_frame`: dispatch, accumulation, frame close.
    fn dispatch_frame<F, R>(fb: &mut F, renderer: &R, camera: &Camera, config: &AdaptiveSamplingConfig) -> FrameStats
    where
        F: FrameBuffer + ?Sized,
        R: TileRenderer,
    {
        let status = fb.status().clone();
        let tasks = collect_tasks(fb, config);
        let ctx = FrameContext {
            camera,
            image_size: fb.size(),
            frame_id: fb.frame_id(),
            samples_per_pixel: config.samples_per_pixel,
        };

        let mut tiles = render_tasks(&tasks, renderer, &ctx, &status);
        let pixels_rendered = tiles.iter().map(|t| t.region().area()).sum();

        fb.accumulate_tiles(&mut tiles);
        status.set_completed(SyncEvent::WorldRendered);

        fb.end_frame(config.error_threshold, Some(camera));
        fb.post_process();
        status.set_completed(SyncEvent::FrameFinished);

        let cancelled = status.is_cancelled();
        if cancelled {
            log::debug!(
                "frame {} cancelled after {} of {} tasks",
                fb.frame_id(),
                tiles.len(),
                tasks.len()
            );
        }
        log::trace!(
            "frame {}: {} tasks, variance {}",
            fb.frame_id(),
            tiles.len(),
            fb.variance()
        );

        FrameStats {
            frame_id: fb.frame_id(),
            tasks_rendered: tiles.len(),
            pixels_rendered,
            variance: fb.variance(),
            cancelled,
        }
    }

    /// Runs one frame on the rayon pool and returns immediately.
    pub fn render_frame_async<F, R>(
        &self,
        fb: Arc<Mutex<F>>,
        renderer: Arc<R>,
        camera: Camera,
        config: AdaptiveSamplingConfig,
    ) -> FrameFuture
    where
        F: FrameBuffer + 'static,
        R: TileRenderer + Send + 'static,
    {
        let status = fb.lock().status().clone();
        let shared = Arc::new(FutureState {
            result: Mutex::new(None),
            ready: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
        });

        let job_state = shared.clone();
        rayon::spawn(move || {
            let mut fb = fb.lock();
            fb.begin_frame();
            // A cancel issued before the frame opened would have been reset.
            if job_state.cancel_requested.load(Ordering::Acquire) {
                fb.cancel_frame();
            }
            let stats = Self::dispatch_frame(&mut *fb, &*renderer, &camera, &config);
            drop(fb);

            let mut result = job_state.result.lock();
            *result = Some(stats);
            job_state.ready.notify_all();
        });

        FrameFuture { shared, status }
    }
}

impl<F: FrameBuffer> LoadBalancer<F> for ParallelRenderLoop {
    fn render_frame<R: TileRenderer>(
        &mut self,
        fb: &mut F,
        renderer: &R,
        camera: &Camera,
        config: &AdaptiveSamplingConfig,
    ) -> FrameStats {
        fb.begin_frame();
        Self::dispatch_frame(fb, renderer, camera, config)
    }
}

struct FutureState {
    result: Mutex<Option<FrameStats>>,
    ready: Condvar,
    cancel_requested: AtomicBool,
}

/// Handle to a frame rendering in the background.
pub struct FrameFuture {
    shared: Arc<FutureState>,
    status: Arc<FrameStatus>,
}

impl FrameFuture {
    pub fn is_ready(&self) -> bool {
        self.shared.result.lock().is_some()
    }

    /// Blocks until the frame is finished.
    pub fn wait(&self) -> FrameStats {
        let mut result = self.shared.result.lock();
        loop {
            if let Some(stats) = *result {
                return stats;
            }
            self.shared.ready.wait(&mut result);
        }
    }

    /// Requests cooperative cancellation. Tasks already running complete and
    /// the frame still finishes.
    pub fn cancel(&self) {
        self.shared.cancel_requested.store(true, Ordering::Release);
        self.status.cancel();
    }

    /// Live status of the frame, for progress reporting.
    pub fn status(&self) -> &Arc<FrameStatus> {
        &self.status
    }
}
