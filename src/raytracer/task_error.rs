//! Hierarchical adaptive stopping over the render-task grid.
//!
//! Every task carries an error estimate. Boxes over the task grid group tasks
//! that share one refinement decision: a box that is nearly converged is
//! halved until its tasks are individually converged, at which point it is
//! dropped. Tasks are re-rendered while their error exceeds the threshold.

use std::ops::Index;

use glam::UVec2;

use crate::raytracer::tile::Region;

/// A region whose average error is within this factor of the threshold is
/// eligible to shrink.
const SPLIT_FACTOR: f32 = 4.0;

#[derive(Clone, Debug, Default)]
pub struct TaskError {
    num_tasks: UVec2,
    errors: Vec<f32>,
    regions: Vec<Region>,
    next_regions: Vec<Region>,
}

impl TaskError {
    /// Tracker over a `num_tasks` grid. A zero-sized grid disables tracking.
    pub fn new(num_tasks: UVec2) -> Self {
        let count = num_tasks.x as usize * num_tasks.y as usize;
        let mut tracker = Self {
            num_tasks,
            errors: vec![f32::INFINITY; count],
            regions: Vec::with_capacity(count.min(1024)),
            next_regions: Vec::with_capacity(count.min(1024)),
        };
        tracker.reset_regions();
        tracker
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn num_tasks(&self) -> UVec2 {
        self.num_tasks
    }

    fn reset_regions(&mut self) {
        self.regions.clear();
        if self.is_enabled() {
            self.regions.push(Region::from_size(self.num_tasks));
        }
    }

    /// Forgets all errors and restores the single region covering the grid.
    pub fn clear(&mut self) {
        self.errors.fill(f32::INFINITY);
        self.reset_regions();
    }

    #[inline]
    pub fn update(&mut self, task: UVec2, error: f32) {
        if self.is_enabled() {
            let idx = task.y as usize * self.num_tasks.x as usize + task.x as usize;
            self.errors[idx] = error;
        }
    }

    /// Error of a task, `+inf` when tracking is disabled.
    #[inline]
    pub fn get(&self, task_id: u32) -> f32 {
        self.errors
            .get(task_id as usize)
            .copied()
            .unwrap_or(f32::INFINITY)
    }

    pub fn errors(&self) -> &[f32] {
        &self.errors
    }

    /// Row-major per-task errors, for writers that own disjoint rows.
    pub fn errors_mut(&mut self) -> &mut [f32] {
        &mut self.errors
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Runs one refinement pass and returns the overall frame error: the mean
    /// over tasks above `threshold`, or the maximum error when none is.
    pub fn refine(&mut self, threshold: f32) -> f32 {
        if !self.is_enabled() {
            return f32::INFINITY;
        }

        let mut max_err = 0.0f32;
        let mut active_sum = 0.0f32;
        let mut active = 0usize;
        for &err in &self.errors {
            max_err = max_err.max(err);
            if err > threshold {
                active_sum += err;
                active += 1;
            }
        }
        let frame_error = if active > 0 {
            active_sum / active as f32
        } else {
            max_err
        };

        let forced = threshold.next_up();
        let stride = self.num_tasks.x as usize;
        let Self {
            errors,
            regions,
            next_regions,
            ..
        } = self;

        next_regions.clear();
        for region in regions.iter() {
            let mut sum = 0.0f32;
            let mut region_max = 0.0f32;
            for y in region.lower.y..region.upper.y {
                let row = &errors[y as usize * stride..][region.lower.x as usize..region.upper.x as usize];
                for &err in row {
                    sum += err;
                    region_max = region_max.max(err);
                }
            }

            if region_max > threshold {
                for y in region.lower.y..region.upper.y {
                    let row = &mut errors[y as usize * stride..][region.lower.x as usize..region.upper.x as usize];
                    for err in row {
                        *err = err.max(forced);
                    }
                }
            }

            let area = region.area();
            let average = sum / area as f32;
            if average <= SPLIT_FACTOR * threshold {
                if area <= 2 || region_max <= threshold {
                    continue;
                }
                let (a, b) = region.split();
                next_regions.push(a);
                next_regions.push(b);
            } else {
                next_regions.push(*region);
            }
        }
        std::mem::swap(regions, next_regions);

        log::trace!(
            "refine(threshold={threshold}): frame error {frame_error}, {} regions left",
            self.regions.len()
        );
        frame_error
    }
}

impl Index<u32> for TaskError {
    type Output = f32;

    fn index(&self, task_id: u32) -> &f32 {
        self.errors.get(task_id as usize).unwrap_or(&f32::INFINITY)
    }
}
