use glam::{UVec2, Vec4};

use super::{
    blend_depth, blend_weight, lerp3, lerp4, min_adaptive_frames, pixel_error, tasks_in_region, variance_weight,
    Channel, ChannelFlags, FrameBuffer, FrameBufferCore, FrameBufferDesc, MappedBuffer,
};
use crate::raytracer::camera::Camera;
use crate::raytracer::error::{FrameBufferError, Result};
use crate::raytracer::task_error::TaskError;
use crate::raytracer::tile::{
    interleave_z_order, num_tiles, tile_region, Region, RenderTaskDesc, Tile, INVALID_ID,
};

/// Storage for one owned tile: the final samples plus the accumulation
/// state behind them.
#[derive(Clone, Debug)]
struct SparseTile {
    id: u32,
    tile: Tile,
    accum: Vec<Vec4>,
    variance: Vec<Vec4>,
}

/// Frame buffer that only stores a caller-chosen subset of the image tiles.
///
/// Render task IDs are local: task `i` lives in owned tile `i / tasks_per_tile`
/// at row-major position `i % tasks_per_tile` inside it. Per-task error is
/// stored on a one-row grid indexed by the local task ID and is never refined
/// here: neighbours on that grid are unrelated parts of the image.
pub struct SparseFrameBuffer {
    core: FrameBufferCore,
    total_tiles: UVec2,
    tiles: Vec<SparseTile>,
    /// Image tile ID to index in `tiles`, `INVALID_ID` when not owned.
    tile_lookup: Vec<u32>,
    task_error: TaskError,
    task_accum_ids: Vec<i32>,
    render_task_ids: Vec<u32>,
    active_task_ids: Vec<u32>,
}

impl SparseFrameBuffer {
    pub fn new(desc: FrameBufferDesc, tile_ids: &[u32]) -> Result<Self> {
        let core = FrameBufferCore::new(desc)?;
        let total_tiles = num_tiles(desc.size);
        let mut fb = Self {
            core,
            total_tiles,
            tiles: Vec::new(),
            tile_lookup: vec![INVALID_ID; (total_tiles.x * total_tiles.y) as usize],
            task_error: TaskError::disabled(),
            task_accum_ids: Vec::new(),
            render_task_ids: Vec::new(),
            active_task_ids: Vec::new(),
        };
        fb.set_tiles(tile_ids);
        Ok(fb)
    }

    fn tasks_per_tile(&self) -> UVec2 {
        self.core.desc().tasks_per_tile()
    }

    fn tasks_per_tile_count(&self) -> u32 {
        let n = self.tasks_per_tile();
        n.x * n.y
    }

    /// Replaces the owned tiles, resetting all accumulation state.
    pub fn set_tiles(&mut self, tile_ids: &[u32]) {
        let desc = *self.core.desc();
        let total = self.total_tiles.x * self.total_tiles.y;

        self.tile_lookup.fill(INVALID_ID);
        self.tiles.clear();
        for &id in tile_ids {
            if id >= total {
                log::warn!("sparse framebuffer ignores tile {id}, image only has {total} tiles");
                continue;
            }
            if self.tile_lookup[id as usize] != INVALID_ID {
                continue;
            }
            self.tile_lookup[id as usize] = self.tiles.len() as u32;
            let region = tile_region(id, desc.size);
            let pixels = region.area();
            self.tiles.push(SparseTile {
                id,
                tile: Tile::new(region, 0),
                accum: if desc.has(ChannelFlags::ACCUM) {
                    vec![Vec4::ZERO; pixels]
                } else {
                    Vec::new()
                },
                variance: if desc.has(ChannelFlags::VARIANCE) {
                    vec![Vec4::ZERO; pixels]
                } else {
                    Vec::new()
                },
            });
        }

        let per_tile = self.tasks_per_tile_count();
        let total_tasks = self.tiles.len() as u32 * per_tile;
        self.task_accum_ids = vec![0; total_tasks as usize];
        self.task_error = if desc.has(ChannelFlags::VARIANCE) && total_tasks > 0 {
            TaskError::new(UVec2::new(total_tasks, 1))
        } else {
            TaskError::disabled()
        };

        let tpt = self.tasks_per_tile();
        self.render_task_ids.clear();
        for index in 0..self.tiles.len() as u32 {
            let start = self.render_task_ids.len();
            self.render_task_ids
                .extend((0..per_tile).map(|t| index * per_tile + t));
            self.render_task_ids[start..].sort_by_key(|&t| {
                let pos = UVec2::new(t % per_tile % tpt.x, t % per_tile / tpt.x);
                interleave_z_order(pos.x, pos.y)
            });
        }
        self.render_task_ids
            .retain(|&t| !Self::local_task_region(&self.tiles, desc, t).is_empty());
        self.active_task_ids = Vec::with_capacity(self.render_task_ids.len());
        self.reset_empty_task_errors();

        log::debug!(
            "sparse framebuffer owns {} tiles, {} render tasks",
            self.tiles.len(),
            self.render_task_ids.len()
        );
    }

    /// Tasks that fall entirely outside the image never render, so they start
    /// converged.
    fn reset_empty_task_errors(&mut self) {
        if !self.task_error.is_enabled() {
            return;
        }
        let desc = *self.core.desc();
        for t in 0..self.task_accum_ids.len() as u32 {
            if Self::local_task_region(&self.tiles, desc, t).is_empty() {
                self.task_error.update(UVec2::new(t, 0), 0.0);
            }
        }
    }

    fn local_task_region(tiles: &[SparseTile], desc: FrameBufferDesc, task_id: u32) -> Region {
        let tpt = desc.tasks_per_tile();
        let per_tile = tpt.x * tpt.y;
        let Some(st) = tiles.get((task_id / per_tile) as usize) else {
            return Region::default();
        };
        let local = task_id % per_tile;
        let pos = UVec2::new(local % tpt.x, local / tpt.x);
        let origin = st.tile.tile_origin();
        let lower = origin + pos * desc.render_task_size;
        let task = Region::new(lower, lower + desc.render_task_size);
        task.intersect(&st.tile.region())
    }

    pub fn tile_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.tiles.iter().map(|st| st.id)
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Final samples of every owned tile.
    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter().map(|st| &st.tile)
    }

    pub fn tile_index_for_task(&self, task_id: u32) -> u32 {
        task_id / self.tasks_per_tile_count()
    }

    /// Position of a local task in the image-wide task grid.
    pub fn task_grid_pos(&self, task_id: u32) -> UVec2 {
        let tpt = self.tasks_per_tile();
        let per_tile = tpt.x * tpt.y;
        let tile_pos = self
            .tiles
            .get((task_id / per_tile) as usize)
            .map(|st| st.tile.tile_pos())
            .unwrap_or_default();
        let local = task_id % per_tile;
        tile_pos * tpt + UVec2::new(local % tpt.x, local / tpt.x)
    }

    /// Local IDs of the tasks covering image pixels.
    pub fn active_local_tasks(&self) -> impl Iterator<Item = u32> + '_ {
        self.render_task_ids.iter().copied()
    }

    pub fn task_accum_id(&self, task_id: u32) -> i32 {
        self.task_accum_ids.get(task_id as usize).copied().unwrap_or(0)
    }

    pub fn set_task_error(&mut self, task_id: u32, error: f32) {
        if (task_id as usize) < self.task_accum_ids.len() {
            self.task_error.update(UVec2::new(task_id, 0), error);
        }
    }

    pub fn set_task_accum_id(&mut self, task_id: u32, accum_id: i32) {
        if let Some(slot) = self.task_accum_ids.get_mut(task_id as usize) {
            *slot = accum_id;
        }
    }

    /// Accumulates a tile, failing if its tile cell is not owned.
    pub fn try_accumulate(&mut self, tile: &mut Tile) -> Result<()> {
        let pos = tile.tile_pos();
        let tile_id = pos.y * self.total_tiles.x + pos.x;
        let index = self
            .tile_lookup
            .get(tile_id as usize)
            .copied()
            .filter(|&i| i != INVALID_ID)
            .ok_or(FrameBufferError::TileNotOwned { tile_id })?;
        self.accumulate_owned(index as usize, tile);
        Ok(())
    }

    fn accumulate_owned(&mut self, index: usize, tile: &mut Tile) {
        let desc = *self.core.desc();
        let per_tile = self.tasks_per_tile_count();
        let tpt = self.tasks_per_tile();
        let Self {
            core,
            tiles,
            task_error,
            task_accum_ids,
            ..
        } = self;
        let st = &mut tiles[index];
        let region = tile.region().intersect(&st.tile.region());
        if region.is_empty() {
            return;
        }

        let accum_id = tile.accum_id;
        let weight = if desc.has(ChannelFlags::ACCUM) {
            blend_weight(accum_id)
        } else {
            1.0
        };
        let update_variance = !st.variance.is_empty() && accum_id & 1 == 1;
        let var_weight = variance_weight(accum_id);
        let write_ids = !desc.has(ChannelFlags::ACCUM) || accum_id <= 0;

        for (p, s) in tile.iter_mut() {
            if !region.contains(p) {
                continue;
            }
            let idx = st.tile.index(p);
            if !st.accum.is_empty() {
                let acc = lerp4(st.accum[idx], s.color, weight);
                st.accum[idx] = acc;
                if update_variance {
                    st.variance[idx] = lerp4(st.variance[idx], s.color, var_weight);
                }
                s.color = acc;
            }
            let stored = &st.tile.samples()[idx];
            s.depth = blend_depth(stored.depth, s.depth, weight);
            s.normal = lerp3(stored.normal, s.normal, weight);
            s.albedo = lerp3(stored.albedo, s.albedo, weight);
            if !write_ids {
                s.primitive_id = stored.primitive_id;
                s.object_id = stored.object_id;
                s.instance_id = stored.instance_id;
            }
        }

        let origin = st.tile.tile_origin();
        for task in tasks_in_region(Region::new(region.lower - origin, region.upper - origin), desc.render_task_size) {
            let local = index as u32 * per_tile + task.y * tpt.x + task.x;
            if update_variance && task_error.is_enabled() {
                let lower = origin + task * desc.render_task_size;
                let task_region =
                    Region::new(lower, lower + desc.render_task_size).intersect(&st.tile.region());
                let mut sum = 0.0f32;
                for p in task_region.iter() {
                    let idx = st.tile.index(p);
                    sum += pixel_error(st.accum[idx], st.variance[idx]);
                }
                task_error.update(UVec2::new(local, 0), sum / task_region.area().max(1) as f32);
            }
            task_accum_ids[local as usize] = accum_id + 1;
        }

        core.pipeline.pixel_ops().process(tile);

        for p in region.iter() {
            *st.tile.sample_mut(p) = *tile.sample(p);
        }
        core.status().add_rendered_pixels(region.area() as u64);
    }
}

impl FrameBuffer for SparseFrameBuffer {
    fn core(&self) -> &FrameBufferCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FrameBufferCore {
        &mut self.core
    }

    fn commit(&mut self) -> Result<()> {
        self.core.commit_pipeline(false)
    }

    fn begin_frame(&mut self) {
        self.core.begin_frame();
        let frame_id = self.core.frame_id();
        for st in &mut self.tiles {
            st.tile.accum_id = frame_id;
        }
    }

    fn num_render_tasks(&self) -> UVec2 {
        let tpt = self.tasks_per_tile();
        UVec2::new(self.tiles.len() as u32 * tpt.x, tpt.y)
    }

    fn task_desc(&self, task_id: u32) -> RenderTaskDesc {
        RenderTaskDesc {
            task_id,
            tile_index: self.tile_index_for_task(task_id),
            region: Self::local_task_region(&self.tiles, *self.core.desc(), task_id),
            accum_id: self.task_accum_id(task_id),
        }
    }

    fn render_task_ids(&mut self, error_threshold: f32, samples_per_pixel: u32) -> &[u32] {
        if error_threshold > 0.0
            && self.task_error.is_enabled()
            && self.core.frame_id() >= min_adaptive_frames(samples_per_pixel)
        {
            let Self {
                render_task_ids,
                active_task_ids,
                task_error,
                ..
            } = self;
            active_task_ids.clear();
            active_task_ids.extend(
                render_task_ids
                    .iter()
                    .copied()
                    .filter(|&id| task_error.get(id) > error_threshold),
            );
            &self.active_task_ids
        } else {
            &self.render_task_ids
        }
    }

    fn task_error(&self, task_id: u32) -> f32 {
        self.task_error.get(task_id)
    }

    fn accumulate(&mut self, tile: &mut Tile) {
        if let Err(err) = self.try_accumulate(tile) {
            log::warn!("sparse framebuffer skipped a tile: {err}");
        }
    }

    /// Closes the frame without refining: the owned tiles are scattered over
    /// the image, so region refinement is left to the dense buffer that
    /// composes them. Task errors stay as accumulated or set, and the
    /// reported variance is the largest of them.
    fn end_frame(&mut self, _error_threshold: f32, _camera: Option<&Camera>) {
        self.core.pipeline.end_frame();
        if self.task_error.is_enabled() {
            let variance = self
                .render_task_ids
                .iter()
                .map(|&id| self.task_error.get(id))
                .reduce(f32::max)
                .unwrap_or(f32::INFINITY);
            self.core.set_variance(variance);
        }
    }

    fn post_process(&mut self) {}

    fn clear(&mut self) {
        self.core.clear();
        self.task_error.clear();
        self.reset_empty_task_errors();
        self.task_accum_ids.fill(0);
        for st in &mut self.tiles {
            st.tile.accum_id = 0;
        }
    }

    fn map_buffer(&self, _channel: Channel) -> Option<MappedBuffer<'_>> {
        None
    }
}

impl std::fmt::Debug for SparseFrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseFrameBuffer")
            .field("size", &self.core.desc().size)
            .field("tiles", &self.tiles.iter().map(|st| st.id).collect::<Vec<_>>())
            .field("frame_id", &self.core.frame_id())
            .finish()
    }
}
