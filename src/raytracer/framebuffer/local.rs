use glam::{UVec2, Vec3, Vec4};
use rayon::prelude::*;

use super::color::encode_into;
use super::{
    blend_depth, blend_weight, lerp3, lerp4, min_adaptive_frames, pixel_error, tasks_in_region, variance_weight,
    Channel, ChannelData, ChannelFlags, ColorFormat, FrameBuffer, FrameBufferCore, FrameBufferDesc, MappedBuffer,
    SparseFrameBuffer,
};
use crate::raytracer::camera::Camera;
use crate::raytracer::error::{FrameBufferError, Result};
use crate::raytracer::imageop::{FrameView, PixelOps};
use crate::raytracer::task_error::TaskError;
use crate::raytracer::tile::{
    div_round_up, interleave_z_order, num_tiles, Region, RenderTaskDesc, Tile, TILE_SIZE,
};

/// Frame buffer holding every channel for the whole image.
pub struct LocalFrameBuffer {
    core: FrameBufferCore,
    num_tasks: UVec2,
    /// Final float color, before frame operations.
    color: Vec<Vec4>,
    /// Output of the frame operations.
    pp_color: Vec<Vec4>,
    /// Display-encoded color for the 8-bit formats.
    color8: Vec<[u8; 4]>,
    accum: Vec<Vec4>,
    variance: Vec<Vec4>,
    depth: Vec<f32>,
    normal: Vec<Vec3>,
    albedo: Vec<Vec3>,
    primitive_id: Vec<u32>,
    object_id: Vec<u32>,
    instance_id: Vec<u32>,
    task_error: TaskError,
    task_accum_ids: Vec<i32>,
    render_task_ids: Vec<u32>,
    active_task_ids: Vec<u32>,
}

/// Mutable view of one horizontal band of `TILE_SIZE` pixel rows. Bands never
/// share pixels or tasks, so they can be accumulated in parallel.
struct BandMut<'a> {
    first_row: u32,
    first_task_row: u32,
    color: &'a mut [Vec4],
    color8: &'a mut [[u8; 4]],
    accum: &'a mut [Vec4],
    variance: &'a mut [Vec4],
    depth: &'a mut [f32],
    normal: &'a mut [Vec3],
    albedo: &'a mut [Vec3],
    primitive_id: &'a mut [u32],
    object_id: &'a mut [u32],
    instance_id: &'a mut [u32],
    task_errors: &'a mut [f32],
    task_accum_ids: &'a mut [i32],
}

/// Read-only state shared by every band during accumulation.
struct AccumulateCtx<'a> {
    desc: FrameBufferDesc,
    num_tasks: UVec2,
    pixel_ops: &'a PixelOps,
    color8_format: ColorFormat,
}

fn alloc<T: Clone>(enabled: bool, len: usize, value: T) -> Vec<T> {
    if enabled {
        vec![value; len]
    } else {
        Vec::new()
    }
}

/// Splits `data` into `count` chunks of `len`; disabled (empty) buffers yield
/// empty chunks.
fn split_bands<T>(data: &mut [T], len: usize, count: usize) -> Vec<&mut [T]> {
    if data.is_empty() {
        (0..count).map(|_| -> &mut [T] { &mut [] }).collect()
    } else {
        data.chunks_mut(len).collect()
    }
}

fn band_of<T>(data: &mut [T], len: usize, band: usize) -> &mut [T] {
    if data.is_empty() {
        return data;
    }
    let start = (band * len).min(data.len());
    let end = (start + len).min(data.len());
    &mut data[start..end]
}

#[inline]
fn band_index(tile: &Tile) -> usize {
    (tile.region().lower.y / TILE_SIZE) as usize
}

impl LocalFrameBuffer {
    pub fn new(size: UVec2, color_format: ColorFormat, channels: ChannelFlags) -> Result<Self> {
        Self::with_desc(FrameBufferDesc::new(size, color_format, channels))
    }

    pub fn with_desc(desc: FrameBufferDesc) -> Result<Self> {
        let core = FrameBufferCore::new(desc)?;
        let n = desc.num_pixels();
        let num_tasks = div_round_up(desc.size, desc.render_task_size);
        let total_tasks = num_tasks.x * num_tasks.y;
        let has_color = desc.has_color();
        let encoded = has_color && matches!(desc.color_format, ColorFormat::Rgba8 | ColorFormat::Srgba);

        let mut render_task_ids: Vec<u32> = (0..total_tasks).collect();
        render_task_ids.sort_by_key(|&id| {
            let start = UVec2::new(id % num_tasks.x, id / num_tasks.x) * desc.render_task_size;
            interleave_z_order(start.x, start.y)
        });

        let task_error = if desc.has(ChannelFlags::VARIANCE) {
            TaskError::new(num_tasks)
        } else {
            TaskError::disabled()
        };

        log::debug!(
            "local framebuffer {}x{} {:?} {:?}, {} render tasks of {}x{}",
            desc.size.x,
            desc.size.y,
            desc.color_format,
            desc.channels,
            total_tasks,
            desc.render_task_size.x,
            desc.render_task_size.y
        );

        Ok(Self {
            core,
            num_tasks,
            color: alloc(has_color, n, Vec4::ZERO),
            pp_color: Vec::new(),
            color8: alloc(encoded, n, [0u8; 4]),
            accum: alloc(desc.has(ChannelFlags::ACCUM), n, Vec4::ZERO),
            variance: alloc(desc.has(ChannelFlags::VARIANCE), n, Vec4::ZERO),
            depth: alloc(desc.has(ChannelFlags::DEPTH), n, f32::INFINITY),
            normal: alloc(desc.has(ChannelFlags::NORMAL), n, Vec3::ZERO),
            albedo: alloc(desc.has(ChannelFlags::ALBEDO), n, Vec3::ZERO),
            primitive_id: alloc(desc.has(ChannelFlags::PRIMITIVE_ID), n, u32::MAX),
            object_id: alloc(desc.has(ChannelFlags::OBJECT_ID), n, u32::MAX),
            instance_id: alloc(desc.has(ChannelFlags::INSTANCE_ID), n, u32::MAX),
            task_error,
            task_accum_ids: vec![0; total_tasks as usize],
            render_task_ids,
            active_task_ids: Vec::with_capacity(total_tasks as usize),
        })
    }

    /// Dense ID of the task at a task-grid position.
    pub fn task_id_at(&self, pos: UVec2) -> Option<u32> {
        (pos.x < self.num_tasks.x && pos.y < self.num_tasks.y).then(|| pos.y * self.num_tasks.x + pos.x)
    }

    pub fn task_accum_id(&self, task_id: u32) -> i32 {
        self.task_accum_ids.get(task_id as usize).copied().unwrap_or(0)
    }

    pub fn task_errors(&self) -> &TaskError {
        &self.task_error
    }

    fn task_rows_per_band(&self) -> u32 {
        TILE_SIZE / self.core.desc().render_task_size.y
    }

    fn task_region(&self, task_id: u32) -> Region {
        let desc = self.core.desc();
        let pos = UVec2::new(task_id % self.num_tasks.x, task_id / self.num_tasks.x);
        let lower = pos * desc.render_task_size;
        Region::new(lower, (lower + desc.render_task_size).min(desc.size))
    }

    fn color_buffer(&self) -> &[Vec4] {
        if self.core.pipeline.has_frame_ops() && !self.pp_color.is_empty() {
            &self.pp_color
        } else {
            &self.color
        }
    }

    /// Copies already accumulated and processed tiles verbatim, bypassing
    /// blending and pixel operations.
    pub fn write_tiles<'t>(&mut self, tiles: impl IntoIterator<Item = &'t Tile>) {
        let desc = *self.core.desc();
        let width = desc.size.x as usize;
        for tile in tiles {
            let region = tile.region().intersect(&Region::from_size(desc.size));
            if region.is_empty() {
                continue;
            }
            for p in region.iter() {
                let s = tile.sample(p);
                let idx = p.y as usize * width + p.x as usize;
                if !self.color.is_empty() {
                    self.color[idx] = s.color;
                }
                if !self.depth.is_empty() {
                    self.depth[idx] = s.depth;
                }
                if !self.normal.is_empty() {
                    self.normal[idx] = s.normal;
                }
                if !self.albedo.is_empty() {
                    self.albedo[idx] = s.albedo;
                }
                if !self.primitive_id.is_empty() {
                    self.primitive_id[idx] = s.primitive_id;
                }
                if !self.object_id.is_empty() {
                    self.object_id[idx] = s.object_id;
                }
                if !self.instance_id.is_empty() {
                    self.instance_id[idx] = s.instance_id;
                }
            }
            if !self.color8.is_empty() {
                for y in region.lower.y..region.upper.y {
                    let row = y as usize * width;
                    let span = row + region.lower.x as usize..row + region.upper.x as usize;
                    encode_into(desc.color_format, &self.color[span.clone()], &mut self.color8[span]);
                }
            }
            self.core.status().add_rendered_pixels(region.area() as u64);
        }
    }

    /// Composes the tiles of a sparse frame buffer into this one, together
    /// with the error and accumulation state of their render tasks.
    pub fn write_sparse(&mut self, sparse: &SparseFrameBuffer) -> Result<()> {
        let dense = self.core.desc().render_task_size;
        let other = sparse.render_task_size();
        if dense != other {
            return Err(FrameBufferError::MismatchedRenderTaskSize { dense, sparse: other });
        }

        self.write_tiles(sparse.tiles());

        let track_errors = self.task_error.is_enabled() && sparse.channels().contains(ChannelFlags::VARIANCE);
        for local in sparse.active_local_tasks() {
            let pos = sparse.task_grid_pos(local);
            let Some(task_id) = self.task_id_at(pos) else {
                continue;
            };
            if track_errors {
                self.task_error.update(pos, sparse.task_error(local));
            }
            self.task_accum_ids[task_id as usize] = sparse.task_accum_id(local);
        }
        Ok(())
    }

    fn bands(&mut self) -> (Vec<BandMut<'_>>, AccumulateCtx<'_>) {
        let desc = *self.core.desc();
        let width = desc.size.x as usize;
        let band_len = width * TILE_SIZE as usize;
        let rows = TILE_SIZE / desc.render_task_size.y;
        let task_len = self.num_tasks.x as usize * rows as usize;
        let count = num_tiles(desc.size).y as usize;

        let Self {
            core,
            num_tasks,
            color,
            color8,
            accum,
            variance,
            depth,
            normal,
            albedo,
            primitive_id,
            object_id,
            instance_id,
            task_error,
            task_accum_ids,
            ..
        } = self;

        let mut color = split_bands(color, band_len, count).into_iter();
        let mut color8 = split_bands(color8, band_len, count).into_iter();
        let mut accum = split_bands(accum, band_len, count).into_iter();
        let mut variance = split_bands(variance, band_len, count).into_iter();
        let mut depth = split_bands(depth, band_len, count).into_iter();
        let mut normal = split_bands(normal, band_len, count).into_iter();
        let mut albedo = split_bands(albedo, band_len, count).into_iter();
        let mut primitive_id = split_bands(primitive_id, band_len, count).into_iter();
        let mut object_id = split_bands(object_id, band_len, count).into_iter();
        let mut instance_id = split_bands(instance_id, band_len, count).into_iter();
        let mut task_errors = split_bands(task_error.errors_mut(), task_len, count).into_iter();
        let mut task_accum_ids = split_bands(task_accum_ids, task_len, count).into_iter();

        let mut bands = Vec::with_capacity(count);
        for band in 0..count as u32 {
            let (
                Some(color),
                Some(color8),
                Some(accum),
                Some(variance),
                Some(depth),
                Some(normal),
                Some(albedo),
                Some(primitive_id),
                Some(object_id),
                Some(instance_id),
                Some(task_errors),
                Some(task_accum_ids),
            ) = (
                color.next(),
                color8.next(),
                accum.next(),
                variance.next(),
                depth.next(),
                normal.next(),
                albedo.next(),
                primitive_id.next(),
                object_id.next(),
                instance_id.next(),
                task_errors.next(),
                task_accum_ids.next(),
            )
            else {
                break;
            };
            bands.push(BandMut {
                first_row: band * TILE_SIZE,
                first_task_row: band * rows,
                color,
                color8,
                accum,
                variance,
                depth,
                normal,
                albedo,
                primitive_id,
                object_id,
                instance_id,
                task_errors,
                task_accum_ids,
            });
        }

        let ctx = AccumulateCtx {
            desc,
            num_tasks: *num_tasks,
            pixel_ops: core.pipeline.pixel_ops(),
            color8_format: desc.color_format,
        };
        (bands, ctx)
    }

    fn band(&mut self, band: usize) -> (BandMut<'_>, AccumulateCtx<'_>) {
        let desc = *self.core.desc();
        let band_len = desc.size.x as usize * TILE_SIZE as usize;
        let rows = self.task_rows_per_band();
        let task_len = self.num_tasks.x as usize * rows as usize;
        let Self {
            core,
            num_tasks,
            color,
            color8,
            accum,
            variance,
            depth,
            normal,
            albedo,
            primitive_id,
            object_id,
            instance_id,
            task_error,
            task_accum_ids,
            ..
        } = self;
        let view = BandMut {
            first_row: band as u32 * TILE_SIZE,
            first_task_row: band as u32 * rows,
            color: band_of(color, band_len, band),
            color8: band_of(color8, band_len, band),
            accum: band_of(accum, band_len, band),
            variance: band_of(variance, band_len, band),
            depth: band_of(depth, band_len, band),
            normal: band_of(normal, band_len, band),
            albedo: band_of(albedo, band_len, band),
            primitive_id: band_of(primitive_id, band_len, band),
            object_id: band_of(object_id, band_len, band),
            instance_id: band_of(instance_id, band_len, band),
            task_errors: band_of(task_error.errors_mut(), task_len, band),
            task_accum_ids: band_of(task_accum_ids, task_len, band),
        };
        let ctx = AccumulateCtx {
            desc,
            num_tasks: *num_tasks,
            pixel_ops: core.pipeline.pixel_ops(),
            color8_format: desc.color_format,
        };
        (view, ctx)
    }
}

impl BandMut<'_> {
    fn accumulate(&mut self, ctx: &AccumulateCtx<'_>, tile: &mut Tile) {
        let desc = &ctx.desc;
        let width = desc.size.x as usize;
        let region = tile.region().intersect(&Region::from_size(desc.size));
        if region.is_empty() {
            return;
        }

        let accum_id = tile.accum_id;
        let accumulate = !self.accum.is_empty();
        let weight = if desc.has(ChannelFlags::ACCUM) {
            blend_weight(accum_id)
        } else {
            1.0
        };
        let update_variance = !self.variance.is_empty() && accum_id & 1 == 1;
        let var_weight = variance_weight(accum_id);
        let write_ids = !desc.has(ChannelFlags::ACCUM) || accum_id <= 0;
        let first_row = self.first_row;

        for (p, s) in tile.iter_mut() {
            if !region.contains(p) {
                continue;
            }
            let idx = (p.y - first_row) as usize * width + p.x as usize;
            if accumulate {
                let acc = lerp4(self.accum[idx], s.color, weight);
                self.accum[idx] = acc;
                if update_variance {
                    self.variance[idx] = lerp4(self.variance[idx], s.color, var_weight);
                }
                s.color = acc;
            }
            if !self.depth.is_empty() {
                let d = blend_depth(self.depth[idx], s.depth, weight);
                self.depth[idx] = d;
                s.depth = d;
            }
            if !self.normal.is_empty() {
                let n = lerp3(self.normal[idx], s.normal, weight);
                self.normal[idx] = n;
                s.normal = n;
            }
            if !self.albedo.is_empty() {
                let a = lerp3(self.albedo[idx], s.albedo, weight);
                self.albedo[idx] = a;
                s.albedo = a;
            }
            if write_ids {
                if !self.primitive_id.is_empty() {
                    self.primitive_id[idx] = s.primitive_id;
                }
                if !self.object_id.is_empty() {
                    self.object_id[idx] = s.object_id;
                }
                if !self.instance_id.is_empty() {
                    self.instance_id[idx] = s.instance_id;
                }
            }
        }

        let task_size = desc.render_task_size;
        let ntx = ctx.num_tasks.x as usize;
        for task in tasks_in_region(region, task_size) {
            let task_idx = (task.y - self.first_task_row) as usize * ntx + task.x as usize;
            if update_variance && !self.task_errors.is_empty() {
                let lower = task * task_size;
                let task_region = Region::new(lower, (lower + task_size).min(desc.size));
                let mut sum = 0.0f32;
                for p in task_region.iter() {
                    let idx = (p.y - first_row) as usize * width + p.x as usize;
                    sum += pixel_error(self.accum[idx], self.variance[idx]);
                }
                self.task_errors[task_idx] = sum / task_region.area() as f32;
            }
            self.task_accum_ids[task_idx] = accum_id + 1;
        }

        ctx.pixel_ops.process(tile);

        if !self.color.is_empty() {
            for y in region.lower.y..region.upper.y {
                let row = (y - first_row) as usize * width;
                for x in region.lower.x..region.upper.x {
                    let p = UVec2::new(x, y);
                    self.color[row + x as usize] = tile.sample(p).color;
                }
                if !self.color8.is_empty() {
                    let span = row + region.lower.x as usize..row + region.upper.x as usize;
                    encode_into(ctx.color8_format, &self.color[span.clone()], &mut self.color8[span]);
                }
            }
        }
    }
}

impl FrameBuffer for LocalFrameBuffer {
    fn core(&self) -> &FrameBufferCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FrameBufferCore {
        &mut self.core
    }

    fn commit(&mut self) -> Result<()> {
        self.core.commit_pipeline(true)?;
        if self.core.pipeline.has_frame_ops() {
            if self.pp_color.len() != self.color.len() {
                self.pp_color = self.color.clone();
            }
        } else {
            self.pp_color = Vec::new();
        }
        log::debug!("local framebuffer committed: {:?}", self.core.pipeline);
        Ok(())
    }

    fn begin_frame(&mut self) {
        self.core.begin_frame();
        log::trace!("local framebuffer begin frame {}", self.core.frame_id());
    }

    fn num_render_tasks(&self) -> UVec2 {
        self.num_tasks
    }

    fn task_desc(&self, task_id: u32) -> RenderTaskDesc {
        let region = self.task_region(task_id);
        let tiles = num_tiles(self.core.desc().size);
        let tile = region.lower / TILE_SIZE;
        RenderTaskDesc {
            task_id,
            tile_index: tile.y * tiles.x + tile.x,
            region,
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
        if !tile.fits_cell() {
            log::warn!("local framebuffer skipped tile {:?}: it crosses a tile boundary", tile.region());
            return;
        }
        let band = band_index(tile);
        let pixels = tile.region().area() as u64;
        let status = self.core.status().clone();
        let (mut view, ctx) = self.band(band);
        view.accumulate(&ctx, tile);
        status.add_rendered_pixels(pixels);
    }

    fn accumulate_tiles(&mut self, tiles: &mut [Tile]) {
        if tiles.is_empty() {
            return;
        }
        let status = self.core.status().clone();
        let pixels: u64 = tiles
            .iter()
            .filter(|t| t.fits_cell())
            .map(|t| t.region().area() as u64)
            .sum();

        tiles.sort_unstable_by_key(band_index);
        let (bands, ctx) = self.bands();
        let mut per_band: Vec<&mut [Tile]> = (0..bands.len()).map(|_| -> &mut [Tile] { &mut [] }).collect();
        for group in tiles.chunk_by_mut(|a, b| band_index(a) == band_index(b)) {
            let band = band_index(&group[0]);
            if let Some(slot) = per_band.get_mut(band) {
                *slot = group;
            }
        }

        bands
            .into_par_iter()
            .zip(per_band)
            .for_each(|(mut band, tiles)| {
                for tile in tiles.iter_mut() {
                    if tile.fits_cell() {
                        band.accumulate(&ctx, tile);
                    } else {
                        log::warn!("local framebuffer skipped tile {:?}: it crosses a tile boundary", tile.region());
                    }
                }
            });

        status.add_rendered_pixels(pixels);
    }

    fn end_frame(&mut self, error_threshold: f32, camera: Option<&Camera>) {
        if self.core.pipeline.has_frame_ops() && !self.color.is_empty() {
            self.pp_color.clear();
            self.pp_color.extend_from_slice(&self.color);
            let mut view = FrameView {
                size: self.core.desc().size,
                color: &mut self.pp_color,
                depth: (!self.depth.is_empty()).then_some(&self.depth[..]),
                normal: (!self.normal.is_empty()).then_some(&self.normal[..]),
                albedo: (!self.albedo.is_empty()).then_some(&self.albedo[..]),
            };
            self.core.pipeline.process_frame(&mut view, camera);
        }
        self.core.pipeline.end_frame();

        if self.task_error.is_enabled() {
            let variance = self.task_error.refine(error_threshold);
            self.core.set_variance(variance);
        }
        log::trace!(
            "local framebuffer end frame {}: variance {}, {} error regions",
            self.core.frame_id(),
            self.core.variance(),
            self.task_error.regions().len()
        );
    }

    fn post_process(&mut self) {
        if !self.core.pipeline.has_frame_ops() || self.color8.is_empty() || self.pp_color.is_empty() {
            return;
        }
        let format = self.core.desc().color_format;
        let width = self.core.desc().size.x as usize;
        self.color8
            .par_chunks_mut(width)
            .zip(self.pp_color.par_chunks(width))
            .for_each(|(dst, src)| encode_into(format, src, dst));
    }

    fn clear(&mut self) {
        self.core.clear();
        self.task_error.clear();
        self.task_accum_ids.fill(0);
        log::debug!("local framebuffer cleared");
    }

    fn map_buffer(&self, channel: Channel) -> Option<MappedBuffer<'_>> {
        let data = match channel {
            Channel::Color if self.color.is_empty() => return None,
            Channel::Color => match self.core.desc().color_format {
                ColorFormat::Rgba32f => ChannelData::Rgba32f(self.color_buffer()),
                _ => ChannelData::Color8(&self.color8),
            },
            Channel::Depth if !self.depth.is_empty() => ChannelData::Depth(&self.depth),
            Channel::Accum if !self.accum.is_empty() => ChannelData::Rgba32f(&self.accum),
            Channel::Variance if !self.variance.is_empty() => ChannelData::Rgba32f(&self.variance),
            Channel::Normal if !self.normal.is_empty() => ChannelData::Vec3(&self.normal),
            Channel::Albedo if !self.albedo.is_empty() => ChannelData::Vec3(&self.albedo),
            Channel::PrimitiveId if !self.primitive_id.is_empty() => ChannelData::Id(&self.primitive_id),
            Channel::ObjectId if !self.object_id.is_empty() => ChannelData::Id(&self.object_id),
            Channel::InstanceId if !self.instance_id.is_empty() => ChannelData::Id(&self.instance_id),
            _ => return None,
        };
        Some(self.core.map(channel, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracer::imageop::ImageOpDesc;
    use crate::raytracer::tile::{tile_region, Sample};

    fn accum_fb(size: UVec2) -> LocalFrameBuffer {
        LocalFrameBuffer::new(
            size,
            ColorFormat::Rgba32f,
            ChannelFlags::COLOR | ChannelFlags::ACCUM | ChannelFlags::VARIANCE | ChannelFlags::DEPTH,
        )
        .unwrap()
    }

    fn full_tiles(size: UVec2, accum_id: i32, color: f32) -> Vec<Tile> {
        let n = num_tiles(size);
        (0..n.x * n.y)
            .map(|id| {
                let mut tile = Tile::new(tile_region(id, size), accum_id);
                tile.fill(Sample::with_color(Vec4::new(color, color, color, 1.0)));
                tile
            })
            .collect()
    }

    fn accum_at(fb: &LocalFrameBuffer, idx: usize) -> Vec4 {
        match fb.map_buffer(Channel::Accum).unwrap().data() {
            ChannelData::Rgba32f(d) => d[idx],
            other => panic!("unexpected accum layout {other:?}"),
        }
    }

    #[test]
    fn test_running_mean_example() {
        let size = UVec2::new(128, 128);
        let mut fb = accum_fb(size);
        let mut expected = Vec::new();
        for (accum_id, color) in [1.0f32, 0.0, 2.0].into_iter().enumerate() {
            fb.begin_frame();
            let mut tiles = full_tiles(size, accum_id as i32, color);
            fb.accumulate_tiles(&mut tiles);
            expected.push(accum_at(&fb, 64 * 128 + 70).x);
        }
        for (got, want) in expected.into_iter().zip([1.0, 0.5, 1.0]) {
            assert!((got - want).abs() < 1e-6, "{got} != {want}");
        }
    }

    #[test]
    fn test_single_tile_accumulate_matches_batch() {
        let size = UVec2::new(100, 70);
        let mut batch = accum_fb(size);
        let mut single = accum_fb(size);
        for (accum_id, color) in [0.25f32, 0.75, 0.5, 1.5].into_iter().enumerate() {
            let mut tiles = full_tiles(size, accum_id as i32, color);
            batch.accumulate_tiles(&mut tiles.clone());
            for tile in tiles.iter_mut().rev() {
                single.accumulate(tile);
            }
        }
        let a = batch.map_buffer(Channel::Accum).unwrap();
        let b = single.map_buffer(Channel::Accum).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_tiles_crossing_a_tile_row_are_skipped() {
        let size = UVec2::new(128, 128);
        let mut fb = accum_fb(size);
        fb.begin_frame();

        let mut crossing = Tile::new(Region::new(UVec2::new(0, 60), UVec2::new(8, 70)), 0);
        crossing.fill(Sample::with_color(Vec4::ONE));
        fb.accumulate(&mut crossing);
        fb.accumulate_tiles(&mut [crossing.clone()]);
        assert_eq!(fb.current_progress(), 0.0);
        assert_eq!(accum_at(&fb, 60 * 128), Vec4::ZERO);

        let mut inside = Tile::new(Region::new(UVec2::new(0, 56), UVec2::new(8, 64)), 0);
        inside.fill(Sample::with_color(Vec4::ONE));
        fb.accumulate(&mut inside);
        assert_eq!(accum_at(&fb, 60 * 128), Vec4::ONE);
    }

    #[test]
    fn test_without_accum_overwrites() {
        let size = UVec2::new(64, 64);
        let mut fb = LocalFrameBuffer::new(size, ColorFormat::Rgba32f, ChannelFlags::COLOR).unwrap();
        for (accum_id, color) in [1.0f32, 3.0].into_iter().enumerate() {
            fb.accumulate_tiles(&mut full_tiles(size, accum_id as i32, color));
        }
        match fb.map_buffer(Channel::Color).unwrap().data() {
            ChannelData::Rgba32f(d) => assert_eq!(d[17].x, 3.0),
            other => panic!("unexpected color layout {other:?}"),
        }
        assert!(fb.map_buffer(Channel::Accum).is_none());
    }

    #[test]
    fn test_variance_and_task_errors() {
        let size = UVec2::new(64, 64);
        let mut fb = accum_fb(size);
        assert_eq!(fb.variance(), f32::INFINITY);
        for (accum_id, color) in [1.0f32, 1.0, 1.0, 1.0].into_iter().enumerate() {
            fb.begin_frame();
            fb.accumulate_tiles(&mut full_tiles(size, accum_id as i32, color));
            fb.end_frame(0.05, None);
        }
        assert_eq!(fb.task_error(0), 0.0);
        assert_eq!(fb.variance(), 0.0);
        assert_eq!(fb.task_accum_id(0), 4);
        assert_eq!(fb.task_desc(5).accum_id, 4);

        fb.clear();
        assert_eq!(fb.variance(), f32::INFINITY);
        assert_eq!(fb.frame_id(), -1);
        assert_eq!(fb.task_desc(5).accum_id, 0);
        assert_eq!(fb.task_error(0), f32::INFINITY);
    }

    #[test]
    fn test_adaptive_task_selection() {
        let size = UVec2::new(128, 64);
        let mut fb = accum_fb(size);
        let total = fb.total_render_tasks() as usize;
        assert_eq!(total, 16 * 8);

        for frame in 0..4 {
            fb.begin_frame();
            let mut tiles = full_tiles(size, frame, 0.5);
            // Right half keeps changing, left half converges.
            for tile in tiles.iter_mut().filter(|t| t.region().lower.x >= 64) {
                let c = if frame % 2 == 0 { 0.1 } else { 0.9 };
                tile.fill(Sample::with_color(Vec4::new(c, c, c, 1.0)));
            }
            fb.accumulate_tiles(&mut tiles);
            fb.end_frame(0.3, None);
        }

        // Before the minimum number of frames every task is returned.
        assert_eq!(fb.render_task_ids(0.3, 1).len(), total);
        let active = fb.render_task_ids(0.3, 8).to_vec();
        assert_eq!(active.len(), total / 2);
        for id in active {
            assert!(fb.task_desc(id).region.lower.x >= 64);
        }
        assert_eq!(fb.render_task_ids(0.0, 8).len(), total);
    }

    #[test]
    fn test_task_ids_are_z_ordered_and_complete() {
        let size = UVec2::new(40, 24);
        let mut fb = accum_fb(size);
        let mut ids = fb.render_task_ids(0.0, 1).to_vec();
        assert_eq!(&ids[..4], &[0, 1, 5, 6]);
        ids.sort_unstable();
        assert_eq!(ids, (0..15).collect::<Vec<_>>());
        assert_eq!(
            fb.task_desc(14).region,
            Region::new(UVec2::new(32, 16), UVec2::new(40, 24))
        );
    }

    #[test]
    fn test_mapping_counts_and_missing_channels() {
        let fb = LocalFrameBuffer::new(UVec2::new(8, 8), ColorFormat::Srgba, ChannelFlags::COLOR).unwrap();
        assert!(fb.map_buffer(Channel::Depth).is_none());
        assert!(fb.map_buffer(Channel::Variance).is_none());
        let color = fb.map_buffer(Channel::Color).unwrap();
        assert_eq!(fb.map_count(), 1);
        assert_eq!(color.as_bytes().len(), 8 * 8 * 4);
        fb.unmap(color);
        assert_eq!(fb.map_count(), 0);
    }

    #[test]
    fn test_ids_come_from_first_sample() {
        let size = UVec2::new(64, 64);
        let mut fb = LocalFrameBuffer::new(
            size,
            ColorFormat::Rgba8,
            ChannelFlags::COLOR | ChannelFlags::ACCUM | ChannelFlags::OBJECT_ID,
        )
        .unwrap();
        for (accum_id, object_id) in [(0, 7u32), (1, 9u32)] {
            let mut tile = Tile::new(tile_region(0, size), accum_id);
            tile.fill(Sample {
                object_id,
                ..Sample::with_color(Vec4::ONE)
            });
            fb.accumulate(&mut tile);
        }
        match fb.map_buffer(Channel::ObjectId).unwrap().data() {
            ChannelData::Id(ids) => assert!(ids.iter().all(|&id| id == 7)),
            other => panic!("unexpected id layout {other:?}"),
        };
    }

    #[test]
    fn test_frame_ops_do_not_feed_back() {
        let size = UVec2::new(64, 64);
        let mut fb = LocalFrameBuffer::new(size, ColorFormat::Rgba32f, ChannelFlags::COLOR | ChannelFlags::ACCUM)
            .unwrap();
        fb.set_image_ops(vec![ImageOpDesc::FrameDebug]);
        fb.commit().unwrap();
        for frame in 0..2 {
            fb.begin_frame();
            fb.accumulate_tiles(&mut full_tiles(size, frame, 0.25));
            fb.end_frame(0.0, None);
            fb.post_process();
        }
        match fb.map_buffer(Channel::Color).unwrap().data() {
            ChannelData::Rgba32f(d) => assert_eq!(d[0], Vec4::new(1.0, 0.25, 0.25, 1.0)),
            other => panic!("unexpected color layout {other:?}"),
        }
        assert_eq!(fb.color[0].x, 0.25);
    }
}
