//! Progressive frame buffers.
//!
//! A frame buffer receives fully rendered [`Tile`]s, folds them into its
//! persistent channels as a running mean, estimates per-task error for
//! adaptive stopping and runs the attached image operations. Two backends
//! implement the [`FrameBuffer`] contract: [`LocalFrameBuffer`] stores the
//! whole image, [`SparseFrameBuffer`] only a chosen subset of tiles.

pub mod color;
mod local;
mod sparse;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use glam::{UVec2, Vec3, Vec4};
use parking_lot::{Condvar, Mutex};

use crate::raytracer::camera::Camera;
use crate::raytracer::error::{FrameBufferError, Result};
use crate::raytracer::imageop::{ImageOpDesc, ImagePipeline};
use crate::raytracer::tile::{div_round_up, Region, RenderTaskDesc, Tile, TILE_SIZE};

pub use local::LocalFrameBuffer;
pub use sparse::SparseFrameBuffer;

pub const DEFAULT_RENDER_TASK_SIZE: UVec2 = UVec2::new(8, 8);

bitflags! {
    /// Channels requested at construction.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ChannelFlags: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        /// Progressive accumulation across frames.
        const ACCUM = 1 << 2;
        /// Variance estimation; requires `ACCUM`.
        const VARIANCE = 1 << 3;
        const NORMAL = 1 << 4;
        const ALBEDO = 1 << 5;
        const PRIMITIVE_ID = 1 << 6;
        const OBJECT_ID = 1 << 7;
        const INSTANCE_ID = 1 << 8;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    None,
    Rgba8,
    #[default]
    Srgba,
    Rgba32f,
}

/// A mappable buffer of the frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Color,
    Depth,
    Accum,
    Variance,
    Normal,
    Albedo,
    PrimitiveId,
    ObjectId,
    InstanceId,
}

/// Validated construction parameters shared by every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameBufferDesc {
    pub size: UVec2,
    pub color_format: ColorFormat,
    pub channels: ChannelFlags,
    pub render_task_size: UVec2,
}

impl FrameBufferDesc {
    pub fn new(size: UVec2, color_format: ColorFormat, channels: ChannelFlags) -> Self {
        Self {
            size,
            color_format,
            channels,
            render_task_size: DEFAULT_RENDER_TASK_SIZE,
        }
    }

    pub fn with_render_task_size(mut self, render_task_size: UVec2) -> Self {
        self.render_task_size = render_task_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.size.x == 0 || self.size.y == 0 {
            return Err(FrameBufferError::InvalidSize {
                width: self.size.x,
                height: self.size.y,
            });
        }

        let task = self.render_task_size;
        let valid_axis = |n: u32| n.is_power_of_two() && n <= TILE_SIZE;
        if !valid_axis(task.x) || !valid_axis(task.y) {
            return Err(FrameBufferError::InvalidRenderTaskSize {
                width: task.x,
                height: task.y,
                tile_size: TILE_SIZE,
            });
        }

        if self.channels.contains(ChannelFlags::VARIANCE) && !self.channels.contains(ChannelFlags::ACCUM) {
            return Err(FrameBufferError::InvalidChannels {
                channels: self.channels,
                format: self.color_format,
                reason: "VARIANCE requires ACCUM",
            });
        }
        if self.channels.contains(ChannelFlags::COLOR) && self.color_format == ColorFormat::None {
            return Err(FrameBufferError::InvalidChannels {
                channels: self.channels,
                format: self.color_format,
                reason: "COLOR requires a color format",
            });
        }
        Ok(())
    }

    #[inline]
    pub fn has(&self, flags: ChannelFlags) -> bool {
        self.channels.contains(flags)
    }

    pub fn has_color(&self) -> bool {
        self.has(ChannelFlags::COLOR) && self.color_format != ColorFormat::None
    }

    pub fn num_pixels(&self) -> usize {
        self.size.x as usize * self.size.y as usize
    }

    pub fn tasks_per_tile(&self) -> UVec2 {
        UVec2::splat(TILE_SIZE) / self.render_task_size
    }
}

/// Completion stage of the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SyncEvent {
    NoneFinished = 0,
    /// Every dispatched task has been accumulated.
    WorldRendered = 1,
    FrameFinished = 2,
}

impl SyncEvent {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SyncEvent::NoneFinished,
            1 => SyncEvent::WorldRendered,
            _ => SyncEvent::FrameFinished,
        }
    }
}

/// Per-frame status observable from any thread while the frame buffer
/// itself is borrowed by the render loop.
#[derive(Debug)]
pub struct FrameStatus {
    cancel: AtomicBool,
    pixels_rendered: AtomicU64,
    total_pixels: u64,
    event: AtomicU8,
    event_lock: Mutex<()>,
    event_cv: Condvar,
}

impl FrameStatus {
    pub fn new(total_pixels: u64) -> Self {
        Self {
            cancel: AtomicBool::new(false),
            pixels_rendered: AtomicU64::new(0),
            total_pixels,
            event: AtomicU8::new(SyncEvent::NoneFinished as u8),
            event_lock: Mutex::new(()),
            event_cv: Condvar::new(),
        }
    }

    fn begin(&self) {
        self.cancel.store(false, Ordering::Release);
        self.pixels_rendered.store(0, Ordering::Relaxed);
        self.event.store(SyncEvent::NoneFinished as u8, Ordering::Release);
    }

    /// Requests cooperative cancellation of the running frame.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn add_rendered_pixels(&self, count: u64) {
        self.pixels_rendered.fetch_add(count, Ordering::Relaxed);
    }

    /// Fraction of the image rendered in the current frame.
    pub fn progress(&self) -> f32 {
        if self.total_pixels == 0 {
            return 0.0;
        }
        let done = self.pixels_rendered.load(Ordering::Relaxed).min(self.total_pixels);
        done as f32 / self.total_pixels as f32
    }

    pub fn set_completed(&self, event: SyncEvent) {
        if event == SyncEvent::FrameFinished {
            self.pixels_rendered.store(self.total_pixels, Ordering::Relaxed);
        }
        let _guard = self.event_lock.lock();
        self.event.store(event as u8, Ordering::Release);
        self.event_cv.notify_all();
    }

    pub fn latest_complete_event(&self) -> SyncEvent {
        SyncEvent::from_u8(self.event.load(Ordering::Acquire))
    }

    /// Blocks until the frame reached at least `event`.
    pub fn wait_for_event(&self, event: SyncEvent) {
        let mut guard = self.event_lock.lock();
        while self.latest_complete_event() < event {
            self.event_cv.wait(&mut guard);
        }
    }
}

/// Borrowed view of one channel. Mapping bumps the owner's map count and
/// dropping the view (or passing it to [`FrameBuffer::unmap`]) releases it.
pub struct MappedBuffer<'a> {
    channel: Channel,
    data: ChannelData<'a>,
    mappings: &'a AtomicUsize,
}

#[derive(Clone, Copy, Debug)]
pub enum ChannelData<'a> {
    /// `Rgba8`/`Srgba` color.
    Color8(&'a [[u8; 4]]),
    /// `Rgba32f` color, accumulation and variance.
    Rgba32f(&'a [Vec4]),
    Depth(&'a [f32]),
    /// Normal and albedo.
    Vec3(&'a [Vec3]),
    Id(&'a [u32]),
}

impl<'a> MappedBuffer<'a> {
    pub(crate) fn new(channel: Channel, data: ChannelData<'a>, mappings: &'a AtomicUsize) -> Self {
        mappings.fetch_add(1, Ordering::AcqRel);
        Self {
            channel,
            data,
            mappings,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn data(&self) -> ChannelData<'a> {
        self.data
    }

    /// Number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self.data {
            ChannelData::Color8(d) => d.len(),
            ChannelData::Rgba32f(d) => d.len(),
            ChannelData::Depth(d) => d.len(),
            ChannelData::Vec3(d) => d.len(),
            ChannelData::Id(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        match self.data {
            ChannelData::Color8(d) => bytemuck::cast_slice(d),
            ChannelData::Rgba32f(d) => bytemuck::cast_slice(d),
            ChannelData::Depth(d) => bytemuck::cast_slice(d),
            ChannelData::Vec3(d) => bytemuck::cast_slice(d),
            ChannelData::Id(d) => bytemuck::cast_slice(d),
        }
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        self.mappings.fetch_sub(1, Ordering::AcqRel);
    }
}

/// State and lifecycle shared by every backend.
#[derive(Debug)]
pub struct FrameBufferCore {
    desc: FrameBufferDesc,
    frame_id: i32,
    variance: f32,
    status: Arc<FrameStatus>,
    image_ops: Vec<ImageOpDesc>,
    pub(crate) pipeline: ImagePipeline,
    mappings: AtomicUsize,
}

impl FrameBufferCore {
    pub fn new(desc: FrameBufferDesc) -> Result<Self> {
        desc.validate()?;
        Ok(Self {
            desc,
            frame_id: -1,
            variance: f32::INFINITY,
            status: Arc::new(FrameStatus::new(desc.num_pixels() as u64)),
            image_ops: Vec::new(),
            pipeline: ImagePipeline::default(),
            mappings: AtomicUsize::new(0),
        })
    }

    pub fn desc(&self) -> &FrameBufferDesc {
        &self.desc
    }

    pub fn frame_id(&self) -> i32 {
        self.frame_id
    }

    pub fn variance(&self) -> f32 {
        self.variance
    }

    pub(crate) fn set_variance(&mut self, variance: f32) {
        self.variance = variance;
    }

    pub fn status(&self) -> &Arc<FrameStatus> {
        &self.status
    }

    pub fn image_ops(&self) -> &[ImageOpDesc] {
        &self.image_ops
    }

    pub(crate) fn set_image_ops(&mut self, ops: Vec<ImageOpDesc>) {
        self.image_ops = ops;
    }

    /// Rebuilds the pipeline from the attached descriptors. On error the
    /// previously committed pipeline stays in place.
    pub(crate) fn commit_pipeline(&mut self, allow_frame_ops: bool) -> Result<()> {
        let pipeline = ImagePipeline::build(&self.image_ops, &self.desc, allow_frame_ops)?;
        self.pipeline = pipeline;
        Ok(())
    }

    pub(crate) fn begin_frame(&mut self) {
        self.frame_id += 1;
        self.status.begin();
        self.pipeline.begin_frame();
    }

    pub(crate) fn clear(&mut self) {
        self.frame_id = -1;
        self.variance = f32::INFINITY;
    }

    pub(crate) fn map<'a>(&'a self, channel: Channel, data: ChannelData<'a>) -> MappedBuffer<'a> {
        MappedBuffer::new(channel, data, &self.mappings)
    }

    pub fn map_count(&self) -> usize {
        self.mappings.load(Ordering::Acquire)
    }
}

/// Minimum number of frames before adaptive stopping may drop tasks.
pub fn min_adaptive_frames(samples_per_pixel: u32) -> i32 {
    let spp = samples_per_pixel.max(1) as i32;
    (16 / spp).max(2)
}

/// The frame buffer contract. Backends are chosen once, at construction.
pub trait FrameBuffer: Send {
    fn core(&self) -> &FrameBufferCore;

    fn core_mut(&mut self) -> &mut FrameBufferCore;

    /// Replaces the image operation descriptors; takes effect on `commit`.
    fn set_image_ops(&mut self, ops: Vec<ImageOpDesc>) {
        self.core_mut().set_image_ops(ops);
    }

    /// Validates and instantiates the attached image operations.
    fn commit(&mut self) -> Result<()>;

    fn begin_frame(&mut self);

    /// Grid of render tasks this buffer schedules.
    fn num_render_tasks(&self) -> UVec2;

    fn total_render_tasks(&self) -> u32 {
        let n = self.num_render_tasks();
        n.x * n.y
    }

    fn task_desc(&self, task_id: u32) -> RenderTaskDesc;

    /// Tasks to render this frame: those whose error exceeds the threshold
    /// once adaptive stopping is allowed, otherwise all of them.
    fn render_task_ids(&mut self, error_threshold: f32, samples_per_pixel: u32) -> &[u32];

    fn task_error(&self, task_id: u32) -> f32;

    /// Folds one fully populated tile into persistent storage.
    fn accumulate(&mut self, tile: &mut Tile);

    /// Folds a batch of tiles with pairwise disjoint regions.
    fn accumulate_tiles(&mut self, tiles: &mut [Tile]) {
        for tile in tiles {
            self.accumulate(tile);
        }
    }

    fn end_frame(&mut self, error_threshold: f32, camera: Option<&Camera>);

    /// Finishes device-side processing of the frame (color conversion of
    /// frame operation output).
    fn post_process(&mut self);

    fn clear(&mut self);

    fn map_buffer(&self, channel: Channel) -> Option<MappedBuffer<'_>>;

    fn unmap(&self, mapped: MappedBuffer<'_>) {
        drop(mapped);
    }

    fn desc(&self) -> &FrameBufferDesc {
        self.core().desc()
    }

    fn size(&self) -> UVec2 {
        self.desc().size
    }

    fn color_format(&self) -> ColorFormat {
        self.desc().color_format
    }

    fn channels(&self) -> ChannelFlags {
        self.desc().channels
    }

    fn render_task_size(&self) -> UVec2 {
        self.desc().render_task_size
    }

    fn frame_id(&self) -> i32 {
        self.core().frame_id()
    }

    fn status(&self) -> &Arc<FrameStatus> {
        self.core().status()
    }

    fn cancel_frame(&self) {
        self.core().status().cancel();
    }

    fn frame_cancelled(&self) -> bool {
        self.core().status().is_cancelled()
    }

    fn current_progress(&self) -> f32 {
        self.core().status().progress()
    }

    /// Frame error from the last `end_frame`, `+inf` before any.
    fn variance(&self) -> f32 {
        self.core().variance()
    }

    fn map_count(&self) -> usize {
        self.core().map_count()
    }
}

#[inline]
pub(crate) fn blend_weight(accum_id: i32) -> f32 {
    1.0 / (accum_id.max(0) + 1) as f32
}

/// Weight of an odd sample in the every-other-sample variance buffer.
#[inline]
pub(crate) fn variance_weight(accum_id: i32) -> f32 {
    1.0 / ((accum_id.max(1) + 1) / 2) as f32
}

#[inline]
pub(crate) fn lerp4(acc: Vec4, sample: Vec4, weight: f32) -> Vec4 {
    if weight >= 1.0 {
        sample
    } else {
        acc + (sample - acc) * weight
    }
}

#[inline]
pub(crate) fn lerp3(acc: Vec3, sample: Vec3, weight: f32) -> Vec3 {
    if weight >= 1.0 {
        sample
    } else {
        acc + (sample - acc) * weight
    }
}

/// Running mean over hits, with the same weight as color. A miss has infinite
/// depth, and blending it with a hit would give infinity or NaN, so a miss
/// keeps the stored hit and the first hit replaces a stored miss.
#[inline]
pub(crate) fn blend_depth(acc: f32, sample: f32, weight: f32) -> f32 {
    if weight >= 1.0 || !acc.is_finite() {
        sample
    } else if !sample.is_finite() {
        acc
    } else {
        acc + (sample - acc) * weight
    }
}

/// Relative difference between the all-samples and odd-samples estimates of
/// one pixel.
#[inline]
pub(crate) fn pixel_error(acc: Vec4, var: Vec4) -> f32 {
    let den = acc.x + acc.y + acc.z + (1.0 - acc.w);
    if den > 0.0 {
        let diff = (acc - var).abs();
        (diff.x + diff.y + diff.z) / den.sqrt()
    } else {
        0.0
    }
}

/// Task grid positions overlapping the pixel `region`.
pub(crate) fn tasks_in_region(region: Region, task_size: UVec2) -> impl Iterator<Item = UVec2> {
    let lower = region.lower / task_size;
    let upper = div_round_up(region.upper, task_size);
    Region::new(lower, upper).iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_validation() {
        let ok = FrameBufferDesc::new(UVec2::new(16, 16), ColorFormat::Srgba, ChannelFlags::COLOR);
        assert!(ok.validate().is_ok());

        let zero = FrameBufferDesc::new(UVec2::new(0, 16), ColorFormat::Srgba, ChannelFlags::COLOR);
        assert!(matches!(zero.validate(), Err(FrameBufferError::InvalidSize { .. })));

        let variance = FrameBufferDesc::new(
            UVec2::new(16, 16),
            ColorFormat::Srgba,
            ChannelFlags::COLOR | ChannelFlags::VARIANCE,
        );
        assert!(matches!(variance.validate(), Err(FrameBufferError::InvalidChannels { .. })));

        let task = ok.with_render_task_size(UVec2::new(3, 8));
        assert!(matches!(task.validate(), Err(FrameBufferError::InvalidRenderTaskSize { .. })));

        let no_format = FrameBufferDesc::new(UVec2::new(4, 4), ColorFormat::None, ChannelFlags::COLOR);
        assert!(no_format.validate().is_err());
    }

    #[test]
    fn test_depth_blends_over_hits_only() {
        let samples = [f32::INFINITY, 2.0, f32::INFINITY, 4.0];
        let mut depth = f32::INFINITY;
        let mut trace = Vec::new();
        for (accum_id, &d) in samples.iter().enumerate() {
            depth = blend_depth(depth, d, blend_weight(accum_id as i32));
            trace.push(depth);
        }
        assert_eq!(trace, vec![f32::INFINITY, 2.0, 2.0, 2.5]);
        assert_eq!(blend_depth(1.0, 3.0, blend_weight(1)), 2.0);
    }

    #[test]
    fn test_min_adaptive_frames() {
        assert_eq!(min_adaptive_frames(1), 16);
        assert_eq!(min_adaptive_frames(4), 4);
        assert_eq!(min_adaptive_frames(16), 2);
        assert_eq!(min_adaptive_frames(64), 2);
    }

    #[test]
    fn test_variance_weights_follow_odd_samples() {
        assert_eq!(variance_weight(1), 1.0);
        assert_eq!(variance_weight(3), 0.5);
        assert!((variance_weight(5) - 1.0 / 3.0).abs() < 1e-7);
    }

    #[test]
    fn test_status_progress_and_events() {
        let status = FrameStatus::new(100);
        status.add_rendered_pixels(25);
        assert!((status.progress() - 0.25).abs() < 1e-6);
        status.set_completed(SyncEvent::FrameFinished);
        assert_eq!(status.progress(), 1.0);
        status.wait_for_event(SyncEvent::WorldRendered);
        status.begin();
        assert_eq!(status.latest_complete_event(), SyncEvent::NoneFinished);
        assert_eq!(status.progress(), 0.0);
    }

    #[test]
    fn test_depth_blend_ignores_misses() {
        assert_eq!(blend_depth(2.0, f32::INFINITY, 0.5), 2.0);
        assert_eq!(blend_depth(f32::INFINITY, 4.0, 0.5), 4.0);
        assert_eq!(blend_depth(2.0, 4.0, 0.5), 3.0);
        assert_eq!(blend_depth(2.0, f32::INFINITY, 1.0), f32::INFINITY);
    }
}
