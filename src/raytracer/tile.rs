use glam::{UVec2, Vec3, Vec4};

/// Edge length of a tile in pixels.
pub const TILE_SIZE: u32 = 64;

/// Sentinel written to the ID channels where nothing was hit.
pub const INVALID_ID: u32 = u32::MAX;

/// Half-open axis-aligned box `[lower, upper)`, used both for pixel
/// rectangles and for boxes over the render-task grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Region {
    pub lower: UVec2,
    pub upper: UVec2,
}

impl Region {
    pub const fn new(lower: UVec2, upper: UVec2) -> Self {
        Self { lower, upper }
    }

    pub fn from_size(size: UVec2) -> Self {
        Self::new(UVec2::ZERO, size)
    }

    pub fn size(&self) -> UVec2 {
        UVec2::new(
            self.upper.x.saturating_sub(self.lower.x),
            self.upper.y.saturating_sub(self.lower.y),
        )
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.size().x
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.size().y
    }

    #[inline]
    pub fn area(&self) -> usize {
        let size = self.size();
        size.x as usize * size.y as usize
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    #[inline]
    pub fn contains(&self, p: UVec2) -> bool {
        p.x >= self.lower.x && p.y >= self.lower.y && p.x < self.upper.x && p.y < self.upper.y
    }

    pub fn contains_region(&self, other: &Region) -> bool {
        other.lower.x >= self.lower.x
            && other.lower.y >= self.lower.y
            && other.upper.x <= self.upper.x
            && other.upper.y <= self.upper.y
    }

    /// Intersection, possibly empty.
    pub fn intersect(&self, other: &Region) -> Region {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper).max(lower);
        Region::new(lower, upper)
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Splits the box in half along its longer axis.
    pub fn split(&self) -> (Region, Region) {
        let size = self.size();
        if size.x >= size.y {
            let mid = self.lower.x + size.x / 2;
            (
                Region::new(self.lower, UVec2::new(mid, self.upper.y)),
                Region::new(UVec2::new(mid, self.lower.y), self.upper),
            )
        } else {
            let mid = self.lower.y + size.y / 2;
            (
                Region::new(self.lower, UVec2::new(self.upper.x, mid)),
                Region::new(UVec2::new(self.lower.x, mid), self.upper),
            )
        }
    }

    /// Row-major iteration over the contained positions.
    pub fn iter(&self) -> impl Iterator<Item = UVec2> {
        let Region { lower, upper } = *self;
        (lower.y..upper.y).flat_map(move |y| (lower.x..upper.x).map(move |x| UVec2::new(x, y)))
    }
}

/// Everything the renderer produces for one pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub color: Vec4,
    pub depth: f32,
    pub normal: Vec3,
    pub albedo: Vec3,
    pub primitive_id: u32,
    pub object_id: u32,
    pub instance_id: u32,
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            color: Vec4::ZERO,
            depth: f32::INFINITY,
            normal: Vec3::ZERO,
            albedo: Vec3::ZERO,
            primitive_id: INVALID_ID,
            object_id: INVALID_ID,
            instance_id: INVALID_ID,
        }
    }
}

impl Sample {
    pub fn with_color(color: Vec4) -> Self {
        Self {
            color,
            ..Self::default()
        }
    }
}

/// A block of rendered pixels lying inside a single `TILE_SIZE` cell of the
/// image. The region is usually a whole tile or one render task. Frame buffers
/// do not accumulate the part of a tile outside the cell of its lower corner.
#[derive(Clone, Debug)]
pub struct Tile {
    region: Region,
    pub accum_id: i32,
    samples: Vec<Sample>,
}

impl Tile {
    pub fn new(region: Region, accum_id: i32) -> Self {
        Self {
            region,
            accum_id,
            samples: vec![Sample::default(); region.area()],
        }
    }

    /// Re-targets the tile at a new region, reusing its storage.
    pub fn reset(&mut self, region: Region, accum_id: i32) {
        self.region = region;
        self.accum_id = accum_id;
        self.samples.clear();
        self.samples.resize(region.area(), Sample::default());
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Position of the containing tile cell in the tile grid.
    #[inline]
    pub fn tile_pos(&self) -> UVec2 {
        self.region.lower / TILE_SIZE
    }

    /// Whether the region stays inside the tile cell of its lower corner.
    pub fn fits_cell(&self) -> bool {
        self.region.is_empty() || self.region.lower / TILE_SIZE == (self.region.upper - UVec2::ONE) / TILE_SIZE
    }

    /// Origin (lower corner) of the containing tile cell in pixels.
    #[inline]
    pub fn tile_origin(&self) -> UVec2 {
        self.tile_pos() * TILE_SIZE
    }

    #[inline]
    pub fn index(&self, p: UVec2) -> usize {
        debug_assert!(self.region.contains(p));
        let local = p - self.region.lower;
        local.y as usize * self.region.width() as usize + local.x as usize
    }

    #[inline]
    pub fn sample(&self, p: UVec2) -> &Sample {
        &self.samples[self.index(p)]
    }

    #[inline]
    pub fn sample_mut(&mut self, p: UVec2) -> &mut Sample {
        let idx = self.index(p);
        &mut self.samples[idx]
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    /// Pixel positions paired with their samples, row-major.
    pub fn iter(&self) -> impl Iterator<Item = (UVec2, &Sample)> {
        self.region.iter().zip(self.samples.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (UVec2, &mut Sample)> {
        self.region.iter().zip(self.samples.iter_mut())
    }

    pub fn fill(&mut self, sample: Sample) {
        self.samples.fill(sample);
    }
}

/// What the renderer needs to know to fill one render task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTaskDesc {
    pub task_id: u32,
    /// Index of the tile the task lives in (image tile ID for dense buffers,
    /// index into the owned tile list for sparse ones).
    pub tile_index: u32,
    /// Pixel rectangle, clipped to the image.
    pub region: Region,
    pub accum_id: i32,
}

#[inline]
pub fn div_round_up(a: UVec2, b: UVec2) -> UVec2 {
    (a + b - UVec2::ONE) / b
}

/// Number of tiles covering an image of the given size.
#[inline]
pub fn num_tiles(fb_size: UVec2) -> UVec2 {
    div_round_up(fb_size, UVec2::splat(TILE_SIZE))
}

/// Pixel region of a tile, clipped to the image.
pub fn tile_region(tile_id: u32, fb_size: UVec2) -> Region {
    let total = num_tiles(fb_size);
    let pos = UVec2::new(tile_id % total.x, tile_id / total.x);
    let lower = pos * TILE_SIZE;
    Region::new(lower, (lower + UVec2::splat(TILE_SIZE)).min(fb_size))
}

#[inline]
fn part_1_by_1(mut n: u32) -> u32 {
    n &= 0x0000_ffff;
    n = (n | (n << 8)) & 0x00ff_00ff;
    n = (n | (n << 4)) & 0x0f0f_0f0f;
    n = (n | (n << 2)) & 0x3333_3333;
    n = (n | (n << 1)) & 0x5555_5555;
    n
}

/// Morton code of a 2D position, x in the even bits.
#[inline]
pub fn interleave_z_order(x: u32, y: u32) -> u32 {
    part_1_by_1(x) | (part_1_by_1(y) << 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_longer_axis() {
        let r = Region::new(UVec2::ZERO, UVec2::new(8, 2));
        let (a, b) = r.split();
        assert_eq!(a, Region::new(UVec2::ZERO, UVec2::new(4, 2)));
        assert_eq!(b, Region::new(UVec2::new(4, 0), UVec2::new(8, 2)));

        let r = Region::new(UVec2::new(1, 1), UVec2::new(2, 6));
        let (a, b) = r.split();
        assert_eq!(a.area() + b.area(), r.area());
        assert_eq!(a.upper.y, 3);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_split_odd_extent_covers_everything() {
        let r = Region::new(UVec2::ZERO, UVec2::new(5, 3));
        let (a, b) = r.split();
        assert_eq!(a.width(), 2);
        assert_eq!(b.width(), 3);
        assert_eq!(a.area() + b.area(), 15);
    }

    #[test]
    fn test_tile_region_clips_to_image() {
        let size = UVec2::new(100, 70);
        assert_eq!(num_tiles(size), UVec2::new(2, 2));
        let r = tile_region(3, size);
        assert_eq!(r, Region::new(UVec2::new(64, 64), UVec2::new(100, 70)));
    }

    #[test]
    fn test_z_order() {
        assert_eq!(interleave_z_order(0, 0), 0);
        assert_eq!(interleave_z_order(1, 0), 1);
        assert_eq!(interleave_z_order(0, 1), 2);
        assert_eq!(interleave_z_order(1, 1), 3);
        assert_eq!(interleave_z_order(2, 0), 4);
        assert_eq!(interleave_z_order(3, 3), 15);
    }

    #[test]
    fn test_tile_indexing() {
        let region = Region::new(UVec2::new(64, 8), UVec2::new(72, 16));
        let mut tile = Tile::new(region, 3);
        assert_eq!(tile.samples().len(), 64);
        assert_eq!(tile.tile_pos(), UVec2::new(1, 0));
        tile.sample_mut(UVec2::new(65, 9)).depth = 2.0;
        assert_eq!(tile.samples()[9].depth, 2.0);
        let positions: Vec<UVec2> = tile.iter().map(|(p, _)| p).take(2).collect();
        assert_eq!(positions, vec![UVec2::new(64, 8), UVec2::new(65, 8)]);
    }
}
