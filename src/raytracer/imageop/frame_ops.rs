use glam::Vec4;
use rayon::prelude::*;

use super::{FrameOp, FrameView};
use crate::raytracer::camera::Camera;

/// Marks the frame by saturating the red channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct DebugFrameOp;

impl FrameOp for DebugFrameOp {
    fn name(&self) -> &'static str {
        "frame_debug"
    }

    fn process(&mut self, view: &mut FrameView<'_>, _camera: Option<&Camera>) {
        view.color.par_iter_mut().for_each(|c| c.x = 1.0);
    }
}

/// 3x3 box blur.
#[derive(Clone, Debug, Default)]
pub struct BlurFrameOp {
    scratch: Vec<Vec4>,
}

impl FrameOp for BlurFrameOp {
    fn name(&self) -> &'static str {
        "frame_blur"
    }

    fn process(&mut self, view: &mut FrameView<'_>, _camera: Option<&Camera>) {
        let width = view.width();
        let height = view.height();
        self.scratch.clear();
        self.scratch.extend_from_slice(view.color);
        let src = &self.scratch;

        view.color
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                let y0 = y.saturating_sub(1);
                let y1 = (y + 1).min(height - 1);
                for (x, out) in row.iter_mut().enumerate() {
                    let x0 = x.saturating_sub(1);
                    let x1 = (x + 1).min(width - 1);
                    let mut sum = Vec4::ZERO;
                    for sy in y0..=y1 {
                        for sx in x0..=x1 {
                            sum += src[sy * width + sx];
                        }
                    }
                    *out = sum / ((y1 - y0 + 1) * (x1 - x0 + 1)) as f32;
                }
            });
    }
}

/// Replaces color with depth normalised over the finite depth range; misses
/// map to white.
#[derive(Clone, Copy, Debug, Default)]
pub struct DepthFrameOp;

impl FrameOp for DepthFrameOp {
    fn name(&self) -> &'static str {
        "frame_depth"
    }

    fn process(&mut self, view: &mut FrameView<'_>, _camera: Option<&Camera>) {
        let Some(depth) = view.depth else {
            return;
        };
        let (min, max) = depth
            .iter()
            .filter(|d| d.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &d| (lo.min(d), hi.max(d)));
        let range = max - min;
        let scale = if range > 0.0 { 1.0 / range } else { 0.0 };

        view.color
            .par_iter_mut()
            .zip(depth.par_iter())
            .for_each(|(c, &d)| {
                let z = if d.is_finite() { (d - min) * scale } else { 1.0 };
                *c = Vec4::new(z, z, z, c.w);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec2;

    fn view<'a>(size: UVec2, color: &'a mut [Vec4], depth: Option<&'a [f32]>) -> FrameView<'a> {
        FrameView {
            size,
            color,
            depth,
            normal: None,
            albedo: None,
        }
    }

    #[test]
    fn test_blur_spreads_a_single_pixel() {
        let mut color = vec![Vec4::ZERO; 9];
        color[4] = Vec4::splat(9.0);
        BlurFrameOp::default().process(&mut view(UVec2::new(3, 3), &mut color, None), None);
        assert_eq!(color[4], Vec4::ONE);
        // Corner averages its 2x2 neighbourhood.
        assert_eq!(color[0], Vec4::splat(9.0 / 4.0));
    }

    #[test]
    fn test_depth_normalises_finite_range() {
        let mut color = vec![Vec4::new(0.0, 0.0, 0.0, 1.0); 3];
        let depth = [2.0, 4.0, f32::INFINITY];
        DepthFrameOp.process(&mut view(UVec2::new(3, 1), &mut color, Some(&depth)), None);
        assert_eq!(color[0], Vec4::new(0.0, 0.0, 0.0, 1.0));
        assert_eq!(color[1], Vec4::new(1.0, 1.0, 1.0, 1.0));
        assert_eq!(color[2], Vec4::new(1.0, 1.0, 1.0, 1.0));
    }

    #[test]
    fn test_debug_saturates_red() {
        let mut color = vec![Vec4::splat(0.25); 2];
        DebugFrameOp.process(&mut view(UVec2::new(2, 1), &mut color, None), None);
        assert_eq!(color[1], Vec4::new(1.0, 0.25, 0.25, 0.25));
    }
}
