use glam::{Vec3, Vec4Swizzles};
use rayon::prelude::*;

use super::{FrameOp, FrameView};
use crate::raytracer::camera::Camera;

pub struct DenoiseInput<'a> {
    pub color: &'a [Vec3],
    pub albedo: Option<&'a [Vec3]>,
    pub normal: Option<&'a [Vec3]>,
    pub width: usize,
    pub height: usize,
}

pub trait Denoiser: Send + Sync {
    fn denoise(&self, input: DenoiseInput) -> Vec<Vec3>;
}

/// Edge-aware blur: neighbours are weighted by distance, color difference
/// and, when available, albedo and normal similarity.
#[derive(Clone, Copy, Debug)]
pub struct CrossBilateralDenoiser {
    pub radius: usize,
    pub sigma_spatial: f32,
    pub sigma_color: f32,
    pub sigma_albedo: f32,
    pub sigma_normal: f32,
}

impl Default for CrossBilateralDenoiser {
    fn default() -> Self {
        Self {
            radius: 3,
            sigma_spatial: 2.0,
            sigma_color: 0.5,
            sigma_albedo: 0.1,
            sigma_normal: 0.2,
        }
    }
}

#[inline]
fn gaussian(d2: f32, sigma: f32) -> f32 {
    (-d2 / (2.0 * sigma * sigma)).exp()
}

impl Denoiser for CrossBilateralDenoiser {
    fn denoise(&self, input: DenoiseInput) -> Vec<Vec3> {
        let DenoiseInput {
            color,
            albedo,
            normal,
            width,
            height,
        } = input;
        let r = self.radius as isize;
        let mut output = vec![Vec3::ZERO; width * height];

        output
            .par_chunks_mut(width.max(1))
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    let center = y * width + x;
                    let c0 = color[center];
                    let mut sum = Vec3::ZERO;
                    let mut weight_sum = 0.0f32;
                    for dy in -r..=r {
                        let ny = y as isize + dy;
                        if ny < 0 || ny >= height as isize {
                            continue;
                        }
                        for dx in -r..=r {
                            let nx = x as isize + dx;
                            if nx < 0 || nx >= width as isize {
                                continue;
                            }
                            let idx = ny as usize * width + nx as usize;
                            let c = color[idx];
                            let mut w = gaussian((dx * dx + dy * dy) as f32, self.sigma_spatial)
                                * gaussian((c - c0).length_squared(), self.sigma_color);
                            if let Some(albedo) = albedo {
                                w *= gaussian((albedo[idx] - albedo[center]).length_squared(), self.sigma_albedo);
                            }
                            if let Some(normal) = normal {
                                w *= gaussian((normal[idx] - normal[center]).length_squared(), self.sigma_normal);
                            }
                            sum += c * w;
                            weight_sum += w;
                        }
                    }
                    *out = if weight_sum > 0.0 { sum / weight_sum } else { c0 };
                }
            });

        output
    }
}

pub struct DenoiseFrameOp<D> {
    denoiser: D,
    scratch: Vec<Vec3>,
}

impl<D: Denoiser> DenoiseFrameOp<D> {
    pub fn new(denoiser: D) -> Self {
        Self {
            denoiser,
            scratch: Vec::new(),
        }
    }
}

impl<D: Denoiser + 'static> FrameOp for DenoiseFrameOp<D> {
    fn name(&self) -> &'static str {
        "frame_denoise"
    }

    fn process(&mut self, view: &mut FrameView<'_>, _camera: Option<&Camera>) {
        self.scratch.clear();
        self.scratch.extend(view.color.iter().map(|c| c.xyz()));
        let denoised = self.denoiser.denoise(DenoiseInput {
            color: &self.scratch,
            albedo: view.albedo,
            normal: view.normal,
            width: view.width(),
            height: view.height(),
        });
        for (dst, src) in view.color.iter_mut().zip(denoised) {
            *dst = src.extend(dst.w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{UVec2, Vec4};

    #[test]
    fn test_constant_image_is_unchanged() {
        let color = vec![Vec3::splat(0.3); 16];
        let out = CrossBilateralDenoiser::default().denoise(DenoiseInput {
            color: &color,
            albedo: None,
            normal: None,
            width: 4,
            height: 4,
        });
        for c in out {
            assert!((c - Vec3::splat(0.3)).abs().max_element() < 1e-6);
        }
    }

    #[test]
    fn test_reduces_noise_but_keeps_albedo_edges() {
        let width = 8;
        let mut color = Vec::new();
        let mut albedo = Vec::new();
        for y in 0..8 {
            for x in 0..width {
                let base = if x < 4 { 0.2 } else { 0.8 };
                let noise = if (x + y) % 2 == 0 { 0.05 } else { -0.05 };
                color.push(Vec3::splat(base + noise));
                albedo.push(Vec3::splat(base));
            }
        }
        let out = CrossBilateralDenoiser::default().denoise(DenoiseInput {
            color: &color,
            albedo: Some(&albedo),
            normal: None,
            width,
            height: 8,
        });
        let center = 3 * width + 1;
        assert!((out[center].x - 0.2).abs() < 0.05);
        assert!((out[3 * width + 3].x - 0.2).abs() < 0.05);
        assert!((out[3 * width + 4].x - 0.8).abs() < 0.05);
    }

    #[test]
    fn test_frame_op_keeps_alpha() {
        let mut color = vec![Vec4::new(1.0, 1.0, 1.0, 0.5); 4];
        let mut view = FrameView {
            size: UVec2::new(2, 2),
            color: &mut color,
            depth: None,
            normal: None,
            albedo: None,
        };
        DenoiseFrameOp::new(CrossBilateralDenoiser::default()).process(&mut view, None);
        assert!(color.iter().all(|c| c.w == 0.5));
    }
}
