//! Small analytic scene used to drive the frame buffer: a few spheres on a
//! ground plane, lit by a soft sun and a sky dome. Every sample is noisy
//! (soft shadows and one ambient occlusion ray) so adaptive sampling has
//! something to converge.

pub mod sampling;

use glam::{UVec2, Vec3, Vec4};

use crate::raytracer::camera::Ray;
use crate::raytracer::renderloop::{FrameContext, PixelRenderer};
use crate::raytracer::tile::{Sample, INVALID_ID};
use sampling::{build_basis, sample_cosine_hemisphere, sample_disk, to_world, Rng};

const RAY_EPSILON: f32 = 1e-3;

#[derive(Clone, Copy, Debug)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
    pub albedo: Vec3,
}

impl Sphere {
    fn intersect(&self, ray: &Ray, t_max: f32) -> Option<f32> {
        let oc = ray.origin - self.center;
        let b = oc.dot(ray.direction);
        let c = oc.length_squared() - self.radius * self.radius;
        let disc = b * b - c;
        if disc < 0.0 {
            return None;
        }
        let sq = disc.sqrt();
        [-b - sq, -b + sq]
            .into_iter()
            .find(|&t| t > RAY_EPSILON && t < t_max)
    }
}

struct Hit {
    t: f32,
    normal: Vec3,
    albedo: Vec3,
    object_id: u32,
}

pub struct SphereScene {
    pub spheres: Vec<Sphere>,
    pub ground_albedo: Vec3,
    pub sun_direction: Vec3,
    pub sun_color: Vec3,
    /// Angular radius of the sun disk, controls shadow softness.
    pub sun_radius: f32,
    pub sky_color: Vec3,
}

impl Default for SphereScene {
    fn default() -> Self {
        Self {
            spheres: vec![
                Sphere {
                    center: Vec3::new(-1.1, 0.5, 0.0),
                    radius: 0.5,
                    albedo: Vec3::new(0.8, 0.3, 0.2),
                },
                Sphere {
                    center: Vec3::new(0.0, 0.7, -0.4),
                    radius: 0.7,
                    albedo: Vec3::new(0.3, 0.7, 0.3),
                },
                Sphere {
                    center: Vec3::new(1.1, 0.4, 0.3),
                    radius: 0.4,
                    albedo: Vec3::new(0.2, 0.4, 0.9),
                },
            ],
            ground_albedo: Vec3::splat(0.6),
            sun_direction: Vec3::new(0.5, 1.0, 0.4).normalize(),
            sun_color: Vec3::splat(2.5),
            sun_radius: 0.15,
            sky_color: Vec3::new(0.5, 0.6, 0.8),
        }
    }
}

impl SphereScene {
    /// Object ID of the ground plane; spheres use their index.
    pub fn ground_id(&self) -> u32 {
        self.spheres.len() as u32
    }

    fn hit(&self, ray: &Ray) -> Option<Hit> {
        let mut closest: Option<Hit> = None;
        let mut t_max = f32::INFINITY;
        for (i, sphere) in self.spheres.iter().enumerate() {
            if let Some(t) = sphere.intersect(ray, t_max) {
                t_max = t;
                closest = Some(Hit {
                    t,
                    normal: (ray.at(t) - sphere.center) / sphere.radius,
                    albedo: sphere.albedo,
                    object_id: i as u32,
                });
            }
        }
        if ray.direction.y < 0.0 {
            let t = -ray.origin.y / ray.direction.y;
            if t > RAY_EPSILON && t < t_max {
                closest = Some(Hit {
                    t,
                    normal: Vec3::Y,
                    albedo: self.ground_albedo,
                    object_id: self.ground_id(),
                });
            }
        }
        closest
    }

    fn occluded(&self, ray: &Ray) -> bool {
        self.spheres.iter().any(|s| s.intersect(ray, f32::INFINITY).is_some())
    }

    fn sky(&self, direction: Vec3) -> Vec3 {
        let t = 0.5 * (direction.y + 1.0);
        Vec3::ONE.lerp(self.sky_color, t)
    }
}

impl PixelRenderer for SphereScene {
    fn render_pixel(&self, pixel: UVec2, sample_index: u32, ctx: &FrameContext<'_>) -> Sample {
        let mut rng = Rng::for_sample(pixel, sample_index);
        let ray = ctx.camera.pixel_ray(pixel, ctx.image_size, rng.next_vec2());

        let Some(hit) = self.hit(&ray) else {
            return Sample::with_color(self.sky(ray.direction).extend(1.0));
        };

        let position = ray.at(hit.t) + hit.normal * RAY_EPSILON;
        let (t, b, n) = build_basis(hit.normal);

        let (st, sb, sn) = build_basis(self.sun_direction);
        let disk = sample_disk(rng.next(), rng.next()) * self.sun_radius;
        let to_sun = to_world(disk.extend(1.0), st, sb, sn).normalize();
        let n_dot_l = hit.normal.dot(to_sun).max(0.0);
        let direct = if n_dot_l > 0.0 && !self.occluded(&Ray::new(position, to_sun)) {
            self.sun_color * n_dot_l
        } else {
            Vec3::ZERO
        };

        let ao_dir = to_world(sample_cosine_hemisphere(rng.next(), rng.next()), t, b, n);
        let ambient = if self.occluded(&Ray::new(position, ao_dir)) {
            Vec3::ZERO
        } else {
            self.sky(ao_dir)
        };

        let color = hit.albedo * (direct + ambient);
        Sample {
            color: Vec4::new(color.x, color.y, color.z, 1.0),
            depth: hit.t,
            normal: hit.normal,
            albedo: hit.albedo,
            primitive_id: 0,
            object_id: hit.object_id,
            instance_id: if hit.object_id == self.ground_id() { INVALID_ID } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracer::camera::Camera;

    #[test]
    fn test_sky_and_ground_samples() {
        let scene = SphereScene {
            spheres: Vec::new(),
            ..SphereScene::default()
        };
        let camera = Camera::new(Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 1.0, -1.0), 90.0, 1.0);
        let ctx = FrameContext {
            camera: &camera,
            image_size: UVec2::new(16, 16),
            frame_id: 0,
            samples_per_pixel: 1,
        };

        let up = scene.render_pixel(UVec2::new(8, 0), 0, &ctx);
        assert_eq!(up.depth, f32::INFINITY);
        assert_eq!(up.object_id, INVALID_ID);
        assert_eq!(up.color.w, 1.0);

        let down = scene.render_pixel(UVec2::new(8, 15), 0, &ctx);
        assert!(down.depth.is_finite());
        assert_eq!(down.object_id, scene.ground_id());
        assert_eq!(down.normal, Vec3::Y);
    }

    #[test]
    fn test_samples_are_reproducible() {
        let scene = SphereScene::default();
        let camera = Camera::default();
        let ctx = FrameContext {
            camera: &camera,
            image_size: UVec2::new(32, 32),
            frame_id: 3,
            samples_per_pixel: 1,
        };
        let a = scene.render_pixel(UVec2::new(16, 20), 5, &ctx);
        let b = scene.render_pixel(UVec2::new(16, 20), 5, &ctx);
        assert_eq!(a, b);
    }
}
