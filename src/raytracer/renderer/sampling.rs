use glam::{UVec2, Vec2, Vec3};
use std::f32::consts::PI;

pub fn sample_cosine_hemisphere(u1: f32, u2: f32) -> Vec3 {
    let r = u1.sqrt();
    let phi = 2.0 * PI * u2;
    Vec3::new(r * phi.cos(), r * phi.sin(), (1.0 - u1).max(0.0).sqrt())
}

pub fn sample_disk(u1: f32, u2: f32) -> Vec2 {
    let r = u1.sqrt();
    let theta = 2.0 * PI * u2;
    Vec2::new(r * theta.cos(), r * theta.sin())
}

pub fn build_basis(n: Vec3) -> (Vec3, Vec3, Vec3) {
    let up = if n.y.abs() < 0.999 { Vec3::Y } else { Vec3::X };
    let t = up.cross(n).normalize();
    let b = n.cross(t);
    (t, b, n)
}

pub fn to_world(local: Vec3, t: Vec3, b: Vec3, n: Vec3) -> Vec3 {
    t * local.x + b * local.y + n * local.z
}

/// Xorshift generator seeded per pixel and sample, so a sample renders the
/// same no matter which thread or device produces it.
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.wrapping_add(0x9E3779B97F4A7C15),
        }
    }

    pub fn for_sample(pixel: UVec2, sample_index: u32) -> Self {
        let seed = ((pixel.y as u64) << 48) ^ ((pixel.x as u64) << 24) ^ sample_index as u64;
        let mut rng = Self::new(seed.wrapping_mul(0xD1B54A32D192ED03));
        // Decorrelate neighbouring seeds.
        rng.next();
        rng.next();
        rng
    }

    pub fn next(&mut self) -> f32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        let result = self.state.wrapping_mul(0x2545F4914F6CDD1D);
        (result >> 40) as f32 / (1u64 << 24) as f32
    }

    pub fn next_vec2(&mut self) -> Vec2 {
        Vec2::new(self.next(), self.next())
    }
}
