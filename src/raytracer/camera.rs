use glam::{Mat4, UVec2, Vec2, Vec3, Vec4};

#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Ray { origin, direction }
    }

    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

/// Pinhole camera. Renderers use it to generate primary rays and frame
/// operations may read it to reproject depth.
#[derive(Clone, Debug)]
pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fov: f32,
    pub aspect_ratio: f32,
    inv_vp_matrix: Mat4,
}

impl Camera {
    pub fn new(position: Vec3, look_at: Vec3, fov: f32, aspect_ratio: f32) -> Self {
        let dir = (look_at - position).normalize();
        let mut camera = Camera {
            position,
            yaw: dir.x.atan2(-dir.z),
            pitch: dir.y.asin(),
            fov,
            aspect_ratio,
            inv_vp_matrix: Mat4::IDENTITY,
        };
        camera.update_matrix();
        camera
    }

    /// Camera looking at `look_at` whose aspect ratio matches `image_size`.
    pub fn for_image(position: Vec3, look_at: Vec3, fov: f32, image_size: UVec2) -> Self {
        let aspect = image_size.x as f32 / image_size.y.max(1) as f32;
        Self::new(position, look_at, fov, aspect)
    }

    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.sin() * self.pitch.cos(),
            self.pitch.sin(),
            -self.yaw.cos() * self.pitch.cos(),
        )
    }

    pub fn update_matrix(&mut self) {
        let look_at = self.position + self.forward();
        let vp_matrix = Mat4::perspective_rh(self.fov.to_radians(), self.aspect_ratio, 0.1, 1000.0)
            * Mat4::look_at_rh(self.position, look_at, Vec3::Y);
        self.inv_vp_matrix = vp_matrix.inverse();
    }

    /// Ray through normalised image coordinates, `(0, 0)` being the top-left
    /// corner.
    pub fn generate_ray(&self, u: f32, v: f32) -> Ray {
        let ndc_x = 2.0 * u - 1.0;
        let ndc_y = 1.0 - 2.0 * v;
        let near = self.inv_vp_matrix * Vec4::new(ndc_x, ndc_y, -1.0, 1.0);
        let far = self.inv_vp_matrix * Vec4::new(ndc_x, ndc_y, 1.0, 1.0);
        let near = near.truncate() / near.w;
        let far = far.truncate() / far.w;
        Ray::new(self.position, (far - near).normalize())
    }

    /// Ray through a pixel, offset inside it by `jitter` in `[0, 1)^2`.
    pub fn pixel_ray(&self, pixel: UVec2, image_size: UVec2, jitter: Vec2) -> Ray {
        let uv = (pixel.as_vec2() + jitter) / image_size.as_vec2();
        self.generate_ray(uv.x, uv.y)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Camera::new(Vec3::new(0.0, 1.0, 4.0), Vec3::new(0.0, 0.5, 0.0), 45.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_ray_points_forward() {
        let camera = Camera::new(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 60.0, 1.0);
        let ray = camera.generate_ray(0.5, 0.5);
        assert!((ray.direction - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-4);
    }

    #[test]
    fn test_top_left_pixel_points_up_left() {
        let camera = Camera::new(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 60.0, 1.0);
        let ray = camera.pixel_ray(UVec2::ZERO, UVec2::new(8, 8), Vec2::splat(0.5));
        assert!(ray.direction.x < 0.0);
        assert!(ray.direction.y > 0.0);
    }
}
