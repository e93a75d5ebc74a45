//! Camera state supplied by the host each frame

use crate::core::types::{Mat4, Quat, Vec3};

/// Camera with position, rotation, and projection parameters
pub struct Camera {
    /// World position
    pub position: Vec3,
    /// Rotation as quaternion
    pub rotation: Quat,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    /// Near clip plane
    pub near: f32,
    /// Far clip plane
    pub far: f32,
}

impl Camera {
    /// Create a new camera
    pub fn new(position: Vec3, fov_y_degrees: f32, aspect: f32) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near: 0.01,
            far: 10000.0,
        }
    }

    /// Create camera looking at a target
    pub fn look_at(position: Vec3, target: Vec3, up: Vec3) -> Self {
        let forward = (target - position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);

        let rotation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));

        Self {
            position,
            rotation,
            fov_y: 60.0_f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.01,
            far: 10000.0,
        }
    }

    /// Get view matrix (world to camera space)
    pub fn view_matrix(&self) -> Mat4 {
        let rotation_matrix = Mat4::from_quat(self.rotation.conjugate());
        let translation_matrix = Mat4::from_translation(-self.position);
        rotation_matrix * translation_matrix
    }

    /// Get projection matrix (camera to clip space)
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    /// Get combined view-projection matrix
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Get forward direction (negative Z in camera space)
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    /// Horizontal field of view in radians, derived from fov_y and aspect
    pub fn fov_x(&self) -> f32 {
        2.0 * ((self.fov_y * 0.5).tan() * self.aspect).atan()
    }

    /// Update aspect ratio (call on viewport resize)
    pub fn set_aspect(&mut self, width: f32, height: f32) {
        self.aspect = width / height;
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 16.0 / 9.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_direction() {
        let camera = Camera::default();

        // Default camera looks down -Z
        let forward = camera.forward();
        assert!((forward.z - (-1.0)).abs() < 0.001);
    }

    #[test]
    fn test_view_matrix_translation() {
        let mut camera = Camera::default();
        camera.position = Vec3::new(10.0, 0.0, 0.0);

        let view = camera.view_matrix();
        // View matrix should translate world origin to (-10, 0, 0) in camera space
        let origin_in_camera = view.transform_point3(Vec3::ZERO);
        assert!((origin_in_camera.x - (-10.0)).abs() < 0.001);
    }

    #[test]
    fn test_fov_x_wider_than_fov_y() {
        let camera = Camera::new(Vec3::ZERO, 60.0, 16.0 / 9.0);
        assert!(camera.fov_x() > camera.fov_y);
    }

    #[test]
    fn test_look_at_faces_target() {
        let camera = Camera::look_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let forward = camera.forward();
        assert!((forward.z - (-1.0)).abs() < 0.001);
    }
}
