//! View frustum for sphere proximity queries

use crate::core::types::{Mat4, Vec3, Vec4};

/// A plane defined by normal and distance from origin
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    /// Signed distance from point to plane (positive = in front)
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// View frustum with 6 planes (Near, Far, Left, Right, Top, Bottom)
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract frustum planes from view-projection matrix
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let m = vp.to_cols_array_2d();

        // Extract and normalize planes
        // Left: row3 + row0
        let left = Self::normalize_plane(Vec4::new(
            m[0][3] + m[0][0],
            m[1][3] + m[1][0],
            m[2][3] + m[2][0],
            m[3][3] + m[3][0],
        ));

        // Right: row3 - row0
        let right = Self::normalize_plane(Vec4::new(
            m[0][3] - m[0][0],
            m[1][3] - m[1][0],
            m[2][3] - m[2][0],
            m[3][3] - m[3][0],
        ));

        // Bottom: row3 + row1
        let bottom = Self::normalize_plane(Vec4::new(
            m[0][3] + m[0][1],
            m[1][3] + m[1][1],
            m[2][3] + m[2][1],
            m[3][3] + m[3][1],
        ));

        // Top: row3 - row1
        let top = Self::normalize_plane(Vec4::new(
            m[0][3] - m[0][1],
            m[1][3] - m[1][1],
            m[2][3] - m[2][1],
            m[3][3] - m[3][1],
        ));

        // Near: row3 + row2
        let near = Self::normalize_plane(Vec4::new(
            m[0][3] + m[0][2],
            m[1][3] + m[1][2],
            m[2][3] + m[2][2],
            m[3][3] + m[3][2],
        ));

        // Far: row3 - row2
        let far = Self::normalize_plane(Vec4::new(
            m[0][3] - m[0][2],
            m[1][3] - m[1][2],
            m[2][3] - m[2][2],
            m[3][3] - m[3][2],
        ));

        Self {
            planes: [near, far, left, right, top, bottom],
        }
    }

    fn normalize_plane(plane: Vec4) -> Plane {
        let normal = Vec3::new(plane.x, plane.y, plane.z);
        let len = normal.length();
        Plane {
            normal: normal / len,
            distance: plane.w / len,
        }
    }

    /// Signed distance from a sphere center to the nearest frustum plane.
    ///
    /// Negative values mean the center is behind at least one plane; values
    /// below `-radius` mean the whole sphere lies outside the frustum.
    pub fn sphere_distance(&self, center: Vec3) -> f32 {
        let mut min_distance = f32::MAX;
        for plane in &self.planes {
            let d = plane.distance_to_point(center);
            if d < min_distance {
                min_distance = d;
            }
        }
        min_distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frustum() -> Frustum {
        let proj = Mat4::perspective_rh(60.0_f32.to_radians(), 1.0, 0.1, 1000.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        Frustum::from_view_projection(&(proj * view))
    }

    #[test]
    fn test_plane_distance() {
        let plane = Plane::new(Vec3::Y, 0.0); // XZ plane
        assert_eq!(plane.distance_to_point(Vec3::new(0.0, 5.0, 0.0)), 5.0);
        assert_eq!(plane.distance_to_point(Vec3::new(0.0, -3.0, 0.0)), -3.0);
    }

    #[test]
    fn test_sphere_distance_sign() {
        let frustum = test_frustum();

        // Center well inside the frustum
        assert!(frustum.sphere_distance(Vec3::ZERO) > 0.0);

        // Center behind the camera
        let behind = frustum.sphere_distance(Vec3::new(0.0, 0.0, 100.0));
        assert!(behind < 0.0);
    }

    #[test]
    fn test_sphere_distance_grades_boundary_overlap() {
        let frustum = test_frustum();

        // Center just behind the near plane: a radius-5 sphere reaches in
        let d = frustum.sphere_distance(Vec3::new(0.0, 0.0, 11.0));
        assert!(d < 0.0 && d > -5.0);

        // Far outside: no plausible radius reaches back in
        assert!(frustum.sphere_distance(Vec3::new(0.0, 0.0, 200.0)) < -100.0);
    }
}
