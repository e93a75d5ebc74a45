//! View-dependent screen-space error metric

use crate::core::camera::Camera;
use crate::core::types::Vec3;
use crate::graph::NodeRecord;
use crate::math::Frustum;

/// Deprioritizes nodes outside the view frustum without excluding them.
/// The error is never zeroed: a hidden ancestor must stay expandable enough
/// for traversal to reach visible descendants through it.
pub const OUTER_NODE_FACTOR: f32 = 100.0;

/// Floor on the viewpoint distance, so a camera sitting inside a node's
/// bounding sphere does not blow the error up to infinity.
pub const DISTANCE_EPSILON: f32 = 0.1;

/// Per-frame camera state consumed by the error metric.
///
/// `resolution` is screen-space units per pixel at unit distance, derived
/// from the frustum's horizontal extent and the viewport width.
#[derive(Clone, Copy, Debug)]
pub struct CameraView {
    pub viewpoint: Vec3,
    pub frustum: Frustum,
    pub resolution: f32,
}

impl CameraView {
    pub fn new(camera: &Camera, viewport_width: u32) -> Self {
        let frustum = Frustum::from_view_projection(&camera.view_projection());
        let half_extent = (camera.fov_x() * 0.5).tan();
        let resolution = 2.0 * half_extent / viewport_width.max(1) as f32;
        Self {
            viewpoint: camera.position,
            frustum,
            resolution,
        }
    }

    /// Screen-space error a node's approximation introduces for this view.
    ///
    /// Pure function of the node record and the captured camera state:
    /// geometric error projected by viewpoint distance, then penalized by
    /// how far the bounding sphere sits outside the view frustum.
    pub fn compute_error(&self, node: &NodeRecord) -> f32 {
        let center = node.center();
        let radius = node.radius();

        let distance = (self.viewpoint - center).length();
        let effective = (distance - radius).max(DISTANCE_EPSILON);
        let mut error = node.error / (self.resolution * effective);

        // Frustum-proximity penalty, probing with the tight radius
        let probe = node.tight_radius;
        let frustum_distance = self.frustum.sphere_distance(center);
        if frustum_distance < -probe {
            error /= OUTER_NODE_FACTOR + 1.0;
        } else if frustum_distance < 0.0 {
            // Straddling the boundary: scale by the fraction outside
            error /= 1.0 - (frustum_distance / probe) * OUTER_NODE_FACTOR;
        }

        error
    }
}
