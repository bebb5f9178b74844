//! Pipeline configuration.
//!
//! Defaults describe a VLP-16 class sensor: 16 rings at 2° vertical
//! resolution starting 15.1° below horizontal, 1800 azimuth columns at 0.2°,
//! spinning at 10 Hz.

use serde::{Deserialize, Serialize};

use crate::core::math::DEG_TO_RAD;

/// Number of slots in the IMU ring buffer.
pub const IMU_QUE_LENGTH: usize = 200;

/// Geometry and segmentation parameters for the range-image projector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Number of vertical rings.
    pub n_scan: usize,
    /// Number of azimuth columns per ring.
    pub horizontal_scan: usize,
    /// Azimuth resolution in radians per column.
    pub ang_res_x: f32,
    /// Vertical resolution in radians per ring.
    pub ang_res_y: f32,
    /// Magnitude of the lowest ring's elevation angle, radians.
    pub ang_bottom: f32,
    /// Highest ring index that can contain ground returns (exclusive bound
    /// of the ground search).
    pub ground_scan_ind: usize,
    /// Sensor mounting tilt relative to the vehicle base, radians.
    pub sensor_mount_angle: f32,
    /// Angular-coherence threshold of the segmentation, radians.
    pub segment_theta: f32,
    /// Angular step between horizontal neighbors, radians.
    pub segment_alpha_x: f32,
    /// Angular step between vertical neighbors, radians.
    pub segment_alpha_y: f32,
    /// Minimum cluster size accepted when it spans enough rings.
    pub segment_valid_point_num: usize,
    /// Minimum distinct rings for a small cluster to be accepted.
    pub segment_valid_line_num: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        let ang_res_x = 0.2 * DEG_TO_RAD;
        let ang_res_y = 2.0 * DEG_TO_RAD;
        Self {
            n_scan: 16,
            horizontal_scan: 1800,
            ang_res_x,
            ang_res_y,
            ang_bottom: 15.1 * DEG_TO_RAD,
            ground_scan_ind: 7,
            sensor_mount_angle: 0.0,
            segment_theta: 60.0 * DEG_TO_RAD,
            segment_alpha_x: ang_res_x,
            segment_alpha_y: ang_res_y,
            segment_valid_point_num: 5,
            segment_valid_line_num: 3,
        }
    }
}

impl ProjectionConfig {
    /// Total number of range-image cells.
    #[inline]
    pub fn cloud_size(&self) -> usize {
        self.n_scan * self.horizontal_scan
    }
}

/// Feature extraction and scan-matching parameters for the associator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationConfig {
    /// Duration of one sweep in seconds.
    pub scan_period: f32,
    /// Smoothness above which a non-ground point can become an edge feature.
    pub edge_threshold: f32,
    /// Smoothness below which a ground point can become a planar feature.
    pub surf_threshold: f32,
    /// Squared distance gate for nearest-neighbor correspondences, m².
    pub nearest_feature_search_sq_dist: f32,
    /// Emit one mapping message every this many sweeps.
    pub mapping_frequency_divider: usize,
    /// Leaf size of the less-flat voxel down-sampling, meters.
    pub voxel_leaf_size: f32,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            scan_period: 0.1,
            edge_threshold: 0.1,
            surf_threshold: 0.1,
            nearest_feature_search_sq_dist: 25.0,
            mapping_frequency_divider: 2,
            voxel_leaf_size: 0.2,
        }
    }
}
