//! Messages flowing between the pipeline stages.

use serde::{Deserialize, Serialize};

use crate::core::types::{PointCloud, SegInfo};

/// Output of the projector for one sweep, consumed by the associator.
#[derive(Debug, Clone, Default)]
pub struct ProjectionOut {
    /// Segmented cloud: accepted cluster points plus down-sampled ground.
    pub segmented_cloud: PointCloud,
    /// Rejected-cluster points forwarded unchanged to the mapper.
    pub outlier_cloud: PointCloud,
    /// Side information parallel to `segmented_cloud`.
    pub seg_info: SegInfo,
    /// Acquisition time of the sweep, seconds.
    pub stamp: f64,
}

/// Ego-motion estimate for one sweep in the camera-init frame.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OdometryMessage {
    /// Sweep acquisition time, seconds.
    pub stamp: f64,
    /// Orientation quaternion `(x, y, z, w)`.
    pub orientation: [f32; 4],
    /// Position `(x, y, z)`, meters.
    pub position: [f32; 3],
}

/// Down-rated output of the associator, consumed by the mapping back-end.
#[derive(Debug, Clone, Default)]
pub struct AssociationOut {
    /// Last sweep's less-sharp features in the sweep-end frame.
    pub cloud_corner_last: PointCloud,
    /// Last sweep's less-flat features in the sweep-end frame.
    pub cloud_surf_last: PointCloud,
    /// Outlier cloud of the last sweep, axis-swapped.
    pub cloud_outlier_last: PointCloud,
    /// Odometry of the last sweep.
    pub laser_odometry: OdometryMessage,
}
