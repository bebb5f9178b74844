//! Smoothness scoring and feature selection.
//!
//! Each ring is split into six equal sectors. Within a sector, the roughest
//! non-ground points become edge features and the smoothest ground points
//! become planar features, under fixed per-sector quotas. Everything not
//! picked as a corner feeds the voxel-down-sampled less-flat set.

use super::FeatureAssociation;

/// Maximum sharp corners per sector.
const SHARP_PER_SECTOR: usize = 2;
/// Maximum less-sharp corners per sector (includes the sharp ones).
const LESS_SHARP_PER_SECTOR: usize = 20;
/// Maximum flat surface points per sector.
const FLAT_PER_SECTOR: usize = 4;
/// Number of sectors per ring.
const SECTORS: usize = 6;

/// Smoothness score of one segmented point, kept next to its index so
/// sector slices can be sorted without losing identity.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Smoothness {
    pub value: f32,
    pub ind: usize,
}

impl FeatureAssociation {
    /// 11-tap local smoothness: squared difference between a point's range
    /// and the mean of its ten ring neighbors.
    pub(crate) fn calculate_smoothness(&mut self) {
        let cloud_size = self.segmented_cloud.len();
        if cloud_size < 11 {
            return;
        }
        let range = &self.seg_info.range;

        for i in 5..cloud_size - 5 {
            let diff_range = range[i - 5] + range[i - 4] + range[i - 3] + range[i - 2]
                + range[i - 1]
                - range[i] * 10.0
                + range[i + 1]
                + range[i + 2]
                + range[i + 3]
                + range[i + 4]
                + range[i + 5];

            self.curvature[i] = diff_range * diff_range;
            self.neighbor_picked[i] = false;
            self.cloud_label[i] = 0;
            self.smoothness[i].value = self.curvature[i];
            self.smoothness[i].ind = i;
        }
    }

    /// Mask points on the far side of occlusion boundaries and points whose
    /// rays graze a surface near-parallel.
    pub(crate) fn mark_occluded_points(&mut self) {
        let cloud_size = self.segmented_cloud.len();
        if cloud_size < 12 {
            return;
        }
        let range = &self.seg_info.range;
        let col = &self.seg_info.col_ind;

        for i in 5..cloud_size - 6 {
            let depth1 = range[i];
            let depth2 = range[i + 1];
            let column_diff = (col[i + 1] - col[i]).abs();

            if column_diff < 10 {
                if depth1 - depth2 > 0.3 {
                    for k in i - 5..=i {
                        self.neighbor_picked[k] = true;
                    }
                } else if depth2 - depth1 > 0.3 {
                    for k in i + 1..=i + 6 {
                        self.neighbor_picked[k] = true;
                    }
                }
            }

            let diff1 = (range[i - 1] - range[i]).abs();
            let diff2 = (range[i + 1] - range[i]).abs();
            if diff1 > 0.02 * range[i] && diff2 > 0.02 * range[i] {
                self.neighbor_picked[i] = true;
            }
        }
    }

    /// Select sharp/less-sharp corners and flat/less-flat surface points
    /// under the per-sector quotas.
    pub(crate) fn extract_features(&mut self) {
        self.corner_sharp.clear();
        self.corner_less_sharp.clear();
        self.surf_flat.clear();
        self.surf_less_flat.clear();

        let rings = self.n_scan.min(self.seg_info.start_ring_index.len());
        for i in 0..rings {
            self.less_flat_scan.clear();

            for j in 0..SECTORS as i32 {
                let start = self.seg_info.start_ring_index[i];
                let end = self.seg_info.end_ring_index[i];
                let sp = (start * (6 - j) + end * j) / 6;
                let ep = (start * (5 - j) + end * (j + 1)) / 6 - 1;

                if sp >= ep {
                    continue;
                }
                let (sp, ep) = (sp as usize, ep as usize);

                self.smoothness[sp..ep].sort_by(|a, b| {
                    a.value
                        .partial_cmp(&b.value)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });

                self.pick_corners(sp, ep);
                self.pick_flats(sp, ep);

                for k in sp..=ep {
                    if self.cloud_label[k] <= 0 {
                        self.less_flat_scan.push(self.segmented_cloud.points[k]);
                    }
                }
            }

            self.downsize_filter
                .filter(&self.less_flat_scan, &mut self.less_flat_scan_ds);
            self.surf_less_flat
                .points
                .extend_from_slice(&self.less_flat_scan_ds.points);
        }
    }

    /// Walk the sector from roughest to smoothest, picking edge features.
    fn pick_corners(&mut self, sp: usize, ep: usize) {
        let mut picked = 0usize;
        for k in (sp..=ep).rev() {
            let ind = self.smoothness[k].ind;
            if self.neighbor_picked[ind]
                || self.curvature[ind] <= self.config.edge_threshold
                || self.seg_info.ground_flag[ind]
            {
                continue;
            }

            picked += 1;
            if picked <= SHARP_PER_SECTOR {
                self.cloud_label[ind] = 2;
                self.corner_sharp.push(self.segmented_cloud.points[ind]);
                self.corner_less_sharp.push(self.segmented_cloud.points[ind]);
            } else if picked <= LESS_SHARP_PER_SECTOR {
                self.cloud_label[ind] = 1;
                self.corner_less_sharp.push(self.segmented_cloud.points[ind]);
            } else {
                break;
            }

            self.neighbor_picked[ind] = true;
            self.suppress_neighbors(ind);
        }
    }

    /// Walk the sector from smoothest to roughest, picking planar features.
    fn pick_flats(&mut self, sp: usize, ep: usize) {
        let mut picked = 0usize;
        for k in sp..=ep {
            let ind = self.smoothness[k].ind;
            if self.neighbor_picked[ind]
                || self.curvature[ind] >= self.config.surf_threshold
                || !self.seg_info.ground_flag[ind]
            {
                continue;
            }

            self.cloud_label[ind] = -1;
            self.surf_flat.push(self.segmented_cloud.points[ind]);

            picked += 1;
            if picked >= FLAT_PER_SECTOR {
                break;
            }

            self.neighbor_picked[ind] = true;
            self.suppress_neighbors(ind);
        }
    }

    /// Mask up to five neighbors on each side of a picked feature, stopping
    /// at the first azimuth gap wider than ten columns.
    pub(crate) fn suppress_neighbors(&mut self, ind: usize) {
        let n = self.seg_info.col_ind.len();
        for l in 1..=5usize {
            if ind + l >= n {
                continue;
            }
            let column_diff =
                (self.seg_info.col_ind[ind + l] - self.seg_info.col_ind[ind + l - 1]).abs();
            if column_diff > 10 {
                break;
            }
            self.neighbor_picked[ind + l] = true;
        }
        for l in 1..=5usize {
            if l > ind {
                continue;
            }
            let column_diff =
                (self.seg_info.col_ind[ind - l] - self.seg_info.col_ind[ind - l + 1]).abs();
            if column_diff > 10 {
                break;
            }
            self.neighbor_picked[ind - l] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crossbeam_channel::unbounded;

    use crate::association::FeatureAssociation;
    use crate::config::AssociationConfig;
    use crate::core::types::Point;
    use crate::imu::ImuRing;

    /// Associator pre-loaded with a single-ring range profile.
    fn assoc_with_profile(ranges: &[f32]) -> FeatureAssociation {
        let (_input_tx, input_rx) = unbounded();
        let (output_tx, _output_rx) = unbounded();
        let (odom_tx, _odom_rx) = unbounded();
        let ring = Arc::new(Mutex::new(ImuRing::new(0.1)));
        let mut assoc = FeatureAssociation::new(
            16,
            AssociationConfig::default(),
            ring,
            input_rx,
            output_tx,
            odom_tx,
        );

        for (i, &r) in ranges.iter().enumerate() {
            assoc.segmented_cloud.push(Point::new(r, 0.0, 0.0, 0.0));
            assoc.seg_info.push_point(false, i as i32, r);
        }
        assoc.reset_feature_buffers();
        assoc
    }

    #[test]
    fn smoothness_peaks_at_range_spike() {
        let mut ranges = vec![1.0f32; 31];
        ranges[15] = 5.0;
        let mut assoc = assoc_with_profile(&ranges);

        assoc.calculate_smoothness();

        // The spike dominates; windows that contain it score lower, windows
        // that miss it score zero.
        assert!(assoc.curvature[15] > assoc.curvature[12]);
        assert!(assoc.curvature[12] > 0.0);
        assert_eq!(assoc.curvature[6], 0.0);
    }

    #[test]
    fn occlusion_masks_far_side_of_depth_jump() {
        let mut ranges = vec![1.0f32; 24];
        for r in ranges.iter_mut().skip(10) {
            *r = 2.0;
        }
        let mut assoc = assoc_with_profile(&ranges);

        assoc.calculate_smoothness();
        assoc.mark_occluded_points();

        // The jump sits between indices 9 and 10; the farther side is
        // masked six cells deep.
        for k in 10..=15 {
            assert!(assoc.neighbor_picked[k], "index {k} should be masked");
        }
        assert!(!assoc.neighbor_picked[5]);
    }

    #[test]
    fn neighbor_suppression_stops_at_column_gap() {
        let ranges = vec![1.0f32; 20];
        let mut assoc = assoc_with_profile(&ranges);
        // Introduce an azimuth gap right after index 12.
        for k in 13..20 {
            assoc.seg_info.col_ind[k] += 100;
        }

        assoc.suppress_neighbors(10);

        assert!(assoc.neighbor_picked[11]);
        assert!(assoc.neighbor_picked[12]);
        assert!(!assoc.neighbor_picked[13], "gap should stop suppression");
        assert!(assoc.neighbor_picked[9]);
        assert!(assoc.neighbor_picked[8]);
    }
}
