//! Per-sweep segmentation metadata handed from the projector to the
//! associator.

use serde::{Deserialize, Serialize};

/// Side information describing one segmented sweep.
///
/// The three per-point vectors run parallel to the segmented cloud: entry `i`
/// describes segmented point `i`. Ring index bounds are stored shifted by ±5
/// so the 11-tap smoothness kernel never reads outside a ring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegInfo {
    /// Orientation of the first raw point, `-atan2(y, x)`.
    pub start_orientation: f32,
    /// Orientation of the last raw point, continuous past the start so that
    /// `end - start` lies in (π, 3π].
    pub end_orientation: f32,
    /// `end_orientation - start_orientation`.
    pub orientation_diff: f32,
    /// First usable segmented-cloud index per ring (inclusive, +5 margin).
    pub start_ring_index: Vec<i32>,
    /// Last usable segmented-cloud index per ring (inclusive, -5 margin).
    pub end_ring_index: Vec<i32>,
    /// True where the segmented point was classified as ground.
    pub ground_flag: Vec<bool>,
    /// Range-image column of each segmented point.
    pub col_ind: Vec<i32>,
    /// Radial range of each segmented point.
    pub range: Vec<f32>,
}

impl SegInfo {
    /// Allocate for a sweep geometry, pre-reserving the per-point vectors.
    pub fn with_geometry(rings: usize, capacity: usize) -> Self {
        Self {
            start_orientation: 0.0,
            end_orientation: 0.0,
            orientation_diff: 0.0,
            start_ring_index: vec![0; rings],
            end_ring_index: vec![0; rings],
            ground_flag: Vec::with_capacity(capacity),
            col_ind: Vec::with_capacity(capacity),
            range: Vec::with_capacity(capacity),
        }
    }

    /// Reset per-sweep state, keeping allocations.
    pub fn reset(&mut self, rings: usize) {
        self.start_orientation = 0.0;
        self.end_orientation = 0.0;
        self.orientation_diff = 0.0;
        self.start_ring_index.clear();
        self.start_ring_index.resize(rings, 0);
        self.end_ring_index.clear();
        self.end_ring_index.resize(rings, 0);
        self.ground_flag.clear();
        self.col_ind.clear();
        self.range.clear();
    }

    /// Record one segmented point's side information.
    #[inline]
    pub fn push_point(&mut self, ground: bool, col: i32, range: f32) {
        self.ground_flag.push(ground);
        self.col_ind.push(col);
        self.range.push(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_vectors_stay_in_sync() {
        let mut info = SegInfo::with_geometry(16, 32);
        info.push_point(true, 10, 1.5);
        info.push_point(false, 11, 2.5);
        assert_eq!(info.ground_flag.len(), 2);
        assert_eq!(info.col_ind.len(), 2);
        assert_eq!(info.range.len(), 2);
        assert!(info.ground_flag[0]);
        assert_eq!(info.col_ind[1], 11);
    }

    #[test]
    fn reset_keeps_ring_count() {
        let mut info = SegInfo::with_geometry(8, 4);
        info.push_point(false, 0, 1.0);
        info.start_ring_index[3] = 42;
        info.reset(8);
        assert_eq!(info.start_ring_index.len(), 8);
        assert_eq!(info.start_ring_index[3], 0);
        assert!(info.range.is_empty());
    }
}
