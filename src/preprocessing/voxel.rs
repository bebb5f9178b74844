//! Voxel-grid down-sampling for feature clouds.

use std::collections::BTreeMap;

use crate::core::types::{Point, PointCloud};

/// 3-D grid filter replacing each occupied voxel by the centroid of its
/// points.
///
/// Output order follows the lexicographic order of voxel coordinates, so the
/// filter is deterministic for identical inputs.
#[derive(Debug, Clone)]
pub struct VoxelGridFilter {
    leaf_size: f32,
    cells: BTreeMap<(i64, i64, i64), Accumulator>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    x: f64,
    y: f64,
    z: f64,
    intensity: f64,
    count: u32,
}

impl VoxelGridFilter {
    /// Create a filter with the given cubic leaf size in meters.
    pub fn new(leaf_size: f32) -> Self {
        Self {
            leaf_size,
            cells: BTreeMap::new(),
        }
    }

    /// Leaf size in meters.
    #[inline]
    pub fn leaf_size(&self) -> f32 {
        self.leaf_size
    }

    /// Down-sample `input` into `output`. `output` is cleared first.
    pub fn filter(&mut self, input: &PointCloud, output: &mut PointCloud) {
        output.clear();
        self.cells.clear();

        if self.leaf_size <= 0.0 {
            output.points.extend_from_slice(&input.points);
            return;
        }

        let inv_leaf = 1.0 / self.leaf_size;
        for p in input.iter() {
            if !p.is_finite() {
                continue;
            }
            let key = (
                (p.x * inv_leaf).floor() as i64,
                (p.y * inv_leaf).floor() as i64,
                (p.z * inv_leaf).floor() as i64,
            );
            let cell = self.cells.entry(key).or_default();
            cell.x += p.x as f64;
            cell.y += p.y as f64;
            cell.z += p.z as f64;
            cell.intensity += p.intensity as f64;
            cell.count += 1;
        }

        for cell in self.cells.values() {
            let inv = 1.0 / cell.count as f64;
            output.push(Point::new(
                (cell.x * inv) as f32,
                (cell.y * inv) as f32,
                (cell.z * inv) as f32,
                (cell.intensity * inv) as f32,
            ));
        }
    }
}
