//! Range-image projection and segmentation.
//!
//! Converts an unordered sweep into a dense `rings x columns` range image,
//! classifies ground cells, clusters the remainder with a breadth-first
//! angular-coherence search and emits the segmented cloud plus side
//! information consumed by the feature associator.

use std::collections::VecDeque;
use std::f32::consts::PI;

use log::debug;

use crate::config::ProjectionConfig;
use crate::core::math::DEG_TO_RAD;
use crate::core::types::{
    Point, PointCloud, RangeImage, SegInfo, GROUND, GROUND_UNKNOWN, LABEL_MASKED, LABEL_REJECTED,
};
use crate::pipeline::ProjectionOut;

/// Clusters at least this large are accepted regardless of ring coverage.
const SEGMENT_ACCEPT_POINT_NUM: usize = 30;

/// Returns closer than this are sensor artifacts and dropped.
const MIN_RANGE: f32 = 0.1;

/// Ground tilt tolerance relative to the sensor mount angle.
const GROUND_ANGLE_TOLERANCE: f32 = 10.0 * DEG_TO_RAD;

/// Sentinel intensity marking an unpopulated full-cloud cell.
const UNPOPULATED: f32 = -1.0;

/// One-sweep range-image projector.
///
/// All buffers are allocated once and reused across sweeps.
pub struct RangeImageProjector {
    config: ProjectionConfig,
    /// Dense cloud indexed `col + row * horizontal_scan`.
    full_cloud: Vec<Point>,
    image: RangeImage,
    label_count: i32,
    filtered: Vec<Point>,
    bfs_queue: VecDeque<(usize, usize)>,
    component: Vec<(usize, usize)>,
    line_count_flag: Vec<bool>,
}

impl RangeImageProjector {
    /// Create a projector for the given sweep geometry.
    pub fn new(config: ProjectionConfig) -> Self {
        let cloud_size = config.cloud_size();
        let n_scan = config.n_scan;
        let horizontal_scan = config.horizontal_scan;
        Self {
            config,
            full_cloud: vec![unpopulated_point(); cloud_size],
            image: RangeImage::new(n_scan, horizontal_scan),
            label_count: 1,
            filtered: Vec::with_capacity(cloud_size),
            bfs_queue: VecDeque::with_capacity(cloud_size),
            component: Vec::with_capacity(cloud_size),
            line_count_flag: vec![false; n_scan],
        }
    }

    /// Projector geometry.
    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    /// Project and segment one raw sweep.
    ///
    /// Non-finite points are dropped up front; a sweep with no usable points
    /// yields an empty `ProjectionOut` which the associator treats as
    /// feature-starved.
    pub fn process(&mut self, cloud: &[Point], stamp: f64) -> ProjectionOut {
        self.reset();

        self.filtered.extend(cloud.iter().filter(|p| p.is_finite()));

        let mut out = ProjectionOut {
            segmented_cloud: PointCloud::new(),
            outlier_cloud: PointCloud::new(),
            seg_info: SegInfo::with_geometry(self.config.n_scan, self.config.cloud_size()),
            stamp,
        };

        if self.filtered.is_empty() {
            debug!("dropping sweep at {stamp:.3}: no finite points");
            return out;
        }

        self.find_start_end_orientation(&mut out.seg_info);
        self.project_cloud();
        self.mark_ground();
        self.segment(&mut out);
        out
    }

    fn reset(&mut self) {
        self.image.reset();
        self.full_cloud.fill(unpopulated_point());
        self.label_count = 1;
        self.filtered.clear();
    }

    /// Start/end azimuth of the sweep from its first and last raw returns,
    /// with the difference normalized into (π, 3π].
    fn find_start_end_orientation(&self, info: &mut SegInfo) {
        let first = self.filtered[0];
        let last = self.filtered[self.filtered.len() - 1];

        info.start_orientation = -first.y.atan2(first.x);
        info.end_orientation = -last.y.atan2(last.x) + 2.0 * PI;

        if info.end_orientation - info.start_orientation > 3.0 * PI {
            info.end_orientation -= 2.0 * PI;
        } else if info.end_orientation - info.start_orientation < PI {
            info.end_orientation += 2.0 * PI;
        }
        info.orientation_diff = info.end_orientation - info.start_orientation;
    }

    /// Fill the range image and the dense full cloud, encoding
    /// `ring + column / 10000` into each stored point's intensity.
    fn project_cloud(&mut self) {
        let n_scan = self.config.n_scan as i32;
        let horizontal_scan = self.config.horizontal_scan as i32;

        for &p in &self.filtered {
            let range = p.range();

            let vertical_angle = (p.z / range).asin();
            let row = ((vertical_angle + self.config.ang_bottom) / self.config.ang_res_y) as i32;
            if row < 0 || row >= n_scan {
                continue;
            }

            let horizon_angle = p.x.atan2(p.y);
            let mut col = -((horizon_angle - PI / 2.0) / self.config.ang_res_x).round() as i32
                + horizontal_scan / 2;
            if col >= horizontal_scan {
                col -= horizontal_scan;
            }
            if col < 0 || col >= horizontal_scan {
                continue;
            }

            if range < MIN_RANGE {
                continue;
            }

            self.image.set_range(row as usize, col as usize, range);

            let index = (col + row * horizontal_scan) as usize;
            self.full_cloud[index] = Point::new(p.x, p.y, p.z, row as f32 + col as f32 / 10_000.0);
        }
    }

    /// Classify ground from vertical neighbor pairs in the low rings, then
    /// mask ground and empty cells out of the segmentation.
    fn mark_ground(&mut self) {
        let horizontal_scan = self.config.horizontal_scan;

        for j in 0..horizontal_scan {
            for i in 0..self.config.ground_scan_ind {
                let lower = j + i * horizontal_scan;
                let upper = j + (i + 1) * horizontal_scan;

                if self.full_cloud[lower].intensity == UNPOPULATED
                    || self.full_cloud[upper].intensity == UNPOPULATED
                {
                    self.image.set_ground(i, j, GROUND_UNKNOWN);
                    continue;
                }

                let dx = self.full_cloud[upper].x - self.full_cloud[lower].x;
                let dy = self.full_cloud[upper].y - self.full_cloud[lower].y;
                let dz = self.full_cloud[upper].z - self.full_cloud[lower].z;

                let tilt = dz.atan2((dx * dx + dy * dy + dz * dz).sqrt());
                if tilt - self.config.sensor_mount_angle <= GROUND_ANGLE_TOLERANCE {
                    self.image.set_ground(i, j, GROUND);
                    self.image.set_ground(i + 1, j, GROUND);
                }
            }
        }

        for i in 0..self.config.n_scan {
            for j in 0..horizontal_scan {
                if self.image.ground_at(i, j) == GROUND || !self.image.has_return(i, j) {
                    self.image.set_label(i, j, LABEL_MASKED);
                }
            }
        }
    }

    /// Label connected components, then linearize accepted clusters and
    /// down-sampled ground into the segmented cloud.
    fn segment(&mut self, out: &mut ProjectionOut) {
        let n_scan = self.config.n_scan;
        let horizontal_scan = self.config.horizontal_scan;

        for i in 0..n_scan {
            for j in 0..horizontal_scan {
                if self.image.label_at(i, j) == 0 {
                    self.label_component(i, j);
                }
            }
        }

        let info = &mut out.seg_info;
        let mut size = 0i32;
        for i in 0..n_scan {
            info.start_ring_index[i] = size - 1 + 5;

            for j in 0..horizontal_scan {
                let label = self.image.label_at(i, j);
                let is_ground = self.image.ground_at(i, j) == GROUND;
                if label > 0 || is_ground {
                    // Rejected clusters only survive as sparse outliers above
                    // the ground rings.
                    if label == LABEL_REJECTED {
                        if i > self.config.ground_scan_ind && j % 5 == 0 {
                            out.outlier_cloud
                                .push(self.full_cloud[j + i * horizontal_scan]);
                        }
                        continue;
                    }
                    // Most ground points are skipped; keep every fifth column
                    // plus the ring borders.
                    if is_ground && (j % 5 != 0 && j > 5 && j < horizontal_scan - 5) {
                        continue;
                    }

                    info.push_point(is_ground, j as i32, self.image.range_at(i, j));
                    out.segmented_cloud
                        .push(self.full_cloud[j + i * horizontal_scan]);
                    size += 1;
                }
            }

            info.end_ring_index[i] = size - 1 - 5;
        }

        debug!(
            "segmented {} points, {} outliers, {} clusters",
            out.segmented_cloud.len(),
            out.outlier_cloud.len(),
            self.label_count - 1
        );
    }

    /// Breadth-first flood fill from `(row, col)`, expanding across edges
    /// whose apex angle exceeds the segmentation threshold.
    fn label_component(&mut self, row: usize, col: usize) {
        let n_scan = self.config.n_scan as i32;
        let horizontal_scan = self.config.horizontal_scan as i32;
        let theta_threshold = self.config.segment_theta.tan();

        self.line_count_flag.fill(false);
        self.bfs_queue.clear();
        self.component.clear();

        self.bfs_queue.push_back((row, col));
        self.component.push((row, col));

        const NEIGHBORS: [(i32, i32); 4] = [(0, -1), (-1, 0), (1, 0), (0, 1)];

        while let Some((r, c)) = self.bfs_queue.pop_front() {
            self.image.set_label(r, c, self.label_count);

            for (dr, dc) in NEIGHBORS {
                let nr = r as i32 + dr;
                let mut nc = c as i32 + dc;

                if nr < 0 || nr >= n_scan {
                    continue;
                }
                // Azimuth wraps around the image seam.
                if nc < 0 {
                    nc = horizontal_scan - 1;
                }
                if nc >= horizontal_scan {
                    nc = 0;
                }

                let (nr, nc) = (nr as usize, nc as usize);
                if self.image.label_at(nr, nc) != 0 {
                    continue;
                }

                let d1 = self.image.range_at(r, c).max(self.image.range_at(nr, nc));
                let d2 = self.image.range_at(r, c).min(self.image.range_at(nr, nc));

                let alpha = if dr == 0 {
                    self.config.segment_alpha_x
                } else {
                    self.config.segment_alpha_y
                };
                let tang = d2 * alpha.sin() / (d1 - d2 * alpha.cos());

                if tang > theta_threshold {
                    self.bfs_queue.push_back((nr, nc));
                    self.image.set_label(nr, nc, self.label_count);
                    self.line_count_flag[nr] = true;
                    self.component.push((nr, nc));
                }
            }
        }

        let feasible = if self.component.len() >= SEGMENT_ACCEPT_POINT_NUM {
            true
        } else if self.component.len() >= self.config.segment_valid_point_num {
            let line_count = self.line_count_flag.iter().filter(|&&f| f).count();
            line_count >= self.config.segment_valid_line_num
        } else {
            false
        };

        if feasible {
            self.label_count += 1;
        } else {
            for &(r, c) in &self.component {
                self.image.set_label(r, c, LABEL_REJECTED);
            }
        }
    }
}

fn unpopulated_point() -> Point {
    Point::new(f32::NAN, f32::NAN, f32::NAN, UNPOPULATED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Build the point that projects to `(row, col)` at the given range.
    fn point_at_cell(cfg: &ProjectionConfig, row: usize, col: usize, range: f32) -> Point {
        let vertical = row as f32 * cfg.ang_res_y - cfg.ang_bottom + 1e-4;
        let horizon = PI / 2.0 - (col as i32 - cfg.horizontal_scan as i32 / 2) as f32
            * cfg.ang_res_x;
        Point::new(
            range * vertical.cos() * horizon.sin(),
            range * vertical.cos() * horizon.cos(),
            range * vertical.sin(),
            0.0,
        )
    }

    /// A cylindrical wall covering every ring and column step.
    fn wall_sweep(cfg: &ProjectionConfig, col_step: usize) -> Vec<Point> {
        let mut cloud = Vec::new();
        for col in (0..cfg.horizontal_scan).step_by(col_step) {
            for row in 0..cfg.n_scan {
                cloud.push(point_at_cell(cfg, row, col, 8.0));
            }
        }
        cloud
    }

    fn small_config() -> ProjectionConfig {
        ProjectionConfig::default()
    }

    #[test]
    fn empty_sweep_yields_empty_output() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg);
        let out = projector.process(&[], 1.0);
        assert!(out.segmented_cloud.is_empty());
        assert!(out.outlier_cloud.is_empty());
        assert_relative_eq!(out.seg_info.orientation_diff, 0.0);
    }

    #[test]
    fn all_nan_sweep_yields_empty_output() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg);
        let nan = Point::new(f32::NAN, f32::NAN, f32::NAN, 0.0);
        let out = projector.process(&[nan; 16], 1.0);
        assert!(out.segmented_cloud.is_empty());
    }

    #[test]
    fn orientation_difference_is_wrapped_into_valid_band() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg.clone());
        let cloud = wall_sweep(&cfg, 2);
        let out = projector.process(&cloud, 0.0);
        assert!(out.seg_info.orientation_diff > PI);
        assert!(out.seg_info.orientation_diff <= 3.0 * PI);
    }

    #[test]
    fn segmented_arrays_run_parallel_and_indices_are_safe() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg.clone());
        let cloud = wall_sweep(&cfg, 1);
        let out = projector.process(&cloud, 0.0);

        assert!(!out.segmented_cloud.is_empty());
        assert_eq!(out.segmented_cloud.len(), out.seg_info.ground_flag.len());
        assert_eq!(out.segmented_cloud.len(), out.seg_info.col_ind.len());
        assert_eq!(out.segmented_cloud.len(), out.seg_info.range.len());

        for k in 0..out.segmented_cloud.len() {
            let col = out.seg_info.col_ind[k];
            assert!(col >= 0 && (col as usize) < cfg.horizontal_scan);
            assert!(out.seg_info.range[k] > 0.0);
            let ring = out.segmented_cloud.points[k].ring();
            assert!(ring >= 0 && (ring as usize) < cfg.n_scan);
        }
    }

    #[test]
    fn ring_bounds_hold_for_populated_rings() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg.clone());
        let cloud = wall_sweep(&cfg, 1);
        let out = projector.process(&cloud, 0.0);

        let n = out.segmented_cloud.len() as i32;
        for i in 0..cfg.n_scan {
            let sp = out.seg_info.start_ring_index[i];
            let ep = out.seg_info.end_ring_index[i];
            if sp < ep {
                // Ring 0 starts at -1 + 5; every later populated ring
                // starts at least at 5.
                assert!(sp >= 4);
                if i > 0 {
                    assert!(sp >= 5);
                }
                assert!(ep <= n - 6);
            }
        }
    }

    #[test]
    fn dense_wall_is_accepted_as_one_cluster() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg.clone());
        let cloud = wall_sweep(&cfg, 1);
        let out = projector.process(&cloud, 0.0);

        // A contiguous wall passes the angular-coherence test everywhere, so
        // nothing is routed to the outlier cloud.
        assert!(out.outlier_cloud.is_empty());
        assert!(out.segmented_cloud.len() > 1000);
    }

    #[test]
    fn small_cluster_is_rejected_and_routed_to_outliers() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg.clone());

        // Five isolated points in one ring above the ground rings: too few
        // points across too few rings.
        let ring = cfg.ground_scan_ind + 3;
        let mut cloud = Vec::new();
        for k in 0..5 {
            cloud.push(point_at_cell(&cfg, ring, 400 + k * 5, 4.0));
        }
        let out = projector.process(&cloud, 0.0);

        assert!(out.segmented_cloud.is_empty());
        // Column indices 400..425 step 5 are all multiples of 5, so each
        // rejected point reappears as an outlier.
        assert_eq!(out.outlier_cloud.len(), 5);
    }

    #[test]
    fn ground_points_are_flagged() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg.clone());

        // Flat floor at sensor height -0.5 m sampled densely enough that the
        // vertical neighbor tilt stays below the ground tolerance, plus a
        // wall so segmentation has structure.
        let mut cloud = wall_sweep(&cfg, 1);
        for col in 0..cfg.horizontal_scan {
            for row in 0..cfg.ground_scan_ind + 1 {
                let vertical = row as f32 * cfg.ang_res_y - cfg.ang_bottom;
                if vertical >= -0.01 {
                    continue;
                }
                let range = (-0.5 / vertical.sin()).min(7.0);
                cloud.push(point_at_cell(&cfg, row, col, range));
            }
        }
        let out = projector.process(&cloud, 0.0);

        let ground_count = out.seg_info.ground_flag.iter().filter(|&&g| g).count();
        assert!(ground_count > 0, "expected ground-flagged points");
    }

    #[test]
    fn missing_ring_does_not_break_projection() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg.clone());
        let cloud: Vec<Point> = wall_sweep(&cfg, 1)
            .into_iter()
            .filter(|p| {
                // Recompute the ring the projector will assign and drop 7.
                let range = p.range();
                let v = (p.z / range).asin();
                ((v + cfg.ang_bottom) / cfg.ang_res_y) as i32 != 7
            })
            .collect();
        let out = projector.process(&cloud, 0.0);
        assert!(!out.segmented_cloud.is_empty());
        // Ring 7 contributes nothing.
        for p in out.segmented_cloud.iter() {
            assert_ne!(p.ring(), 7);
        }
    }

    #[test]
    fn close_returns_are_dropped() {
        let cfg = small_config();
        let mut projector = RangeImageProjector::new(cfg.clone());
        let cloud = vec![point_at_cell(&cfg, 8, 900, 0.05)];
        let out = projector.process(&cloud, 0.0);
        assert!(out.segmented_cloud.is_empty());
    }
}
