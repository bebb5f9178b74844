//! Scan-to-scan correspondence search.
//!
//! Sharp points are matched to a line through their two nearest corners of
//! the previous sweep, flat points to a plane through three nearest surface
//! points. The k-d tree returns the closest candidate; the second (and
//! third) are found by scanning the intensity-ordered cloud outward across
//! adjacent rings.

use kiddo::{KdTree, SquaredEuclidean};

use crate::core::types::{Point, PointCloud};

use super::FeatureAssociation;

/// Ring-band half-width of the outward neighbor scan.
const SCAN_BAND: f32 = 2.5;

/// Robust weights at or below this are dropped.
const MIN_ROBUST_WEIGHT: f32 = 0.1;

/// Iterations before the robust weight schedule kicks in.
const ROBUST_WEIGHT_START_ITER: usize = 5;

/// Build a 3-D k-d tree over a feature cloud, keyed by point index.
pub(crate) fn build_kdtree(cloud: &PointCloud) -> KdTree<f32, 3> {
    let mut tree: KdTree<f32, 3> = KdTree::new();
    for (i, p) in cloud.iter().enumerate() {
        tree.add(&[p.x, p.y, p.z], i as u64);
    }
    tree
}

impl FeatureAssociation {
    /// Warp a point back to the sweep-start frame by linearly scaling the
    /// current inter-sweep transform with the point's relative time.
    pub(crate) fn transform_to_start(&self, pi: &Point) -> Point {
        // Relative time is encoded in the fractional intensity; the factor
        // is 1 / scan_period.
        let s = (pi.intensity - pi.intensity.trunc()) / self.config.scan_period;

        let rx = s * self.transform_cur.rx;
        let ry = s * self.transform_cur.ry;
        let rz = s * self.transform_cur.rz;
        let tx = s * self.transform_cur.tx;
        let ty = s * self.transform_cur.ty;
        let tz = s * self.transform_cur.tz;

        let x1 = rz.cos() * (pi.x - tx) + rz.sin() * (pi.y - ty);
        let y1 = -rz.sin() * (pi.x - tx) + rz.cos() * (pi.y - ty);
        let z1 = pi.z - tz;

        let x2 = x1;
        let y2 = rx.cos() * y1 + rx.sin() * z1;
        let z2 = -rx.sin() * y1 + rx.cos() * z1;

        Point::new(
            ry.cos() * x2 - ry.sin() * z2,
            y2,
            ry.sin() * x2 + ry.cos() * z2,
            pi.intensity,
        )
    }

    /// Warp a point to the sweep-end frame: undo the per-point de-skew,
    /// apply the full inter-sweep transform and re-apply the IMU attitude
    /// change across the sweep.
    pub(crate) fn transform_to_end(&self, pi: &Point) -> Point {
        let s = (pi.intensity - pi.intensity.trunc()) / self.config.scan_period;

        let rx = s * self.transform_cur.rx;
        let ry = s * self.transform_cur.ry;
        let rz = s * self.transform_cur.rz;
        let tx = s * self.transform_cur.tx;
        let ty = s * self.transform_cur.ty;
        let tz = s * self.transform_cur.tz;

        let x1 = rz.cos() * (pi.x - tx) + rz.sin() * (pi.y - ty);
        let y1 = -rz.sin() * (pi.x - tx) + rz.cos() * (pi.y - ty);
        let z1 = pi.z - tz;

        let x2 = x1;
        let y2 = rx.cos() * y1 + rx.sin() * z1;
        let z2 = -rx.sin() * y1 + rx.cos() * z1;

        let x3 = ry.cos() * x2 - ry.sin() * z2;
        let y3 = y2;
        let z3 = ry.sin() * x2 + ry.cos() * z2;

        let rx = self.transform_cur.rx;
        let ry = self.transform_cur.ry;
        let rz = self.transform_cur.rz;
        let tx = self.transform_cur.tx;
        let ty = self.transform_cur.ty;
        let tz = self.transform_cur.tz;

        let x4 = ry.cos() * x3 + ry.sin() * z3;
        let y4 = y3;
        let z4 = -ry.sin() * x3 + ry.cos() * z3;

        let x5 = x4;
        let y5 = rx.cos() * y4 - rx.sin() * z4;
        let z5 = rx.sin() * y4 + rx.cos() * z4;

        let x6 = rz.cos() * x5 - rz.sin() * y5 + tx;
        let y6 = rz.sin() * x5 + rz.cos() * y5 + ty;
        let z6 = z5 + tz;

        let imu = &self.sweep_imu;
        let x7 = imu.cos_roll_start * (x6 - imu.shift_from_start.x)
            - imu.sin_roll_start * (y6 - imu.shift_from_start.y);
        let y7 = imu.sin_roll_start * (x6 - imu.shift_from_start.x)
            + imu.cos_roll_start * (y6 - imu.shift_from_start.y);
        let z7 = z6 - imu.shift_from_start.z;

        let x8 = x7;
        let y8 = imu.cos_pitch_start * y7 - imu.sin_pitch_start * z7;
        let z8 = imu.sin_pitch_start * y7 + imu.cos_pitch_start * z7;

        let x9 = imu.cos_yaw_start * x8 + imu.sin_yaw_start * z8;
        let y9 = y8;
        let z9 = -imu.sin_yaw_start * x8 + imu.cos_yaw_start * z8;

        let x10 = imu.yaw_last.cos() * x9 - imu.yaw_last.sin() * z9;
        let y10 = y9;
        let z10 = imu.yaw_last.sin() * x9 + imu.yaw_last.cos() * z9;

        let x11 = x10;
        let y11 = imu.pitch_last.cos() * y10 + imu.pitch_last.sin() * z10;
        let z11 = -imu.pitch_last.sin() * y10 + imu.pitch_last.cos() * z10;

        Point::new(
            imu.roll_last.cos() * x11 + imu.roll_last.sin() * y11,
            -imu.roll_last.sin() * x11 + imu.roll_last.cos() * y11,
            z11,
            pi.intensity.trunc(),
        )
    }

    /// Find point-to-line correspondences for the sharp corners and push
    /// their residual coefficients.
    ///
    /// Neighbor indices are re-searched every fifth iteration and reused in
    /// between to amortize the k-d tree cost.
    pub(crate) fn find_corner_correspondences(&mut self, iter_count: usize) {
        let sharp_num = self.corner_sharp.len();

        for i in 0..sharp_num {
            let point_sel = self.transform_to_start(&self.corner_sharp.points[i]);

            if iter_count % 5 == 0 {
                let (ind1, ind2) = self.search_corner_pair(&point_sel);
                self.search_corner_1[i] = ind1;
                self.search_corner_2[i] = ind2;
            }

            if self.search_corner_2[i] >= 0 {
                let tripod1 = self.corner_last.points[self.search_corner_1[i] as usize];
                let tripod2 = self.corner_last.points[self.search_corner_2[i] as usize];

                let (x0, y0, z0) = (point_sel.x, point_sel.y, point_sel.z);
                let (x1, y1, z1) = (tripod1.x, tripod1.y, tripod1.z);
                let (x2, y2, z2) = (tripod2.x, tripod2.y, tripod2.z);

                // Cross product of the two point-to-vertex edges gives the
                // parallelogram area; dividing by the base length yields the
                // point-to-line distance.
                let m11 = (x0 - x1) * (y0 - y2) - (x0 - x2) * (y0 - y1);
                let m22 = (x0 - x1) * (z0 - z2) - (x0 - x2) * (z0 - z1);
                let m33 = (y0 - y1) * (z0 - z2) - (y0 - y2) * (z0 - z1);

                let a012 = (m11 * m11 + m22 * m22 + m33 * m33).sqrt();
                let l12 =
                    ((x1 - x2).powi(2) + (y1 - y2).powi(2) + (z1 - z2).powi(2)).sqrt();

                let la = ((y1 - y2) * m11 + (z1 - z2) * m22) / a012 / l12;
                let lb = -((x1 - x2) * m11 - (z1 - z2) * m33) / a012 / l12;
                let lc = -((x1 - x2) * m22 + (y1 - y2) * m33) / a012 / l12;
                let ld2 = a012 / l12;

                let s = if iter_count >= ROBUST_WEIGHT_START_ITER {
                    1.0 - 1.8 * ld2.abs()
                } else {
                    1.0
                };

                if s > MIN_ROBUST_WEIGHT && ld2 != 0.0 && ld2.is_finite() {
                    self.cloud_ori.push(self.corner_sharp.points[i]);
                    self.coeff_sel
                        .push(Point::new(s * la, s * lb, s * lc, s * ld2));
                }
            }
        }
    }

    /// Nearest corner via the k-d tree plus the best corner in an adjacent
    /// ring band, scanning the intensity-ordered last-corner cloud outward.
    fn search_corner_pair(&self, point_sel: &Point) -> (i32, i32) {
        let nearest = self
            .kdtree_corner_last
            .nearest_one::<SquaredEuclidean>(&[point_sel.x, point_sel.y, point_sel.z]);

        let closest = nearest.item as usize;
        if nearest.distance >= self.config.nearest_feature_search_sq_dist
            || closest >= self.corner_last.len()
        {
            return (-1, -1);
        }

        let closest_scan = self.corner_last.points[closest].ring();

        let mut min_sq_dis2 = self.config.nearest_feature_search_sq_dist;
        let mut min_ind2 = -1i32;

        for j in closest + 1..self.corner_last.len() {
            let candidate = self.corner_last.points[j];
            if candidate.ring() as f32 > closest_scan as f32 + SCAN_BAND {
                break;
            }
            let sq_dis = sq_dist(&candidate, point_sel);
            if candidate.ring() > closest_scan && sq_dis < min_sq_dis2 {
                min_sq_dis2 = sq_dis;
                min_ind2 = j as i32;
            }
        }
        for j in (0..closest).rev() {
            let candidate = self.corner_last.points[j];
            if (candidate.ring() as f32) < closest_scan as f32 - SCAN_BAND {
                break;
            }
            let sq_dis = sq_dist(&candidate, point_sel);
            if candidate.ring() < closest_scan && sq_dis < min_sq_dis2 {
                min_sq_dis2 = sq_dis;
                min_ind2 = j as i32;
            }
        }

        (closest as i32, min_ind2)
    }

    /// Find point-to-plane correspondences for the flat surface points and
    /// push their residual coefficients.
    pub(crate) fn find_surf_correspondences(&mut self, iter_count: usize) {
        let flat_num = self.surf_flat.len();

        for i in 0..flat_num {
            let point_sel = self.transform_to_start(&self.surf_flat.points[i]);

            if iter_count % 5 == 0 {
                let (ind1, ind2, ind3) = self.search_surf_triple(&point_sel);
                self.search_surf_1[i] = ind1;
                self.search_surf_2[i] = ind2;
                self.search_surf_3[i] = ind3;
            }

            if self.search_surf_2[i] >= 0 && self.search_surf_3[i] >= 0 {
                let tripod1 = self.surf_last.points[self.search_surf_1[i] as usize];
                let tripod2 = self.surf_last.points[self.search_surf_2[i] as usize];
                let tripod3 = self.surf_last.points[self.search_surf_3[i] as usize];

                let mut pa = (tripod2.y - tripod1.y) * (tripod3.z - tripod1.z)
                    - (tripod3.y - tripod1.y) * (tripod2.z - tripod1.z);
                let mut pb = (tripod2.z - tripod1.z) * (tripod3.x - tripod1.x)
                    - (tripod3.z - tripod1.z) * (tripod2.x - tripod1.x);
                let mut pc = (tripod2.x - tripod1.x) * (tripod3.y - tripod1.y)
                    - (tripod3.x - tripod1.x) * (tripod2.y - tripod1.y);
                let mut pd = -(pa * tripod1.x + pb * tripod1.y + pc * tripod1.z);

                let ps = (pa * pa + pb * pb + pc * pc).sqrt();
                pa /= ps;
                pb /= ps;
                pc /= ps;
                pd /= ps;

                let pd2 = pa * point_sel.x + pb * point_sel.y + pc * point_sel.z + pd;

                let s = if iter_count >= ROBUST_WEIGHT_START_ITER {
                    // Denominator is the fourth root of the squared norm;
                    // range() already contributes one square root.
                    1.0 - 1.8 * pd2.abs() / point_sel.range().sqrt()
                } else {
                    1.0
                };

                if s > MIN_ROBUST_WEIGHT && pd2 != 0.0 && pd2.is_finite() {
                    self.cloud_ori.push(self.surf_flat.points[i]);
                    self.coeff_sel
                        .push(Point::new(s * pa, s * pb, s * pc, s * pd2));
                }
            }
        }
    }

    /// Nearest surface point plus the best candidates in the same and in a
    /// different ring band.
    fn search_surf_triple(&self, point_sel: &Point) -> (i32, i32, i32) {
        let nearest = self
            .kdtree_surf_last
            .nearest_one::<SquaredEuclidean>(&[point_sel.x, point_sel.y, point_sel.z]);

        let closest = nearest.item as usize;
        if nearest.distance >= self.config.nearest_feature_search_sq_dist
            || closest >= self.surf_last.len()
        {
            return (-1, -1, -1);
        }

        let closest_scan = self.surf_last.points[closest].ring();

        let mut min_sq_dis2 = self.config.nearest_feature_search_sq_dist;
        let mut min_sq_dis3 = self.config.nearest_feature_search_sq_dist;
        let mut min_ind2 = -1i32;
        let mut min_ind3 = -1i32;

        for j in closest + 1..self.surf_last.len() {
            let candidate = self.surf_last.points[j];
            if candidate.ring() as f32 > closest_scan as f32 + SCAN_BAND {
                break;
            }
            let sq_dis = sq_dist(&candidate, point_sel);
            if candidate.ring() <= closest_scan {
                if sq_dis < min_sq_dis2 {
                    min_sq_dis2 = sq_dis;
                    min_ind2 = j as i32;
                }
            } else if sq_dis < min_sq_dis3 {
                min_sq_dis3 = sq_dis;
                min_ind3 = j as i32;
            }
        }
        for j in (0..closest).rev() {
            let candidate = self.surf_last.points[j];
            if (candidate.ring() as f32) < closest_scan as f32 - SCAN_BAND {
                break;
            }
            let sq_dis = sq_dist(&candidate, point_sel);
            if candidate.ring() >= closest_scan {
                if sq_dis < min_sq_dis2 {
                    min_sq_dis2 = sq_dis;
                    min_ind2 = j as i32;
                }
            } else if sq_dis < min_sq_dis3 {
                min_sq_dis3 = sq_dis;
                min_ind3 = j as i32;
            }
        }

        (closest as i32, min_ind2, min_ind3)
    }
}

#[inline]
fn sq_dist(a: &Point, b: &Point) -> f32 {
    (a.x - b.x).powi(2) + (a.y - b.y).powi(2) + (a.z - b.z).powi(2)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use approx::assert_relative_eq;
    use crossbeam_channel::unbounded;

    use super::build_kdtree;
    use crate::association::FeatureAssociation;
    use crate::config::AssociationConfig;
    use crate::core::types::Point;
    use crate::imu::ImuRing;

    fn bare_association() -> FeatureAssociation {
        let (_input_tx, input_rx) = unbounded();
        let (output_tx, _output_rx) = unbounded();
        let (odom_tx, _odom_rx) = unbounded();
        let ring = Arc::new(Mutex::new(ImuRing::new(0.1)));
        FeatureAssociation::new(
            16,
            AssociationConfig::default(),
            ring,
            input_rx,
            output_tx,
            odom_tx,
        )
    }

    #[test]
    fn plane_robust_weight_uses_fourth_root_of_squared_norm() {
        let mut assoc = bare_association();

        // Three reference surface points spanning the y = 0 plane, two on
        // ring 3 and one on ring 4 so the banded scan finds all tripods.
        assoc.surf_last.push(Point::new(1.0, 0.0, 5.0, 3.0));
        assoc.surf_last.push(Point::new(2.0, 0.0, 5.0, 3.0));
        assoc.surf_last.push(Point::new(1.0, 0.0, 6.0, 4.0));
        assoc.kdtree_surf_last = build_kdtree(&assoc.surf_last);

        // Query point 0.2 m off the plane, stamped at the sweep start so
        // the de-skew warp is the identity.
        let query = Point::new(1.0, 0.2, 5.0, 3.0);
        assoc.surf_flat.push(query);
        assoc.reset_search_caches();

        // Iteration 5 is the first with the robust schedule active.
        assoc.find_surf_correspondences(5);

        assert_eq!(assoc.coeff_sel.len(), 1);
        let coeff = assoc.coeff_sel.points[0];

        // s = 1 - 1.8 * |d| / (x^2 + y^2 + z^2)^(1/4), with d = -0.2 and
        // squared norm 1 + 0.04 + 25.
        let expected_s = 1.0 - 1.8 * 0.2 / 26.04f32.sqrt().sqrt();
        assert_relative_eq!(coeff.intensity, expected_s * -0.2, epsilon = 1e-5);
        assert_relative_eq!(coeff.y, expected_s * -1.0, epsilon = 1e-5);
        assert_relative_eq!(coeff.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(coeff.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn plane_weight_is_unit_before_robust_schedule() {
        let mut assoc = bare_association();

        assoc.surf_last.push(Point::new(1.0, 0.0, 5.0, 3.0));
        assoc.surf_last.push(Point::new(2.0, 0.0, 5.0, 3.0));
        assoc.surf_last.push(Point::new(1.0, 0.0, 6.0, 4.0));
        assoc.kdtree_surf_last = build_kdtree(&assoc.surf_last);

        assoc.surf_flat.push(Point::new(1.0, 0.2, 5.0, 3.0));
        assoc.reset_search_caches();

        assoc.find_surf_correspondences(0);

        assert_eq!(assoc.coeff_sel.len(), 1);
        // Unit weight: the coefficient is the raw signed distance.
        assert_relative_eq!(assoc.coeff_sel.points[0].intensity, -0.2, epsilon = 1e-5);
    }
}
