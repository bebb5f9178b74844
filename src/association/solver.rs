//! Two-phase least-squares solve of the inter-sweep transform.
//!
//! Each outer cycle runs two alternating linearizations: a surf-only solve
//! for `(rx, rz, ty)` followed by a corner-only solve for `(ry, tx, tz)`.
//! Both accumulate the 3x3 normal equations from closed-form Jacobians,
//! solve by column-pivoted QR and guard poorly observable directions with an
//! eigenvalue projection computed on the first iteration.

use log::debug;
use nalgebra::{Matrix3, SymmetricEigen, Vector3};

use crate::core::math::RAD_TO_DEG;

use super::{FeatureAssociation, CORNER_FLOOR, SURF_FLOOR};

/// Maximum iterations per solve phase.
const MAX_ITERATIONS: usize = 25;

/// Minimum residual count before a solve iteration is attempted.
const MIN_RESIDUALS: usize = 10;

/// Eigenvalues of the normal matrix below this mark a degenerate direction.
const EIGEN_THRESHOLD: f32 = 10.0;

/// Residual scale of the right-hand side.
const RESIDUAL_SCALE: f32 = -0.05;

/// Rotation convergence threshold, degrees.
const DELTA_ROTATION: f32 = 0.1;

/// Translation convergence threshold, centimeters.
const DELTA_TRANSLATION: f32 = 0.1;

impl FeatureAssociation {
    /// Run both solve phases against the cached last-sweep features.
    ///
    /// Skipped entirely when the reference clouds are below the feature
    /// floors; the previous transform is then reused unchanged.
    pub(crate) fn update_transformation(&mut self) {
        if self.corner_last.len() <= CORNER_FLOOR || self.surf_last.len() <= SURF_FLOOR {
            debug!(
                "skipping solve: {} corners, {} surfs",
                self.corner_last.len(),
                self.surf_last.len()
            );
            return;
        }

        self.reset_search_caches();

        for iter_count in 0..MAX_ITERATIONS {
            self.cloud_ori.clear();
            self.coeff_sel.clear();

            self.find_surf_correspondences(iter_count);
            if self.cloud_ori.len() < MIN_RESIDUALS {
                continue;
            }
            if !self.solve_surf(iter_count) {
                break;
            }
        }

        for iter_count in 0..MAX_ITERATIONS {
            self.cloud_ori.clear();
            self.coeff_sel.clear();

            self.find_corner_correspondences(iter_count);
            if self.cloud_ori.len() < MIN_RESIDUALS {
                continue;
            }
            if !self.solve_corner(iter_count) {
                break;
            }
        }
    }

    /// One Gauss-Newton step of the surf phase, updating pitch, yaw and
    /// vertical translation. Returns false once converged.
    fn solve_surf(&mut self, iter_count: usize) -> bool {
        let (srx, crx) = self.transform_cur.rx.sin_cos();
        let (sry, cry) = self.transform_cur.ry.sin_cos();
        let (srz, crz) = self.transform_cur.rz.sin_cos();
        let tx = self.transform_cur.tx;
        let ty = self.transform_cur.ty;
        let tz = self.transform_cur.tz;

        let a1 = crx * sry * srz;
        let a2 = crx * crz * sry;
        let a3 = srx * sry;
        let a4 = tx * a1 - ty * a2 - tz * a3;
        let a5 = srx * srz;
        let a6 = crz * srx;
        let a7 = ty * a6 - tz * crx - tx * a5;
        let a8 = crx * cry * srz;
        let a9 = crx * cry * crz;
        let a10 = cry * srx;
        let a11 = tz * a10 + ty * a9 - tx * a8;

        let b1 = -crz * sry - cry * srx * srz;
        let b2 = cry * crz * srx - sry * srz;
        let b5 = cry * crz - srx * sry * srz;
        let b6 = cry * srz + crz * srx * sry;

        let c1 = -b6;
        let c2 = b5;
        let c3 = tx * b6 - ty * b5;
        let c4 = -crx * crz;
        let c5 = crx * srz;
        let c6 = ty * c5 + tx * -c4;
        let c7 = b2;
        let c8 = -b1;
        let c9 = tx * -b2 - ty * -b1;

        let mut at_a = Matrix3::zeros();
        let mut at_b = Vector3::zeros();

        for i in 0..self.cloud_ori.len() {
            let p = self.cloud_ori.points[i];
            let coeff = self.coeff_sel.points[i];

            let arx = (-a1 * p.x + a2 * p.y + a3 * p.z + a4) * coeff.x
                + (a5 * p.x - a6 * p.y + crx * p.z + a7) * coeff.y
                + (a8 * p.x - a9 * p.y - a10 * p.z + a11) * coeff.z;

            let arz = (c1 * p.x + c2 * p.y + c3) * coeff.x
                + (c4 * p.x - c5 * p.y + c6) * coeff.y
                + (c7 * p.x + c8 * p.y + c9) * coeff.z;

            let aty = -b6 * coeff.x + c4 * coeff.y + b2 * coeff.z;

            accumulate_normal_equations(
                &mut at_a,
                &mut at_b,
                [arx, arz, aty],
                RESIDUAL_SCALE * coeff.intensity,
            );
        }

        let mut x = solve_qr(&at_a, &at_b);

        if iter_count == 0 {
            self.compute_degeneracy_projection(&at_a);
        }
        if self.is_degenerate {
            x = self.degeneracy_proj * x;
        }

        self.transform_cur.rx += x[0];
        self.transform_cur.rz += x[1];
        self.transform_cur.ty += x[2];
        self.transform_cur.fix_nan();

        let delta_r =
            ((RAD_TO_DEG * x[0]).powi(2) + (RAD_TO_DEG * x[1]).powi(2)).sqrt();
        let delta_t = (x[2] * 100.0).abs();

        delta_r >= DELTA_ROTATION || delta_t >= DELTA_TRANSLATION
    }

    /// One Gauss-Newton step of the corner phase, updating roll and the
    /// horizontal translations. Returns false once converged.
    fn solve_corner(&mut self, iter_count: usize) -> bool {
        let (srx, crx) = self.transform_cur.rx.sin_cos();
        let (sry, cry) = self.transform_cur.ry.sin_cos();
        let (srz, crz) = self.transform_cur.rz.sin_cos();
        let tx = self.transform_cur.tx;
        let ty = self.transform_cur.ty;
        let tz = self.transform_cur.tz;

        let b1 = -crz * sry - cry * srx * srz;
        let b2 = cry * crz * srx - sry * srz;
        let b3 = crx * cry;
        let b4 = tx * -b1 + ty * -b2 + tz * b3;
        let b5 = cry * crz - srx * sry * srz;
        let b6 = cry * srz + crz * srx * sry;
        let b7 = crx * sry;
        let b8 = tz * b7 - ty * b6 - tx * b5;

        let c5 = crx * srz;

        let mut at_a = Matrix3::zeros();
        let mut at_b = Vector3::zeros();

        for i in 0..self.cloud_ori.len() {
            let p = self.cloud_ori.points[i];
            let coeff = self.coeff_sel.points[i];

            let ary = (b1 * p.x + b2 * p.y - b3 * p.z + b4) * coeff.x
                + (b5 * p.x + b6 * p.y - b7 * p.z + b8) * coeff.z;

            let atx = -b5 * coeff.x + c5 * coeff.y + b1 * coeff.z;

            let atz = b7 * coeff.x - srx * coeff.y - b3 * coeff.z;

            accumulate_normal_equations(
                &mut at_a,
                &mut at_b,
                [ary, atx, atz],
                RESIDUAL_SCALE * coeff.intensity,
            );
        }

        let mut x = solve_qr(&at_a, &at_b);

        if iter_count == 0 {
            self.compute_degeneracy_projection(&at_a);
        }
        if self.is_degenerate {
            x = self.degeneracy_proj * x;
        }

        self.transform_cur.ry += x[0];
        self.transform_cur.tx += x[1];
        self.transform_cur.tz += x[2];
        self.transform_cur.fix_nan();

        let delta_r = (RAD_TO_DEG * x[0]).abs();
        let delta_t = ((x[1] * 100.0).powi(2) + (x[2] * 100.0).powi(2)).sqrt();

        delta_r >= DELTA_ROTATION || delta_t >= DELTA_TRANSLATION
    }

    /// Eigen-analyze the normal matrix and build the projection that zeroes
    /// update components along directions with eigenvalues below the
    /// threshold. Cached for the remaining iterations of the phase.
    pub(crate) fn compute_degeneracy_projection(&mut self, at_a: &Matrix3<f32>) {
        if !at_a.iter().all(|v| v.is_finite()) {
            self.is_degenerate = false;
            self.degeneracy_proj = Matrix3::identity();
            return;
        }

        let eigen = SymmetricEigen::new(*at_a);

        // nalgebra does not order the eigenpairs; sort ascending so the
        // smallest directions come first.
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[a]
                .partial_cmp(&eigen.eigenvalues[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut v = Matrix3::zeros();
        for (slot, &src) in order.iter().enumerate() {
            v.set_column(slot, &eigen.eigenvectors.column(src));
        }

        let mut v2 = v;
        self.is_degenerate = false;
        for (slot, &src) in order.iter().enumerate() {
            if eigen.eigenvalues[src] < EIGEN_THRESHOLD {
                v2.row_mut(slot).fill(0.0);
                self.is_degenerate = true;
            }
        }

        if self.is_degenerate {
            debug!("degenerate normal matrix, suppressing weak directions");
        }

        self.degeneracy_proj = match v.try_inverse() {
            Some(inv) => inv * v2,
            None => Matrix3::identity(),
        };
    }
}

/// Rank-one update of `AᵀA` and `Aᵀb` with one Jacobian row.
#[inline]
fn accumulate_normal_equations(
    at_a: &mut Matrix3<f32>,
    at_b: &mut Vector3<f32>,
    row: [f32; 3],
    b: f32,
) {
    for r in 0..3 {
        for c in 0..3 {
            at_a[(r, c)] += row[r] * row[c];
        }
        at_b[r] += row[r] * b;
    }
}

/// Solve the 3x3 normal equations by column-pivoted QR; a singular system
/// yields a zero step.
#[inline]
fn solve_qr(at_a: &Matrix3<f32>, at_b: &Vector3<f32>) -> Vector3<f32> {
    at_a.col_piv_qr().solve(at_b).unwrap_or_else(Vector3::zeros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn accumulation_matches_explicit_product() {
        let rows = [[1.0, 2.0, 3.0], [0.5, -1.0, 2.0], [4.0, 0.0, -2.0]];
        let bs = [0.1, -0.2, 0.3];

        let mut at_a = Matrix3::zeros();
        let mut at_b = Vector3::zeros();
        for (row, b) in rows.iter().zip(bs.iter()) {
            accumulate_normal_equations(&mut at_a, &mut at_b, *row, *b);
        }

        let a = Matrix3::from_rows(&[
            nalgebra::RowVector3::from_row_slice(&rows[0]),
            nalgebra::RowVector3::from_row_slice(&rows[1]),
            nalgebra::RowVector3::from_row_slice(&rows[2]),
        ]);
        let b = Vector3::from_column_slice(&bs);
        let expected_at_a = a.transpose() * a;
        let expected_at_b = a.transpose() * b;

        for r in 0..3 {
            assert_relative_eq!(at_b[r], expected_at_b[r], epsilon = 1e-5);
            for c in 0..3 {
                assert_relative_eq!(at_a[(r, c)], expected_at_a[(r, c)], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn qr_solves_well_conditioned_system() {
        let at_a = Matrix3::new(4.0, 1.0, 0.0, 1.0, 3.0, 0.5, 0.0, 0.5, 2.0);
        let expected = Vector3::new(1.0, -2.0, 0.5);
        let at_b = at_a * expected;
        let x = solve_qr(&at_a, &at_b);
        for i in 0..3 {
            assert_relative_eq!(x[i], expected[i], epsilon = 1e-4);
        }
    }

    #[test]
    fn singular_system_yields_zero_step() {
        let at_a = Matrix3::zeros();
        let at_b = Vector3::new(1.0, 1.0, 1.0);
        let x = solve_qr(&at_a, &at_b);
        assert_eq!(x, Vector3::zeros());
    }
}
