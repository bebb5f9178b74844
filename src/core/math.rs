//! Mathematical primitives shared by the projection and association stages.
//!
//! All rotations in this crate live in the camera-axis convention produced by
//! the `(x, y, z) <- (y, z, x)` swap applied to every LiDAR point: z points
//! forward, x right, y down. Euler triples `(rx, ry, rz)` compose as
//! `R_z(rz) * R_x(rx) * R_y(ry)`, and the closed forms below are derived for
//! exactly that order. Changing the composition order invalidates the
//! analytical Jacobians in the solver.

use std::f32::consts::PI;

/// Degrees-to-radians scale factor.
pub const DEG_TO_RAD: f32 = PI / 180.0;

/// Radians-to-degrees scale factor.
pub const RAD_TO_DEG: f32 = 180.0 / PI;

/// Normalize angle to [-π, π].
#[inline]
pub fn normalize_angle(angle: f32) -> f32 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a < -PI {
        a += 2.0 * PI;
    }
    a
}

/// Roll/pitch/yaw extraction from an `(x, y, z, w)` quaternion.
///
/// Matches the ZYX (yaw-pitch-roll) convention of the IMU driver: the
/// returned triple satisfies `q = R_z(yaw) * R_y(pitch) * R_x(roll)`.
pub fn rpy_from_quaternion(q: [f32; 4]) -> (f32, f32, f32) {
    let (x, y, z, w) = (q[0], q[1], q[2], q[3]);
    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
    (roll, pitch, yaw)
}

/// Quaternion `(x, y, z, w)` from roll/pitch/yaw, ZYX composition order.
pub fn quaternion_from_rpy(roll: f32, pitch: f32, yaw: f32) -> [f32; 4] {
    let (sr, cr) = (0.5 * roll).sin_cos();
    let (sp, cp) = (0.5 * pitch).sin_cos();
    let (sy, cy) = (0.5 * yaw).sin_cos();
    [
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
        cr * cp * cy + sr * sp * sy,
    ]
}

/// Compose the accumulated rotation `(cx, cy, cz)` with the increment
/// `(lx, ly, lz)` in the camera-axis Euler convention.
///
/// Closed form of extracting Euler angles from `R(c) * R(l)`; the division
/// by `cos(ox)` is well defined away from pitch = ±π/2, which the vehicle
/// never reaches in normal operation.
pub fn accumulate_rotation(
    cx: f32,
    cy: f32,
    cz: f32,
    lx: f32,
    ly: f32,
    lz: f32,
) -> (f32, f32, f32) {
    let srx = lx.cos() * cx.cos() * ly.sin() * cz.sin()
        - cx.cos() * cz.cos() * lx.sin()
        - lx.cos() * ly.cos() * cx.sin();
    let ox = -srx.asin();

    let srycrx = lx.sin() * (cy.cos() * cz.sin() - cz.cos() * cx.sin() * cy.sin())
        + lx.cos() * ly.sin() * (cy.cos() * cz.cos() + cx.sin() * cy.sin() * cz.sin())
        + lx.cos() * ly.cos() * cx.cos() * cy.sin();
    let crycrx = lx.cos() * ly.cos() * cx.cos() * cy.cos()
        - lx.cos() * ly.sin() * (cz.cos() * cy.sin() - cy.cos() * cx.sin() * cz.sin())
        - lx.sin() * (cy.sin() * cz.sin() + cy.cos() * cz.cos() * cx.sin());
    let oy = (srycrx / ox.cos()).atan2(crycrx / ox.cos());

    let srzcrx = cx.sin() * (lz.cos() * ly.sin() - ly.cos() * lx.sin() * lz.sin())
        + cx.cos() * cz.sin() * (ly.cos() * lz.cos() + lx.sin() * ly.sin() * lz.sin())
        + lx.cos() * cx.cos() * cz.cos() * lz.sin();
    let crzcrx = lx.cos() * lz.cos() * cx.cos() * cz.cos()
        - cx.cos() * cz.sin() * (ly.cos() * lz.sin() - lz.cos() * lx.sin() * ly.sin())
        - cx.sin() * (ly.sin() * lz.sin() + ly.cos() * lz.cos() * lx.sin());
    let oz = (srzcrx / ox.cos()).atan2(crzcrx / ox.cos());

    (ox, oy, oz)
}

/// Re-express the accumulated rotation `(bcx, bcy, bcz)` after replacing the
/// IMU attitude at sweep start `(blx, bly, blz)` with the attitude at sweep
/// end `(alx, aly, alz)`.
///
/// Closed form of `R(bc) * R(bl)^-1 * R(al)` in the camera-axis convention.
#[allow(clippy::too_many_arguments)]
pub fn plugin_imu_rotation(
    bcx: f32,
    bcy: f32,
    bcz: f32,
    blx: f32,
    bly: f32,
    blz: f32,
    alx: f32,
    aly: f32,
    alz: f32,
) -> (f32, f32, f32) {
    let (sbcx, cbcx) = bcx.sin_cos();
    let (sbcy, cbcy) = bcy.sin_cos();
    let (sbcz, cbcz) = bcz.sin_cos();

    let (sblx, cblx) = blx.sin_cos();
    let (sbly, cbly) = bly.sin_cos();
    let (sblz, cblz) = blz.sin_cos();

    let (salx, calx) = alx.sin_cos();
    let (saly, caly) = aly.sin_cos();
    let (salz, calz) = alz.sin_cos();

    let srx = -sbcx * (salx * sblx + calx * caly * cblx * cbly + calx * cblx * saly * sbly)
        - cbcx
            * cbcz
            * (calx * saly * (cbly * sblz - cblz * sblx * sbly)
                - calx * caly * (sbly * sblz + cbly * cblz * sblx)
                + cblx * cblz * salx)
        - cbcx
            * sbcz
            * (calx * caly * (cblz * sbly - cbly * sblx * sblz)
                - calx * saly * (cbly * cblz + sblx * sbly * sblz)
                + cblx * salx * sblz);
    let acx = -srx.asin();

    let srycrx = (cbcy * sbcz - cbcz * sbcx * sbcy)
        * (calx * saly * (cbly * sblz - cblz * sblx * sbly)
            - calx * caly * (sbly * sblz + cbly * cblz * sblx)
            + cblx * cblz * salx)
        - (cbcy * cbcz + sbcx * sbcy * sbcz)
            * (calx * caly * (cblz * sbly - cbly * sblx * sblz)
                - calx * saly * (cbly * cblz + sblx * sbly * sblz)
                + cblx * salx * sblz)
        + cbcx * sbcy * (salx * sblx + calx * caly * cblx * cbly + calx * cblx * saly * sbly);
    let crycrx = (cbcz * sbcy - cbcy * sbcx * sbcz)
        * (calx * caly * (cblz * sbly - cbly * sblx * sblz)
            - calx * saly * (cbly * cblz + sblx * sbly * sblz)
            + cblx * salx * sblz)
        - (sbcy * sbcz + cbcy * cbcz * sbcx)
            * (calx * saly * (cbly * sblz - cblz * sblx * sbly)
                - calx * caly * (sbly * sblz + cbly * cblz * sblx)
                + cblx * cblz * salx)
        + cbcx * cbcy * (salx * sblx + calx * caly * cblx * cbly + calx * cblx * saly * sbly);
    let acy = (srycrx / acx.cos()).atan2(crycrx / acx.cos());

    let srzcrx = sbcx
        * (cblx * cbly * (calz * saly - caly * salx * salz)
            - cblx * sbly * (caly * calz + salx * saly * salz)
            + calx * salz * sblx)
        - cbcx
            * cbcz
            * ((caly * calz + salx * saly * salz) * (cbly * sblz - cblz * sblx * sbly)
                + (calz * saly - caly * salx * salz) * (sbly * sblz + cbly * cblz * sblx)
                - calx * cblx * cblz * salz)
        + cbcx
            * sbcz
            * ((caly * calz + salx * saly * salz) * (cbly * cblz + sblx * sbly * sblz)
                + (calz * saly - caly * salx * salz) * (cblz * sbly - cbly * sblx * sblz)
                + calx * cblx * salz * sblz);
    let crzcrx = sbcx
        * (cblx * sbly * (caly * salz - calz * salx * saly)
            - cblx * cbly * (saly * salz + caly * calz * salx)
            + calx * calz * sblx)
        + cbcx
            * cbcz
            * ((saly * salz + caly * calz * salx) * (sbly * sblz + cbly * cblz * sblx)
                + (caly * salz - calz * salx * saly) * (cbly * sblz - cblz * sblx * sbly)
                + calx * calz * cblx * cblz)
        - cbcx
            * sbcz
            * ((saly * salz + caly * calz * salx) * (cblz * sbly - cbly * sblx * sblz)
                + (caly * salz - calz * salx * saly) * (cbly * cblz + sblx * sbly * sblz)
                - calx * calz * cblx * sblz);
    let acz = (srzcrx / acx.cos()).atan2(crzcrx / acx.cos());

    (acx, acy, acz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn normalize_angle_wraps() {
        assert_relative_eq!(normalize_angle(3.0 * PI), PI, epsilon = 1e-6);
        assert_relative_eq!(normalize_angle(-3.0 * PI), -PI, epsilon = 1e-6);
        assert_relative_eq!(normalize_angle(0.5), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn quaternion_rpy_round_trip() {
        let cases = [
            (0.0, 0.0, 0.0),
            (0.1, -0.2, 0.3),
            (-0.5, 0.4, -1.2),
            (1.0, 0.9, 2.5),
        ];
        for (roll, pitch, yaw) in cases {
            let q = quaternion_from_rpy(roll, pitch, yaw);
            let (r, p, y) = rpy_from_quaternion(q);
            assert_relative_eq!(r, roll, epsilon = 1e-5);
            assert_relative_eq!(p, pitch, epsilon = 1e-5);
            assert_relative_eq!(y, yaw, epsilon = 1e-5);
        }
    }

    #[test]
    fn accumulate_rotation_identity() {
        let (ox, oy, oz) = accumulate_rotation(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        assert_relative_eq!(ox, 0.0, epsilon = 1e-6);
        assert_relative_eq!(oy, 0.0, epsilon = 1e-6);
        assert_relative_eq!(oz, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn accumulate_rotation_left_identity() {
        // Composing identity with an increment returns the increment.
        let (ox, oy, oz) = accumulate_rotation(0.0, 0.0, 0.0, 0.05, -0.12, 0.08);
        assert_relative_eq!(ox, 0.05, epsilon = 1e-5);
        assert_relative_eq!(oy, -0.12, epsilon = 1e-5);
        assert_relative_eq!(oz, 0.08, epsilon = 1e-5);
    }

    #[test]
    fn accumulate_rotation_right_identity() {
        let (ox, oy, oz) = accumulate_rotation(0.05, -0.12, 0.08, 0.0, 0.0, 0.0);
        assert_relative_eq!(ox, 0.05, epsilon = 1e-5);
        assert_relative_eq!(oy, -0.12, epsilon = 1e-5);
        assert_relative_eq!(oz, 0.08, epsilon = 1e-5);
    }

    #[test]
    fn accumulate_rotation_cancels_inverse() {
        // R(c) composed with R(c)^-1 built from negated angles of a pure
        // single-axis rotation is the identity.
        let (ox, oy, oz) = accumulate_rotation(0.0, 0.3, 0.0, 0.0, -0.3, 0.0);
        assert_relative_eq!(ox, 0.0, epsilon = 1e-5);
        assert_relative_eq!(oy, 0.0, epsilon = 1e-5);
        assert_relative_eq!(oz, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn plugin_imu_rotation_no_attitude_change() {
        // Identical start and end IMU attitudes leave the rotation untouched.
        let (ax, ay, az) =
            plugin_imu_rotation(0.11, -0.21, 0.31, 0.4, 0.1, -0.2, 0.4, 0.1, -0.2);
        assert_relative_eq!(ax, 0.11, epsilon = 1e-4);
        assert_relative_eq!(ay, -0.21, epsilon = 1e-4);
        assert_relative_eq!(az, 0.31, epsilon = 1e-4);
    }

    #[test]
    fn plugin_imu_rotation_zero_base() {
        // With a zero accumulated rotation and zero start attitude, the
        // result is the end attitude itself.
        let (ax, ay, az) =
            plugin_imu_rotation(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.07, -0.03, 0.05);
        assert_relative_eq!(ax, 0.07, epsilon = 1e-4);
        assert_relative_eq!(ay, -0.03, epsilon = 1e-4);
        assert_relative_eq!(az, 0.05, epsilon = 1e-4);
    }
}
