//! IMU-aided motion de-skew.
//!
//! Every point of the segmented cloud is axis-swapped into camera axes,
//! stamped with its relative time inside the sweep and, when inertial data
//! is available, moved into the sweep-start frame using interpolated IMU
//! orientation, velocity and position.

use std::f32::consts::PI;

use nalgebra::Vector3;

use crate::config::IMU_QUE_LENGTH;
use crate::core::types::Point;
use crate::imu::ImuRing;

use super::FeatureAssociation;

/// Per-sweep inertial state captured while de-skewing.
///
/// `*_start` fields hold the interpolated IMU state at the sweep's first
/// point, `*_cur` the state at the point currently being processed and
/// `*_last` the state at the end of the previous sweep.
#[derive(Debug, Clone)]
pub(crate) struct SweepImu {
    pub roll_start: f32,
    pub pitch_start: f32,
    pub yaw_start: f32,
    pub cos_roll_start: f32,
    pub cos_pitch_start: f32,
    pub cos_yaw_start: f32,
    pub sin_roll_start: f32,
    pub sin_pitch_start: f32,
    pub sin_yaw_start: f32,
    pub roll_cur: f32,
    pub pitch_cur: f32,
    pub yaw_cur: f32,
    pub velo_start: Vector3<f32>,
    pub shift_start: Vector3<f32>,
    pub velo_cur: Vector3<f32>,
    pub shift_cur: Vector3<f32>,
    pub shift_from_start_cur: Vector3<f32>,
    pub velo_from_start_cur: Vector3<f32>,
    pub angular_rotation_cur: Vector3<f32>,
    pub angular_rotation_last: Vector3<f32>,
    pub angular_from_start: Vector3<f32>,
    pub roll_last: f32,
    pub pitch_last: f32,
    pub yaw_last: f32,
    pub shift_from_start: Vector3<f32>,
    pub velo_from_start: Vector3<f32>,
    pub pointer_front: usize,
    pub pointer_last_iteration: usize,
}

impl Default for SweepImu {
    fn default() -> Self {
        Self {
            roll_start: 0.0,
            pitch_start: 0.0,
            yaw_start: 0.0,
            cos_roll_start: 0.0,
            cos_pitch_start: 0.0,
            cos_yaw_start: 0.0,
            sin_roll_start: 0.0,
            sin_pitch_start: 0.0,
            sin_yaw_start: 0.0,
            roll_cur: 0.0,
            pitch_cur: 0.0,
            yaw_cur: 0.0,
            velo_start: Vector3::zeros(),
            shift_start: Vector3::zeros(),
            velo_cur: Vector3::zeros(),
            shift_cur: Vector3::zeros(),
            shift_from_start_cur: Vector3::zeros(),
            velo_from_start_cur: Vector3::zeros(),
            angular_rotation_cur: Vector3::zeros(),
            angular_rotation_last: Vector3::zeros(),
            angular_from_start: Vector3::zeros(),
            roll_last: 0.0,
            pitch_last: 0.0,
            yaw_last: 0.0,
            shift_from_start: Vector3::zeros(),
            velo_from_start: Vector3::zeros(),
            pointer_front: 0,
            pointer_last_iteration: 0,
        }
    }
}

impl SweepImu {
    /// Refresh the cached trigonometry of the sweep-start attitude.
    pub(crate) fn update_start_sin_cos(&mut self) {
        self.cos_roll_start = self.roll_start.cos();
        self.cos_pitch_start = self.pitch_start.cos();
        self.cos_yaw_start = self.yaw_start.cos();
        self.sin_roll_start = self.roll_start.sin();
        self.sin_pitch_start = self.pitch_start.sin();
        self.sin_yaw_start = self.yaw_start.sin();
    }

    /// Position drift of the current point relative to constant-velocity
    /// motion from the sweep start, rotated into the start frame.
    fn shift_to_start(&mut self, point_time: f32) {
        let drift = self.shift_cur - self.shift_start - self.velo_start * point_time;

        let x1 = self.cos_yaw_start * drift.x - self.sin_yaw_start * drift.z;
        let y1 = drift.y;
        let z1 = self.sin_yaw_start * drift.x + self.cos_yaw_start * drift.z;

        let x2 = x1;
        let y2 = self.cos_pitch_start * y1 + self.sin_pitch_start * z1;
        let z2 = -self.sin_pitch_start * y1 + self.cos_pitch_start * z1;

        self.shift_from_start_cur = Vector3::new(
            self.cos_roll_start * x2 + self.sin_roll_start * y2,
            -self.sin_roll_start * x2 + self.cos_roll_start * y2,
            z2,
        );
    }

    /// Velocity of the current point relative to the sweep start, rotated
    /// into the start frame.
    fn velo_to_start(&mut self) {
        let dv = self.velo_cur - self.velo_start;

        let x1 = self.cos_yaw_start * dv.x - self.sin_yaw_start * dv.z;
        let y1 = dv.y;
        let z1 = self.sin_yaw_start * dv.x + self.cos_yaw_start * dv.z;

        let x2 = x1;
        let y2 = self.cos_pitch_start * y1 + self.sin_pitch_start * z1;
        let z2 = -self.sin_pitch_start * y1 + self.cos_pitch_start * z1;

        self.velo_from_start_cur = Vector3::new(
            self.cos_roll_start * x2 + self.sin_roll_start * y2,
            -self.sin_roll_start * x2 + self.cos_roll_start * y2,
            z2,
        );
    }

    /// Rotate a point by the current IMU attitude, inverse-rotate by the
    /// sweep-start attitude and apply the position drift.
    fn transform_to_start_imu(&self, p: &mut Point) {
        let x1 = self.roll_cur.cos() * p.x - self.roll_cur.sin() * p.y;
        let y1 = self.roll_cur.sin() * p.x + self.roll_cur.cos() * p.y;
        let z1 = p.z;

        let x2 = x1;
        let y2 = self.pitch_cur.cos() * y1 - self.pitch_cur.sin() * z1;
        let z2 = self.pitch_cur.sin() * y1 + self.pitch_cur.cos() * z1;

        let x3 = self.yaw_cur.cos() * x2 + self.yaw_cur.sin() * z2;
        let y3 = y2;
        let z3 = -self.yaw_cur.sin() * x2 + self.yaw_cur.cos() * z2;

        let x4 = self.cos_yaw_start * x3 - self.sin_yaw_start * z3;
        let y4 = y3;
        let z4 = self.sin_yaw_start * x3 + self.cos_yaw_start * z3;

        let x5 = x4;
        let y5 = self.cos_pitch_start * y4 + self.sin_pitch_start * z4;
        let z5 = -self.sin_pitch_start * y4 + self.cos_pitch_start * z4;

        p.x = self.cos_roll_start * x5 + self.sin_roll_start * y5 + self.shift_from_start_cur.x;
        p.y = -self.sin_roll_start * x5 + self.cos_roll_start * y5 + self.shift_from_start_cur.y;
        p.z = z5 + self.shift_from_start_cur.z;
    }
}

impl FeatureAssociation {
    /// De-skew the segmented cloud in place.
    ///
    /// Axis-swaps every point, computes its relative time from the sweep
    /// orientation span and, when IMU samples exist, warps it into the
    /// sweep-start frame.
    pub(crate) fn adjust_distortion(&mut self, ring: &ImuRing) {
        let mut half_passed = false;
        let cloud_size = self.segmented_cloud.len();

        for i in 0..cloud_size {
            let raw = self.segmented_cloud.points[i];
            let mut point = Point::new(raw.y, raw.z, raw.x, raw.intensity);

            let mut ori = -point.x.atan2(point.z);
            if !half_passed {
                if ori < self.seg_info.start_orientation - PI / 2.0 {
                    ori += 2.0 * PI;
                } else if ori > self.seg_info.start_orientation + PI * 3.0 / 2.0 {
                    ori -= 2.0 * PI;
                }
                if ori - self.seg_info.start_orientation > PI {
                    half_passed = true;
                }
            } else {
                ori += 2.0 * PI;
                if ori < self.seg_info.end_orientation - PI * 3.0 / 2.0 {
                    ori += 2.0 * PI;
                } else if ori > self.seg_info.end_orientation + PI / 2.0 {
                    ori -= 2.0 * PI;
                }
            }

            let rel_time =
                (ori - self.seg_info.start_orientation) / self.seg_info.orientation_diff;
            point.intensity = raw.intensity.trunc() + self.config.scan_period * rel_time;

            if let Some(pointer_last) = ring.pointer_last() {
                let point_time = rel_time * self.config.scan_period;
                self.interpolate_imu(ring, pointer_last, point_time);

                if i == 0 {
                    self.capture_sweep_start(ring, pointer_last, point_time);
                } else {
                    self.sweep_imu.shift_to_start(point_time);
                    self.sweep_imu.velo_to_start();
                    self.sweep_imu.transform_to_start_imu(&mut point);
                }
            }

            self.segmented_cloud.points[i] = point;
        }

        if let Some(pointer_last) = ring.pointer_last() {
            self.sweep_imu.pointer_last_iteration = pointer_last;
        }
    }

    /// Advance the ring pointer to bracket `time_scan_cur + point_time` and
    /// blend orientation, velocity and position between the two samples.
    fn interpolate_imu(&mut self, ring: &ImuRing, pointer_last: usize, point_time: f32) {
        let t = self.time_scan_cur + point_time as f64;
        let imu = &mut self.sweep_imu;

        imu.pointer_front = imu.pointer_last_iteration;
        while imu.pointer_front != pointer_last {
            if t < ring.time[imu.pointer_front] {
                break;
            }
            imu.pointer_front = (imu.pointer_front + 1) % IMU_QUE_LENGTH;
        }

        let front = imu.pointer_front;
        if t > ring.time[front] {
            // The newest sample is still older than the point: hold it.
            imu.roll_cur = ring.roll[front];
            imu.pitch_cur = ring.pitch[front];
            imu.yaw_cur = ring.yaw[front];
            imu.velo_cur = ring.velo[front];
            imu.shift_cur = ring.shift[front];
        } else {
            let back = (front + IMU_QUE_LENGTH - 1) % IMU_QUE_LENGTH;
            let span = (ring.time[front] - ring.time[back]) as f32;
            let ratio_front = ((t - ring.time[back]) as f32) / span;
            let ratio_back = ((ring.time[front] - t) as f32) / span;

            imu.roll_cur = ring.roll[front] * ratio_front + ring.roll[back] * ratio_back;
            imu.pitch_cur = ring.pitch[front] * ratio_front + ring.pitch[back] * ratio_back;
            // Unwrap yaw across the ±π seam before blending.
            if ring.yaw[front] - ring.yaw[back] > PI {
                imu.yaw_cur =
                    ring.yaw[front] * ratio_front + (ring.yaw[back] + 2.0 * PI) * ratio_back;
            } else if ring.yaw[front] - ring.yaw[back] < -PI {
                imu.yaw_cur =
                    ring.yaw[front] * ratio_front + (ring.yaw[back] - 2.0 * PI) * ratio_back;
            } else {
                imu.yaw_cur = ring.yaw[front] * ratio_front + ring.yaw[back] * ratio_back;
            }

            imu.velo_cur = ring.velo[front] * ratio_front + ring.velo[back] * ratio_back;
            imu.shift_cur = ring.shift[front] * ratio_front + ring.shift[back] * ratio_back;
        }
    }

    /// Record the interpolated IMU state at the sweep's first point as the
    /// reference for the whole sweep.
    fn capture_sweep_start(&mut self, ring: &ImuRing, _pointer_last: usize, point_time: f32) {
        let t = self.time_scan_cur + point_time as f64;
        let imu = &mut self.sweep_imu;

        imu.roll_start = imu.roll_cur;
        imu.pitch_start = imu.pitch_cur;
        imu.yaw_start = imu.yaw_cur;
        imu.velo_start = imu.velo_cur;
        imu.shift_start = imu.shift_cur;

        let front = imu.pointer_front;
        if t > ring.time[front] {
            imu.angular_rotation_cur = ring.angular_rotation[front];
        } else {
            let back = (front + IMU_QUE_LENGTH - 1) % IMU_QUE_LENGTH;
            let span = (ring.time[front] - ring.time[back]) as f32;
            let ratio_front = ((t - ring.time[back]) as f32) / span;
            let ratio_back = ((ring.time[front] - t) as f32) / span;
            imu.angular_rotation_cur = ring.angular_rotation[front] * ratio_front
                + ring.angular_rotation[back] * ratio_back;
        }

        imu.angular_from_start = imu.angular_rotation_cur - imu.angular_rotation_last;
        imu.angular_rotation_last = imu.angular_rotation_cur;

        imu.update_start_sin_cos();
    }
}
