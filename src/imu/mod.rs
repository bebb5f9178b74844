//! Inertial sample buffering and forward integration.
//!
//! The sensor callback pushes samples into a fixed 200-slot ring shared with
//! the associator behind one mutex. Each push de-gravitates the measured
//! acceleration, permutes it into the LiDAR axis convention and integrates
//! velocity, position and angular rotation forward from the previous slot.

use nalgebra::Vector3;

use crate::config::IMU_QUE_LENGTH;
use crate::core::math::rpy_from_quaternion;

/// Standard gravity, m/s².
const GRAVITY: f32 = 9.81;

/// One raw inertial measurement as delivered by the driver.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Measurement time, seconds.
    pub stamp: f64,
    /// Orientation quaternion `(x, y, z, w)`.
    pub orientation: [f32; 4],
    /// Linear acceleration in the sensor frame, m/s².
    pub linear_acceleration: [f32; 3],
    /// Angular velocity in the sensor frame, rad/s.
    pub angular_velocity: [f32; 3],
}

/// Fixed-capacity circular buffer of processed inertial state.
///
/// `pointer_last` is the most recently written slot; it starts at `None`
/// until the first sample arrives. Slots wrap modulo [`IMU_QUE_LENGTH`].
#[derive(Debug)]
pub struct ImuRing {
    pub(crate) time: [f64; IMU_QUE_LENGTH],
    pub(crate) roll: [f32; IMU_QUE_LENGTH],
    pub(crate) pitch: [f32; IMU_QUE_LENGTH],
    pub(crate) yaw: [f32; IMU_QUE_LENGTH],
    pub(crate) acc: [Vector3<f32>; IMU_QUE_LENGTH],
    pub(crate) velo: [Vector3<f32>; IMU_QUE_LENGTH],
    pub(crate) shift: [Vector3<f32>; IMU_QUE_LENGTH],
    pub(crate) angular_velo: [Vector3<f32>; IMU_QUE_LENGTH],
    pub(crate) angular_rotation: [Vector3<f32>; IMU_QUE_LENGTH],
    pointer_last: Option<usize>,
    /// Integration window: deltas at or above this are treated as a gap and
    /// the slot restarts from rest.
    scan_period: f32,
}

impl ImuRing {
    /// Create an empty ring.
    pub fn new(scan_period: f32) -> Self {
        Self {
            time: [0.0; IMU_QUE_LENGTH],
            roll: [0.0; IMU_QUE_LENGTH],
            pitch: [0.0; IMU_QUE_LENGTH],
            yaw: [0.0; IMU_QUE_LENGTH],
            acc: [Vector3::zeros(); IMU_QUE_LENGTH],
            velo: [Vector3::zeros(); IMU_QUE_LENGTH],
            shift: [Vector3::zeros(); IMU_QUE_LENGTH],
            angular_velo: [Vector3::zeros(); IMU_QUE_LENGTH],
            angular_rotation: [Vector3::zeros(); IMU_QUE_LENGTH],
            pointer_last: None,
            scan_period,
        }
    }

    /// Most recently written slot, if any sample has arrived.
    #[inline]
    pub fn pointer_last(&self) -> Option<usize> {
        self.pointer_last
    }

    /// Ingest one sample: orientation to RPY, de-gravitation, axis
    /// permutation, world-frame rotation and forward integration.
    pub fn push(&mut self, sample: &ImuSample) {
        let (roll, pitch, yaw) = rpy_from_quaternion(sample.orientation);

        // Remove gravity and permute (x, y, z) -> (y, z, x) into the
        // camera-axis convention used by the rest of the pipeline.
        let acc_x = sample.linear_acceleration[1] - roll.sin() * pitch.cos() * GRAVITY;
        let acc_y = sample.linear_acceleration[2] - roll.cos() * pitch.cos() * GRAVITY;
        let acc_z = sample.linear_acceleration[0] + pitch.sin() * GRAVITY;

        let last = match self.pointer_last {
            Some(p) => (p + 1) % IMU_QUE_LENGTH,
            None => 0,
        };
        self.pointer_last = Some(last);

        self.time[last] = sample.stamp;
        self.roll[last] = roll;
        self.pitch[last] = pitch;
        self.yaw[last] = yaw;
        self.acc[last] = Vector3::new(acc_x, acc_y, acc_z);
        self.angular_velo[last] = Vector3::new(
            sample.angular_velocity[0],
            sample.angular_velocity[1],
            sample.angular_velocity[2],
        );

        self.integrate(last);
    }

    /// Rotate the newest acceleration into the common world frame and
    /// integrate velocity, position and angular rotation from the previous
    /// slot. The rotation order `R_z(yaw) * R_x(pitch) * R_y(roll)` reflects
    /// the axis swap and must not be reordered.
    fn integrate(&mut self, last: usize) {
        let roll = self.roll[last];
        let pitch = self.pitch[last];
        let yaw = self.yaw[last];
        let acc = self.acc[last];

        let x1 = roll.cos() * acc.x - roll.sin() * acc.y;
        let y1 = roll.sin() * acc.x + roll.cos() * acc.y;
        let z1 = acc.z;

        let x2 = x1;
        let y2 = pitch.cos() * y1 - pitch.sin() * z1;
        let z2 = pitch.sin() * y1 + pitch.cos() * z1;

        let acc_world = Vector3::new(
            yaw.cos() * x2 + yaw.sin() * z2,
            y2,
            -yaw.sin() * x2 + yaw.cos() * z2,
        );

        let back = (last + IMU_QUE_LENGTH - 1) % IMU_QUE_LENGTH;
        let dt = (self.time[last] - self.time[back]) as f32;
        if dt < self.scan_period {
            self.shift[last] =
                self.shift[back] + self.velo[back] * dt + acc_world * (dt * dt / 2.0);
            self.velo[last] = self.velo[back] + acc_world * dt;
            self.angular_rotation[last] =
                self.angular_rotation[back] + self.angular_velo[back] * dt;
        } else {
            self.shift[last] = Vector3::zeros();
            self.velo[last] = Vector3::zeros();
            self.angular_rotation[last] = Vector3::zeros();
        }
    }
}
