//! Six-parameter rigid transform in the camera-axis convention.

use serde::{Deserialize, Serialize};

/// Euler rotation `(rx, ry, rz)` plus translation `(tx, ty, tz)` in the
/// swapped camera axes (z forward, x right, y down).
///
/// Used both for the inter-sweep transform and the accumulated world pose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform6 {
    pub rx: f32,
    pub ry: f32,
    pub rz: f32,
    pub tx: f32,
    pub ty: f32,
    pub tz: f32,
}

impl Transform6 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Reset every NaN component to zero.
    ///
    /// The solver may produce NaN on pathological inputs; the pipeline
    /// continues with the offending component zeroed rather than surfacing
    /// an error.
    pub fn fix_nan(&mut self) {
        for v in [
            &mut self.rx,
            &mut self.ry,
            &mut self.rz,
            &mut self.tx,
            &mut self.ty,
            &mut self.tz,
        ] {
            if v.is_nan() {
                *v = 0.0;
            }
        }
    }

    /// Squared norm of the rotation part.
    #[inline]
    pub fn rot_norm_sq(&self) -> f32 {
        self.rx * self.rx + self.ry * self.ry + self.rz * self.rz
    }

    /// Squared norm of the translation part.
    #[inline]
    pub fn trans_norm_sq(&self) -> f32 {
        self.tx * self.tx + self.ty * self.ty + self.tz * self.tz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_nan_zeroes_only_offending_components() {
        let mut t = Transform6 {
            rx: f32::NAN,
            ry: 0.5,
            rz: -0.25,
            tx: f32::NAN,
            ty: 1.0,
            tz: f32::NAN,
        };
        t.fix_nan();
        assert_eq!(t.rx, 0.0);
        assert_eq!(t.ry, 0.5);
        assert_eq!(t.rz, -0.25);
        assert_eq!(t.tx, 0.0);
        assert_eq!(t.ty, 1.0);
        assert_eq!(t.tz, 0.0);
    }

    #[test]
    fn identity_is_zero() {
        let t = Transform6::identity();
        assert_eq!(t.rot_norm_sq(), 0.0);
        assert_eq!(t.trans_norm_sq(), 0.0);
    }
}
