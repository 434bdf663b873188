//! Conversions between geometry types and solver parameter vectors.
//!
//! SE(3) blocks are stored as `[qx, qy, qz, qw, tx, ty, tz]`; affine blocks
//! as the 12 row-major values of the 3×4 matrix.

use anyhow::{ensure, Result};
use nalgebra::{DVector, DVectorView, Quaternion, UnitQuaternion, Vector3};
use rig_core::{Affine3, Iso3};

/// Convert an [`Iso3`] into a 7D SE(3) parameter vector.
pub fn iso3_to_dvec(pose: &Iso3) -> DVector<f64> {
    let q = pose.rotation.into_inner();
    let t = pose.translation.vector;
    nalgebra::dvector![q.coords[0], q.coords[1], q.coords[2], q.coords[3], t.x, t.y, t.z]
}

/// Convert a 7D SE(3) parameter vector into an [`Iso3`].
pub fn dvec_to_iso3(v: DVectorView<'_, f64>) -> Result<Iso3> {
    ensure!(v.len() == 7, "expected se3 vector of length 7, got {}", v.len());
    let quat = Quaternion::new(v[3], v[0], v[1], v[2]);
    let rot = UnitQuaternion::from_quaternion(quat);
    let trans = Vector3::new(v[4], v[5], v[6]);
    Ok(Iso3::from_parts(trans.into(), rot))
}

/// Convert an [`Affine3`] into a 12D row-major parameter vector.
pub fn affine_to_dvec(t: &Affine3) -> DVector<f64> {
    DVector::from_row_slice(&t.to_row_major())
}

/// Convert a 12D row-major parameter vector into an [`Affine3`].
pub fn dvec_to_affine(v: DVectorView<'_, f64>) -> Result<Affine3> {
    ensure!(
        v.len() == 12,
        "expected affine vector of length 12, got {}",
        v.len()
    );
    let vals: Vec<f64> = v.iter().copied().collect();
    Affine3::from_row_major(&vals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::{Mat3, Vec3};

    #[test]
    fn iso3_round_trips() {
        let rot = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.7);
        let pose = Iso3::from_parts(Vector3::new(1.0, -2.0, 0.5).into(), rot);
        let v = iso3_to_dvec(&pose);
        let back = dvec_to_iso3(v.as_view()).unwrap();
        assert!((back.to_homogeneous() - pose.to_homogeneous()).norm() < 1e-14);
    }

    #[test]
    fn affine_round_trips() {
        let t = Affine3 {
            linear: Mat3::new(1.0, 0.1, 0.0, -0.1, 1.0, 0.0, 0.0, 0.0, 1.002),
            translation: Vec3::new(0.01, -0.02, 0.03),
        };
        let v = affine_to_dvec(&t);
        let back = dvec_to_affine(v.as_view()).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn wrong_lengths_are_rejected() {
        let v = DVector::from_row_slice(&[1.0; 6]);
        assert!(dvec_to_iso3(v.as_view()).is_err());
        assert!(dvec_to_affine(v.as_view()).is_err());
    }
}
