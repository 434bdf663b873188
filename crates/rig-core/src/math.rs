//! Mathematical type aliases and the 3x4 affine transform.

use anyhow::{ensure, Result};
use nalgebra::{Isometry3, Matrix3, Point2, Point3, Vector2, Vector3};

/// Scalar type used throughout the workspace (currently `f64`).
pub type Real = f64;

/// 2D vector with [`Real`] components.
pub type Vec2 = Vector2<Real>;
/// 3D vector with [`Real`] components.
pub type Vec3 = Vector3<Real>;
/// 2D point with [`Real`] coordinates.
pub type Pt2 = Point2<Real>;
/// 3D point with [`Real`] coordinates.
pub type Pt3 = Point3<Real>;
/// 3×3 matrix with [`Real`] entries.
pub type Mat3 = Matrix3<Real>;
/// 3D rigid transform (SE(3)) using [`Real`].
pub type Iso3 = Isometry3<Real>;

/// A general 3×4 affine transform `x ↦ linear · x + translation`.
///
/// Rigid transforms use [`Iso3`]; this type exists for the transforms that
/// may carry scale or shear: the depth-to-image transform and the
/// registration (similarity) transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine3 {
    pub linear: Mat3,
    pub translation: Vec3,
}

impl Affine3 {
    pub fn identity() -> Self {
        Self {
            linear: Mat3::identity(),
            translation: Vec3::zeros(),
        }
    }

    /// All-zeros transform. Used by the rig config format to mark the rig
    /// transforms as unknown.
    pub fn zero() -> Self {
        Self {
            linear: Mat3::zeros(),
            translation: Vec3::zeros(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.linear == Mat3::zeros() && self.translation == Vec3::zeros()
    }

    pub fn from_iso(iso: &Iso3) -> Self {
        Self {
            linear: iso.rotation.to_rotation_matrix().into_inner(),
            translation: iso.translation.vector,
        }
    }

    /// Build from 12 row-major values: 9 for the linear part, then the
    /// translation.
    pub fn from_row_major(vals: &[Real]) -> Result<Self> {
        ensure!(
            vals.len() == 12,
            "an affine transform must have 12 parameters, got {}",
            vals.len()
        );
        let linear = Mat3::new(
            vals[0], vals[1], vals[2], vals[3], vals[4], vals[5], vals[6], vals[7], vals[8],
        );
        let translation = Vec3::new(vals[9], vals[10], vals[11]);
        Ok(Self {
            linear,
            translation,
        })
    }

    /// Serialize as 12 row-major values (linear part first).
    pub fn to_row_major(&self) -> [Real; 12] {
        let m = &self.linear;
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    pub fn transform_vec(&self, v: &Vec3) -> Vec3 {
        self.linear * v + self.translation
    }

    pub fn transform_point(&self, p: &Pt3) -> Pt3 {
        Pt3::from(self.linear * p.coords + self.translation)
    }

    /// Composition `self ∘ other` (apply `other` first).
    pub fn compose(&self, other: &Affine3) -> Affine3 {
        Affine3 {
            linear: self.linear * other.linear,
            translation: self.linear * other.translation + self.translation,
        }
    }

    pub fn inverse(&self) -> Result<Affine3> {
        let inv = self
            .linear
            .try_inverse()
            .ok_or_else(|| anyhow::anyhow!("affine transform is singular"))?;
        Ok(Affine3 {
            linear: inv,
            translation: -(inv * self.translation),
        })
    }

    /// The uniform scale factor, as the cube root of the determinant of the
    /// linear part.
    pub fn uniform_scale(&self) -> Real {
        self.linear.determinant().cbrt()
    }

    /// Interpret as a rigid transform. The linear part must be orthonormal
    /// to working precision; scale must have been divided out beforehand.
    pub fn to_iso(&self) -> Iso3 {
        let rot = nalgebra::Rotation3::from_matrix(&self.linear);
        Iso3::from_parts(self.translation.into(), rot.into())
    }
}

/// Format a value for the text file formats of this workspace.
///
/// Uses the shortest representation that parses back to the same bits, so
/// write-then-read round-trips are exact (the 17-significant-digit
/// guarantee of the formats this tool exchanges).
pub fn fmt_real(v: Real) -> String {
    format!("{}", v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affine_round_trip_through_row_major() {
        let vals = [
            1.0, 0.1, 0.2, -0.1, 1.1, 0.0, 0.05, -0.02, 0.9, 4.0, 5.0, 6.0,
        ];
        let a = Affine3::from_row_major(&vals).unwrap();
        assert_eq!(a.to_row_major(), vals);
    }

    #[test]
    fn affine_inverse_composes_to_identity() {
        let a = Affine3 {
            linear: Mat3::new(2.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0),
            translation: Vec3::new(1.0, -2.0, 3.0),
        };
        let inv = a.inverse().unwrap();
        let id = a.compose(&inv);
        assert!((id.linear - Mat3::identity()).norm() < 1e-12);
        assert!(id.translation.norm() < 1e-12);
    }

    #[test]
    fn uniform_scale_is_cube_root_of_determinant() {
        let a = Affine3 {
            linear: Mat3::identity() * 2.0,
            translation: Vec3::zeros(),
        };
        assert!((a.uniform_scale() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn wrong_parameter_count_is_rejected() {
        assert!(Affine3::from_row_major(&[1.0; 11]).is_err());
    }
}
