//! Polymorphic lens distortion, acting on normalized image coordinates.
//!
//! The model is a tagged variant rather than a trait object: the set of
//! models is closed and the optimizer needs to know the coefficient layout
//! of each kind.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::math::{Real, Vec2};

/// Config-file label for the distortion-free model.
pub const NO_DISTORTION: &str = "no_distortion";
/// Config-file label for the one-parameter FOV model.
pub const FISHEYE_DISTORTION: &str = "fisheye";
/// Config-file label for the radial-tangential model.
pub const RADTAN_DISTORTION: &str = "radtan";

/// Iterations of the fixed-point inverse for the radial-tangential model.
const RADTAN_UNDISTORT_ITERS: usize = 25;

/// Lens distortion mapping between undistorted and distorted normalized
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Distortion {
    /// Identity mapping, zero coefficients.
    None,
    /// FOV model with a single field-of-view parameter.
    Fisheye { w: Real },
    /// Radial-tangential model, `k1 k2 [k3] p1 p2`. The 4-coefficient form
    /// has `k3 == 0` and is written back with 4 coefficients.
    RadTan {
        k1: Real,
        k2: Real,
        k3: Real,
        p1: Real,
        p2: Real,
        /// Whether the config carried 5 coefficients (else 4, without k3).
        five: bool,
    },
}

impl Distortion {
    /// Build from a config-file kind label and coefficient list. The
    /// coefficient count must match the kind: 0, 1, or 4/5.
    pub fn from_coeffs(kind: &str, coeffs: &[Real]) -> Result<Self> {
        match (kind, coeffs.len()) {
            (NO_DISTORTION, 0) => Ok(Distortion::None),
            (FISHEYE_DISTORTION, 1) => Ok(Distortion::Fisheye { w: coeffs[0] }),
            (RADTAN_DISTORTION, 4) => Ok(Distortion::RadTan {
                k1: coeffs[0],
                k2: coeffs[1],
                k3: 0.0,
                p1: coeffs[2],
                p2: coeffs[3],
                five: false,
            }),
            (RADTAN_DISTORTION, 5) => Ok(Distortion::RadTan {
                k1: coeffs[0],
                k2: coeffs[1],
                k3: coeffs[2],
                p1: coeffs[3],
                p2: coeffs[4],
                five: true,
            }),
            (NO_DISTORTION | FISHEYE_DISTORTION | RADTAN_DISTORTION, n) => bail!(
                "distortion type {} cannot have {} coefficients",
                kind,
                n
            ),
            (other, _) => bail!("unknown distortion type: {}", other),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Distortion::None => NO_DISTORTION,
            Distortion::Fisheye { .. } => FISHEYE_DISTORTION,
            Distortion::RadTan { .. } => RADTAN_DISTORTION,
        }
    }

    pub fn param_count(&self) -> usize {
        match self {
            Distortion::None => 0,
            Distortion::Fisheye { .. } => 1,
            Distortion::RadTan { five, .. } => {
                if *five {
                    5
                } else {
                    4
                }
            }
        }
    }

    pub fn coeffs(&self) -> Vec<Real> {
        match *self {
            Distortion::None => vec![],
            Distortion::Fisheye { w } => vec![w],
            Distortion::RadTan {
                k1,
                k2,
                k3,
                p1,
                p2,
                five,
            } => {
                if five {
                    vec![k1, k2, k3, p1, p2]
                } else {
                    vec![k1, k2, p1, p2]
                }
            }
        }
    }

    /// Replace the coefficients, keeping the kind and layout.
    pub fn set_coeffs(&mut self, coeffs: &[Real]) -> Result<()> {
        *self = Distortion::from_coeffs(self.kind(), coeffs)?;
        Ok(())
    }

    /// Apply distortion to undistorted normalized coordinates.
    pub fn distort(&self, n_undist: &Vec2) -> Vec2 {
        match *self {
            Distortion::None => *n_undist,
            Distortion::Fisheye { w } => {
                let ru = n_undist.norm();
                if ru < 1e-12 || w.abs() < 1e-12 {
                    return *n_undist;
                }
                let rd = (2.0 * ru * (w / 2.0).tan()).atan() / w;
                n_undist * (rd / ru)
            }
            Distortion::RadTan {
                k1,
                k2,
                k3,
                p1,
                p2,
                ..
            } => {
                let (x, y) = (n_undist.x, n_undist.y);
                let r2 = x * x + y * y;
                let r4 = r2 * r2;
                let r6 = r4 * r2;
                let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
                let x_tan = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                let y_tan = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                Vec2::new(x * radial + x_tan, y * radial + y_tan)
            }
        }
    }

    /// Remove distortion from distorted normalized coordinates. The
    /// numerical inverse of [`Self::distort`] to solver precision.
    pub fn undistort(&self, n_dist: &Vec2) -> Vec2 {
        match *self {
            Distortion::None => *n_dist,
            Distortion::Fisheye { w } => {
                let rd = n_dist.norm();
                if rd < 1e-12 || w.abs() < 1e-12 {
                    return *n_dist;
                }
                let ru = (rd * w).tan() / (2.0 * (w / 2.0).tan());
                n_dist * (ru / rd)
            }
            Distortion::RadTan { .. } => {
                let mut n = *n_dist;
                for _ in 0..RADTAN_UNDISTORT_ITERS {
                    let err = self.distort(&n) - n_dist;
                    n -= err;
                }
                n
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(dist: &Distortion, n: Vec2, tol: f64) {
        let d = dist.distort(&n);
        let u = dist.undistort(&d);
        assert!(
            (u - n).norm() < tol,
            "roundtrip failed for {:?}: {} vs {}",
            dist,
            u,
            n
        );
    }

    #[test]
    fn radtan_distort_undistort_inverse() {
        let dist = Distortion::from_coeffs(RADTAN_DISTORTION, &[-0.28, 0.07, 0.001, -0.0005])
            .unwrap();
        for &(x, y) in &[(0.0, 0.0), (0.1, -0.2), (0.3, 0.3), (-0.25, 0.15)] {
            // 1e-6 px at a nominal 600 px focal length
            roundtrip(&dist, Vec2::new(x, y), 1e-6 / 600.0);
        }
    }

    #[test]
    fn radtan_five_coefficients() {
        let dist =
            Distortion::from_coeffs(RADTAN_DISTORTION, &[-0.28, 0.07, 0.01, 0.001, -0.0005])
                .unwrap();
        assert_eq!(dist.param_count(), 5);
        roundtrip(&dist, Vec2::new(0.2, -0.1), 1e-9);
    }

    #[test]
    fn fisheye_distort_undistort_inverse() {
        let dist = Distortion::Fisheye { w: 0.95 };
        for &(x, y) in &[(0.05, 0.0), (0.2, -0.3), (-0.4, 0.4)] {
            roundtrip(&dist, Vec2::new(x, y), 1e-6 / 600.0);
        }
    }

    #[test]
    fn none_is_identity() {
        let n = Vec2::new(0.37, -0.12);
        assert_eq!(Distortion::None.distort(&n), n);
        assert_eq!(Distortion::None.undistort(&n), n);
    }

    #[test]
    fn coefficient_count_mismatch_is_rejected() {
        assert!(Distortion::from_coeffs(FISHEYE_DISTORTION, &[1.0, 2.0]).is_err());
        assert!(Distortion::from_coeffs(RADTAN_DISTORTION, &[1.0, 2.0, 3.0]).is_err());
        assert!(Distortion::from_coeffs("barrel", &[1.0]).is_err());
    }

    #[test]
    fn coeff_layout_round_trips() {
        let four = Distortion::from_coeffs(RADTAN_DISTORTION, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(four.coeffs(), vec![0.1, 0.2, 0.3, 0.4]);
        let five =
            Distortion::from_coeffs(RADTAN_DISTORTION, &[0.1, 0.2, 0.5, 0.3, 0.4]).unwrap();
        assert_eq!(five.coeffs(), vec![0.1, 0.2, 0.5, 0.3, 0.4]);
    }
}
