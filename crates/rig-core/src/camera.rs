//! Per-sensor camera parameters.
//!
//! Pixels come in two flavors throughout the workspace:
//! - **distorted pixels**: raw image coordinates, including the optical
//!   center offset and lens distortion;
//! - **undistorted centered pixels**: `f · (X/Z, Y/Z)` for a camera-frame
//!   point, with the optical center at the origin.
//!
//! [`SensorParams`] converts between the two and projects camera-frame
//! points.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::distortion::Distortion;
use crate::math::{Real, Vec2, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Intrinsic parameters of one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorParams {
    /// Focal lengths along x and y. The optimizer collapses the pair into a
    /// single scalar; [`Self::focal_length`] is their mean.
    focal: Vec2,
    optical_center: Vec2,
    distortion: Distortion,
    distorted_size: ImageSize,
    undistorted_size: ImageSize,
}

impl SensorParams {
    pub fn new(
        focal: Vec2,
        optical_center: Vec2,
        distortion: Distortion,
        distorted_size: ImageSize,
        undistorted_size: ImageSize,
    ) -> Result<Self> {
        ensure!(
            focal.x > 0.0 && focal.y > 0.0,
            "focal length must be positive, got {} {}",
            focal.x,
            focal.y
        );
        Ok(Self {
            focal,
            optical_center,
            distortion,
            distorted_size,
            undistorted_size,
        })
    }

    /// The focal length seen by the optimizer: the mean of fx and fy.
    pub fn focal_length(&self) -> Real {
        0.5 * (self.focal.x + self.focal.y)
    }

    pub fn focal_vector(&self) -> Vec2 {
        self.focal
    }

    /// Collapse both focal lengths to the given scalar.
    pub fn set_focal_length(&mut self, f: Real) {
        self.focal = Vec2::new(f, f);
    }

    pub fn optical_center(&self) -> Vec2 {
        self.optical_center
    }

    pub fn set_optical_center(&mut self, c: Vec2) {
        self.optical_center = c;
    }

    pub fn distortion(&self) -> &Distortion {
        &self.distortion
    }

    pub fn distortion_mut(&mut self) -> &mut Distortion {
        &mut self.distortion
    }

    pub fn distorted_size(&self) -> ImageSize {
        self.distorted_size
    }

    pub fn undistorted_size(&self) -> ImageSize {
        self.undistorted_size
    }

    /// Distorted pixel → undistorted centered pixel.
    pub fn undistort_pixel(&self, dist_pix: &Vec2) -> Vec2 {
        let n_dist = (dist_pix - self.optical_center).component_div(&self.focal);
        let n_undist = self.distortion.undistort(&n_dist);
        n_undist.component_mul(&self.focal)
    }

    /// Undistorted centered pixel → distorted pixel.
    pub fn distort_pixel(&self, undist_pix: &Vec2) -> Vec2 {
        let n_undist = undist_pix.component_div(&self.focal);
        let n_dist = self.distortion.distort(&n_undist);
        n_dist.component_mul(&self.focal) + self.optical_center
    }

    /// Project a camera-frame point into a distorted pixel. Points at or
    /// behind the camera plane return `None`.
    pub fn project(&self, p_cam: &Vec3) -> Option<Vec2> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let undist = Vec2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z).component_mul(&self.focal);
        Some(self.distort_pixel(&undist))
    }

    /// Back-project a distorted pixel to a unit ray in the camera frame.
    pub fn backproject(&self, dist_pix: &Vec2) -> Vec3 {
        let undist = self.undistort_pixel(dist_pix);
        let dir = Vec3::new(undist.x / self.focal.x, undist.y / self.focal.y, 1.0);
        dir / dir.norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distortion::RADTAN_DISTORTION;

    fn params() -> SensorParams {
        SensorParams::new(
            Vec2::new(600.0, 600.0),
            Vec2::new(320.0, 240.0),
            Distortion::from_coeffs(RADTAN_DISTORTION, &[-0.25, 0.05, 0.001, -0.001]).unwrap(),
            ImageSize::new(640, 480),
            ImageSize::new(720, 540),
        )
        .unwrap()
    }

    #[test]
    fn pixel_conversions_invert() {
        let p = params();
        let dist = Vec2::new(410.5, 150.25);
        let undist = p.undistort_pixel(&dist);
        let back = p.distort_pixel(&undist);
        assert!((back - dist).norm() < 1e-6, "got {back}, want {dist}");
    }

    #[test]
    fn project_backproject_consistent() {
        let p = params();
        let x = Vec3::new(0.2, -0.15, 2.0);
        let pix = p.project(&x).unwrap();
        let ray = p.backproject(&pix);
        let along = ray * (x.norm());
        assert!((along - x).norm() < 1e-5, "ray {along} vs point {x}");
    }

    #[test]
    fn behind_camera_does_not_project() {
        let p = params();
        assert!(p.project(&Vec3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn nonpositive_focal_rejected() {
        assert!(SensorParams::new(
            Vec2::new(0.0, 600.0),
            Vec2::zeros(),
            Distortion::None,
            ImageSize::new(640, 480),
            ImageSize::new(640, 480),
        )
        .is_err());
    }
}
