//! Closed-form similarity fitting (Kabsch) and the transform application
//! used by map registration.

use anyhow::{bail, Result};
use nalgebra::{Matrix3, SVD};
use rig_core::{Affine3, Iso3, Mat3, Pt3, Real, Vec3};

/// Fit the similarity transform `x ↦ s · R · x + t` mapping `src` onto
/// `dst`.
///
/// The scale comes from the ratio of sums of consecutive inter-point
/// distances, then the rotation from a centroid-centered SVD with the
/// reflection corrected so a proper rotation is always returned.
pub fn fit_similarity(src: &[Pt3], dst: &[Pt3]) -> Result<Affine3> {
    if src.len() != dst.len() {
        bail!(
            "similarity fit needs matched point sets, got {} vs {}",
            src.len(),
            dst.len()
        );
    }
    if src.len() < 3 {
        bail!("similarity fit needs at least 3 points, got {}", src.len());
    }

    let mut dist_src = 0.0;
    let mut dist_dst = 0.0;
    for i in 0..src.len() - 1 {
        dist_src += (src[i + 1] - src[i]).norm();
        dist_dst += (dst[i + 1] - dst[i]).norm();
    }
    if dist_src <= 0.0 || dist_dst <= 0.0 {
        bail!("degenerate point sets: zero distance span during similarity fit");
    }
    let scale = dist_dst / dist_src;

    // Bring the target to the source scale before the rotation fit.
    let dst_scaled: Vec<Vec3> = dst.iter().map(|p| p.coords / scale).collect();

    let n = src.len() as Real;
    let src_ctr: Vec3 = src.iter().map(|p| p.coords).sum::<Vec3>() / n;
    let dst_ctr: Vec3 = dst_scaled.iter().copied().sum::<Vec3>() / n;

    let mut cov = Mat3::zeros();
    for (s, d) in src.iter().zip(dst_scaled.iter()) {
        cov += (s.coords - src_ctr) * (d - dst_ctr).transpose();
    }

    let svd = SVD::new(cov, true, true);
    let u = svd
        .u
        .ok_or_else(|| anyhow::anyhow!("svd failed during similarity fit"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow::anyhow!("svd failed during similarity fit"))?;
    let v = v_t.transpose();

    let d = (v * u.transpose()).determinant();
    let mut flip = Matrix3::identity();
    if d < 0.0 {
        flip[(2, 2)] = -1.0;
    }
    let rot = v * flip * u.transpose();

    Ok(Affine3 {
        linear: rot * scale,
        translation: scale * (dst_ctr - rot * src_ctr),
    })
}

/// Apply a similarity `T(x) = s · R · x + t` to world-to-camera transforms.
///
/// Cameras map world points to camera points, so the world-side change of
/// coordinates composes on the right with `T⁻¹`:
/// `linear ← linear · (R/s)⁻¹`, then
/// `translation ← s · translation − linear · t`.
pub fn transform_cameras(t: &Affine3, world_to_cam: &mut [Iso3]) {
    let scale = t.uniform_scale();
    // The scale-free linear part is a rotation, so its inverse is the
    // transpose.
    let rot_inv = (t.linear / scale).transpose();

    for cam in world_to_cam.iter_mut() {
        let linear = cam.rotation.to_rotation_matrix().into_inner() * rot_inv;
        let translation = scale * cam.translation.vector - linear * t.translation;
        let rot = nalgebra::Rotation3::from_matrix(&linear);
        *cam = Iso3::from_parts(translation.into(), rot.into());
    }
}

/// Apply a similarity to world points.
pub fn transform_points(t: &Affine3, xyz: &mut [Pt3]) {
    for p in xyz.iter_mut() {
        *p = t.transform_point(p);
    }
}

/// Apply a similarity to rig extrinsics. Extrinsics relate sensor frames to
/// each other, so only their translations pick up the scale.
pub fn transform_rig(t: &Affine3, ref_to_sensor: &mut [Iso3]) {
    let scale = t.uniform_scale();
    for extr in ref_to_sensor.iter_mut() {
        extr.translation.vector *= scale;
    }
}

/// Apply a similarity to a depth-to-image transform: both the linear part
/// and the translation pick up the scale.
pub fn transform_depth_to_image(t: &Affine3, depth_to_image: &mut Affine3) {
    let scale = t.uniform_scale();
    depth_to_image.linear *= scale;
    depth_to_image.translation *= scale;
}
