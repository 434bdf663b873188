//! Linear triangulation of 3D points from multiple views.
//!
//! Rays emanate from undistorted, centered pixels: the projection matrix of
//! a view is `diag(f, f, 1) · [R | t]` with `[R | t]` the world-to-camera
//! transform. Distortion must be removed by the caller.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, Matrix3, Matrix3x4};
use rig_core::{Iso3, Pt3, Real, Vec2};

/// 3×4 projection matrix.
pub type Mat34 = Matrix3x4<Real>;

/// Build the projection matrix `diag(f, f, 1) · [R | t]`.
pub fn projection_matrix(focal_length: Real, world_to_cam: &Iso3) -> Mat34 {
    let k = Matrix3::new(focal_length, 0.0, 0.0, 0.0, focal_length, 0.0, 0.0, 0.0, 1.0);
    let r = world_to_cam.rotation.to_rotation_matrix();
    let t = world_to_cam.translation.vector;
    let mut rt = Mat34::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(r.matrix());
    rt.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
    k * rt
}

/// Triangulate one point from N ≥ 2 views by DLT.
///
/// `focal_lengths`, `world_to_cam`, and `pixels` (undistorted, centered)
/// run in parallel. Fails on fewer than two rays or a degenerate solution.
pub fn triangulate_nview(
    focal_lengths: &[Real],
    world_to_cam: &[Iso3],
    pixels: &[Vec2],
) -> Result<Pt3> {
    if focal_lengths.len() != world_to_cam.len() || focal_lengths.len() != pixels.len() {
        bail!(
            "mismatched triangulation inputs: {} focals, {} cameras, {} pixels",
            focal_lengths.len(),
            world_to_cam.len(),
            pixels.len()
        );
    }
    if world_to_cam.len() < 2 {
        bail!("need at least 2 rays to triangulate, got {}", world_to_cam.len());
    }

    let mut a = DMatrix::<Real>::zeros(2 * pixels.len(), 4);
    for (i, ((pix, cam), f)) in pixels
        .iter()
        .zip(world_to_cam.iter())
        .zip(focal_lengths.iter())
        .enumerate()
    {
        let p = projection_matrix(*f, cam);
        let row0 = p.row(0);
        let row1 = p.row(1);
        let row2 = p.row(2);
        a.row_mut(2 * i).copy_from(&(pix.x * row2 - row0));
        a.row_mut(2 * i + 1).copy_from(&(pix.y * row2 - row1));
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow::anyhow!("svd failed during triangulation"))?;
    let x_h = v_t.row(v_t.nrows() - 1);

    let w = x_h[3];
    if w.abs() <= Real::EPSILON {
        bail!("triangulation produced a point at infinity");
    }

    Ok(Pt3::new(x_h[0] / w, x_h[1] / w, x_h[2] / w))
}

/// Two-view specialization used by the matching pre-filter.
pub fn triangulate_pair(
    focal1: Real,
    focal2: Real,
    world_to_cam1: &Iso3,
    world_to_cam2: &Iso3,
    pix1: &Vec2,
    pix2: &Vec2,
) -> Result<Pt3> {
    triangulate_nview(
        &[focal1, focal2],
        &[*world_to_cam1, *world_to_cam2],
        &[*pix1, *pix2],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn project(f: Real, cam: &Iso3, p: &Pt3) -> Vec2 {
        let pc = cam.transform_point(p);
        Vec2::new(f * pc.x / pc.z, f * pc.y / pc.z)
    }

    #[test]
    fn two_view_recovers_point_with_identity_intrinsics() {
        // Left camera at the origin, right camera at (1, 0, 0), f = 1.
        let cam1 = Iso3::identity();
        let cam2 = Iso3::translation(-1.0, 0.0, 0.0);

        let pw = Pt3::new(1.0, 1.0, 10.0);
        let p1 = project(1.0, &cam1, &pw);
        let p2 = project(1.0, &cam2, &pw);

        let est = triangulate_pair(1.0, 1.0, &cam1, &cam2, &p1, &p2).unwrap();
        assert!((est - pw).norm() < 1e-6, "error: {}", (est - pw).norm());
    }

    #[test]
    fn nview_beats_noise_free_two_view_setup() {
        let f = 500.0;
        let pw = Pt3::new(0.3, -0.2, 4.0);
        let cams: Vec<Iso3> = (0..4)
            .map(|i| Iso3::translation(-0.3 * i as Real, 0.05 * i as Real, 0.0))
            .collect();
        let pixels: Vec<Vec2> = cams.iter().map(|c| project(f, c, &pw)).collect();
        let focals = vec![f; cams.len()];

        let est = triangulate_nview(&focals, &cams, &pixels).unwrap();
        assert!((est - pw).norm() < 1e-8);
    }

    #[test]
    fn single_ray_fails() {
        let res = triangulate_nview(&[1.0], &[Iso3::identity()], &[Vec2::zeros()]);
        assert!(res.is_err());
    }

    #[test]
    fn mismatched_inputs_fail() {
        let res = triangulate_nview(
            &[1.0, 1.0],
            &[Iso3::identity()],
            &[Vec2::zeros(), Vec2::zeros()],
        );
        assert!(res.is_err());
    }
}
