//! The outlier gates: boundary exclusion before the first pass,
//! triangulation-angle and reprojection checks after each solve.

use log::info;
use rig_core::{Iso3, Pt3, Real, Rig, Vec2, REF_SENSOR_ID};
use rig_features::Track;

use crate::triangulate::InlierMask;
use crate::types::CameraImage;

/// Flag reference-sensor features within `margin` pixels of the distorted
/// image border. Runs once, before any optimization.
pub fn flag_outliers_by_exclusion(
    rig: &Rig,
    cams: &[CameraImage],
    tracks: &[Track],
    keypoints: &[Vec<(f32, f32)>],
    margin: u32,
    inliers: &mut InlierMask,
) {
    if margin == 0 {
        return;
    }
    let margin = margin as Real;

    let mut flagged = 0usize;
    for (pid, track) in tracks.iter().enumerate() {
        for (&cid, &fid) in track {
            if cams[cid].sensor_id != REF_SENSOR_ID {
                continue;
            }
            let size = rig.intrinsics(REF_SENSOR_ID).distorted_size();
            let (x, y) = keypoints[cid][fid];
            let (x, y) = (x as Real, y as Real);
            if x < margin
                || x > size.width as Real - 1.0 - margin
                || y < margin
                || y > size.height as Real - 1.0 - margin
            {
                inliers.mark_outlier(pid, cid);
                flagged += 1;
            }
        }
    }
    info!("flagged {} features near the image boundary", flagged);
}

/// Flag outliers after a solve: first whole tracks whose rays converge at
/// too shallow an angle, then individual features whose reprojection
/// residual is too large.
///
/// The angle gate must run first; rays it discards would otherwise bias
/// the reprojection threshold.
#[allow(clippy::too_many_arguments)]
pub fn flag_outliers_by_angle_and_reproj(
    rig: &Rig,
    cams: &[CameraImage],
    world_to_cam: &[Iso3],
    tracks: &[Track],
    keypoints: &[Vec<(f32, f32)>],
    xyz: &[Pt3],
    min_angle_deg: Real,
    max_reprojection_error: Real,
    inliers: &mut InlierMask,
) {
    // Gate 1: triangulation angle.
    let mut num_outliers_by_angle = 0usize;
    let mut num_total = 0usize;
    for (pid, track) in tracks.iter().enumerate() {
        let mut max_angle: Real = 0.0;

        let members: Vec<usize> = track
            .keys()
            .copied()
            .filter(|&cid| inliers.is_inlier(pid, cid))
            .collect();
        num_total += members.len();

        for (i, &cid1) in members.iter().enumerate() {
            let ctr1 = world_to_cam[cid1].inverse() * Pt3::origin();
            let ray1 = (xyz[pid] - ctr1).normalize();
            for &cid2 in &members[i + 1..] {
                let ctr2 = world_to_cam[cid2].inverse() * Pt3::origin();
                let ray2 = (xyz[pid] - ctr2).normalize();
                let angle = ray1.dot(&ray2).clamp(-1.0, 1.0).acos().to_degrees();
                if angle.is_finite() {
                    max_angle = max_angle.max(angle);
                }
            }
        }

        if max_angle >= min_angle_deg {
            continue; // well conditioned track
        }
        for &cid in &members {
            inliers.mark_outlier(pid, cid);
            num_outliers_by_angle += 1;
        }
    }
    info!(
        "removed {} outlier features with small angle of convergence, out of {}",
        num_outliers_by_angle, num_total
    );

    // Gate 2: reprojection error with the post-solve cameras.
    let mut num_outliers_reproj = 0usize;
    let mut num_total = 0usize;
    for (pid, track) in tracks.iter().enumerate() {
        for (&cid, &fid) in track {
            if !inliers.is_inlier(pid, cid) {
                continue;
            }
            num_total += 1;

            let params = rig.intrinsics(cams[cid].sensor_id);
            let observed = keypoints[cid][fid];
            let observed = Vec2::new(observed.0 as Real, observed.1 as Real);

            let pc = world_to_cam[cid].transform_point(&xyz[pid]);
            // Points behind the camera and non-finite residuals can never
            // pass the threshold.
            let is_good = match params.project(&pc.coords) {
                Some(predicted) => (predicted - observed).norm() <= max_reprojection_error,
                None => false,
            };
            if !is_good {
                inliers.mark_outlier(pid, cid);
                num_outliers_reproj += 1;
            }
        }
    }
    info!(
        "removed {} outlier features using reprojection error, out of {}",
        num_outliers_reproj, num_total
    );
}
