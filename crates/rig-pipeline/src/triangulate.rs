//! Per-pass triangulation of all tracks and mesh intersections.

use std::collections::BTreeMap;

use log::info;
use rig_core::{Iso3, Pt3, Real, Rig, Vec2, Vec3};
use rig_features::Track;
use rig_linear::triangulate_nview;

use crate::mesh::MeshOracle;
use crate::types::CameraImage;

/// The per-feature inlier flags: `pid → cid → flag`. Within a track a cid
/// maps to exactly one fid, so the cid identifies the feature.
///
/// Once lowered, a flag never rises again within a run.
#[derive(Debug, Clone)]
pub struct InlierMask {
    flags: Vec<BTreeMap<usize, bool>>,
}

impl InlierMask {
    /// All features start as inliers.
    pub fn new(tracks: &[Track]) -> Self {
        let flags = tracks
            .iter()
            .map(|t| t.keys().map(|&cid| (cid, true)).collect())
            .collect();
        Self { flags }
    }

    pub fn is_inlier(&self, pid: usize, cid: usize) -> bool {
        *self.flags[pid]
            .get(&cid)
            .expect("inlier flag queried for a feature outside its track")
    }

    /// Lower one feature's flag. There is no way back up.
    pub fn mark_outlier(&mut self, pid: usize, cid: usize) {
        let flag = self.flags[pid]
            .get_mut(&cid)
            .expect("inlier flag set for a feature outside its track");
        *flag = false;
    }

    /// Lower every feature of a track.
    pub fn mark_track_outlier(&mut self, pid: usize) {
        for flag in self.flags[pid].values_mut() {
            *flag = false;
        }
    }

    pub fn num_inliers(&self) -> usize {
        self.flags
            .iter()
            .map(|t| t.values().filter(|&&v| v).count())
            .sum()
    }

    /// Inlier observation count of one track.
    pub fn track_inliers(&self, pid: usize) -> usize {
        self.flags[pid].values().filter(|&&v| v).count()
    }
}

/// Triangulate every track from its current inlier observations.
///
/// Tracks left with fewer than two usable rays, or triangulating to a
/// non-finite point, are flagged outlier whole; their entry in the output
/// is a placeholder the assembler will not reference.
pub fn triangulate_tracks(
    rig: &Rig,
    cams: &[CameraImage],
    world_to_cam: &[Iso3],
    tracks: &[Track],
    keypoints: &[Vec<(f32, f32)>],
    inliers: &mut InlierMask,
) -> Vec<Pt3> {
    let mut xyz = Vec::with_capacity(tracks.len());

    for (pid, track) in tracks.iter().enumerate() {
        let mut focals = Vec::new();
        let mut poses = Vec::new();
        let mut pixels = Vec::new();

        for (&cid, &fid) in track {
            if !inliers.is_inlier(pid, cid) {
                continue;
            }
            let params = rig.intrinsics(cams[cid].sensor_id);
            let (x, y) = keypoints[cid][fid];
            let undist = params.undistort_pixel(&Vec2::new(x as Real, y as Real));
            focals.push(params.focal_length());
            poses.push(world_to_cam[cid]);
            pixels.push(undist);
        }

        if pixels.len() < 2 {
            inliers.mark_track_outlier(pid);
            xyz.push(Pt3::origin());
            continue;
        }

        match triangulate_nview(&focals, &poses, &pixels) {
            Ok(p) if p.coords.iter().all(|v| v.is_finite()) => xyz.push(p),
            _ => {
                inliers.mark_track_outlier(pid);
                xyz.push(Pt3::origin());
            }
        }
    }

    xyz
}

/// Per-feature and per-track mesh intersections.
///
/// For each inlier feature the pixel is back-projected and intersected
/// with the mesh; a track's target is the average of its features' hits.
#[allow(clippy::too_many_arguments)]
pub fn mesh_intersections(
    rig: &Rig,
    cams: &[CameraImage],
    world_to_cam: &[Iso3],
    tracks: &[Track],
    keypoints: &[Vec<(f32, f32)>],
    inliers: &InlierMask,
    oracle: &dyn MeshOracle,
    min_ray_dist: Real,
    max_ray_dist: Real,
) -> (Vec<BTreeMap<usize, Pt3>>, Vec<Option<Pt3>>) {
    let mut per_feature: Vec<BTreeMap<usize, Pt3>> = vec![BTreeMap::new(); tracks.len()];
    let mut per_track: Vec<Option<Pt3>> = vec![None; tracks.len()];

    let mut num_hits = 0usize;
    for (pid, track) in tracks.iter().enumerate() {
        let mut sum = Vec3::zeros();
        let mut count = 0usize;

        for (&cid, &fid) in track {
            if !inliers.is_inlier(pid, cid) {
                continue;
            }

            let params = rig.intrinsics(cams[cid].sensor_id);
            let (x, y) = keypoints[cid][fid];
            let dir_cam = params.backproject(&Vec2::new(x as Real, y as Real));

            let cam_to_world = world_to_cam[cid].inverse();
            let origin = cam_to_world.transform_point(&Pt3::origin());
            let dir_world = cam_to_world.rotation.transform_vector(&dir_cam);

            if let Some(hit) = oracle.intersect_ray(&origin, &dir_world, min_ray_dist, max_ray_dist)
            {
                per_feature[pid].insert(cid, hit);
                sum += hit.coords;
                count += 1;
                num_hits += 1;
            }
        }

        if count >= 1 {
            per_track[pid] = Some(Pt3::from(sum / count as Real));
        }
    }

    info!("mesh intersections: {} feature hits", num_hits);
    (per_feature, per_track)
}
