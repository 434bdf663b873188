//! Writers for the run outputs: the NVM map, the image list, match files,
//! and optionally the bracketed images and depth clouds themselves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use rig_core::{Iso3, Pt3, Real, Rig, Vec2};
use rig_features::Track;
use rig_io::{
    match_file_name, write_depth_cloud, write_image_list, write_match_file, write_nvm,
    ImageListEntry, IpRecord, NvmData,
};

use crate::triangulate::InlierMask;
use crate::types::CameraImage;

/// File name of an observation under the output directory:
/// `<out_dir>/<sensor_name>/<timestamp>.<ext>`, with the timestamp printed
/// the same way everywhere.
pub fn observation_file_name(
    out_dir: &Path,
    sensor_name: &str,
    timestamp: Real,
    ext: &str,
) -> PathBuf {
    out_dir.join(sensor_name).join(format!("{timestamp:.7}.{ext}"))
}

/// Write the refined map in NVM form: inlier features only, pixels shifted
/// by each sensor's optical center (the Theia convention).
#[allow(clippy::too_many_arguments)]
pub fn save_nvm(
    path: &Path,
    rig: &Rig,
    cams: &[CameraImage],
    world_to_cam: &[Iso3],
    keypoints: &[Vec<(f32, f32)>],
    tracks: &[Track],
    inliers: &InlierMask,
    xyz: &[Pt3],
) -> Result<()> {
    let mut data = NvmData {
        camera_paths: cams
            .iter()
            .map(|c| c.image_path.display().to_string())
            .collect(),
        focal_lengths: cams
            .iter()
            .map(|c| rig.intrinsics(c.sensor_id).focal_length())
            .collect(),
        world_to_cam: world_to_cam.to_vec(),
        keypoints: vec![Vec::new(); cams.len()],
        tracks: Vec::new(),
        points: Vec::new(),
    };

    // Compact per-camera keypoint tables holding only what the surviving
    // tracks reference.
    let mut fid_count = vec![0usize; cams.len()];
    for (pid, track) in tracks.iter().enumerate() {
        let mut nvm_track = BTreeMap::new();
        for (&cid, &fid) in track {
            if !inliers.is_inlier(pid, cid) {
                continue;
            }
            let (x, y) = keypoints[cid][fid];
            let offset = rig.intrinsics(cams[cid].sensor_id).optical_center();
            let shifted = Vec2::new(x as Real - offset.x, y as Real - offset.y);

            data.keypoints[cid].push(shifted);
            nvm_track.insert(cid, fid_count[cid]);
            fid_count[cid] += 1;
        }

        if nvm_track.len() >= 2 {
            data.tracks.push(nvm_track);
            data.points.push(xyz[pid]);
        }
    }

    write_nvm(path, &data)
}

/// Save raw pairwise matches as produced by the feature graph.
pub fn save_match_pairs(
    out_dir: &Path,
    cams: &[CameraImage],
    pairs: &BTreeMap<(usize, usize), Vec<(Vec2, Vec2)>>,
) -> Result<()> {
    let match_dir = out_dir.join("matches");
    for ((cid1, cid2), matched) in pairs {
        let left: Vec<IpRecord> = matched
            .iter()
            .map(|(l, _)| IpRecord::from_pixel(l.x as f32, l.y as f32))
            .collect();
        let right: Vec<IpRecord> = matched
            .iter()
            .map(|(_, r)| IpRecord::from_pixel(r.x as f32, r.y as f32))
            .collect();
        let file = match_file_name(
            &match_dir,
            &cams[*cid1].image_path,
            &cams[*cid2].image_path,
            "",
        )?;
        info!("writing: {}", file.display());
        write_match_file(&file, &left, &right)?;
    }
    Ok(())
}

/// Save the per-pair inlier matches that survive in the tracks.
pub fn save_inlier_match_pairs(
    out_dir: &Path,
    num_overlaps: usize,
    cams: &[CameraImage],
    keypoints: &[Vec<(f32, f32)>],
    tracks: &[Track],
    inliers: &InlierMask,
) -> Result<()> {
    let mut matches: BTreeMap<(usize, usize), (Vec<IpRecord>, Vec<IpRecord>)> = BTreeMap::new();

    for (pid, track) in tracks.iter().enumerate() {
        for (&cid1, &fid1) in track {
            for (&cid2, &fid2) in track {
                let is_pair = cid1 < cid2 && cid2 < cid1 + num_overlaps + 1;
                if !is_pair || !inliers.is_inlier(pid, cid1) || !inliers.is_inlier(pid, cid2) {
                    continue;
                }
                let (x1, y1) = keypoints[cid1][fid1];
                let (x2, y2) = keypoints[cid2][fid2];
                let entry = matches.entry((cid1, cid2)).or_default();
                entry.0.push(IpRecord::from_pixel(x1, y1));
                entry.1.push(IpRecord::from_pixel(x2, y2));
            }
        }
    }

    let match_dir = out_dir.join("matches");
    for ((cid1, cid2), (left, right)) in &matches {
        let file = match_file_name(
            &match_dir,
            &cams[*cid1].image_path,
            &cams[*cid2].image_path,
            "-inliers",
        )?;
        info!("writing: {}", file.display());
        write_match_file(&file, left, right)?;
    }
    Ok(())
}

/// Write the final image list with the refined world-to-camera transforms.
pub fn save_image_list(
    out_dir: &Path,
    cams: &[CameraImage],
    world_to_cam: &[Iso3],
) -> Result<()> {
    let entries: Vec<ImageListEntry> = cams
        .iter()
        .zip(world_to_cam.iter())
        .map(|(cam, pose)| ImageListEntry {
            image_path: cam.image_path.clone(),
            sensor_id: cam.sensor_id,
            timestamp: cam.timestamp,
            depth_path: cam.depth_path.clone(),
            world_to_cam: rig_core::Affine3::from_iso(pose),
        })
        .collect();
    write_image_list(&out_dir.join("images.txt"), &entries)
}

/// Save the bracketed images and their depth clouds under the output
/// directory, named by sensor and timestamp.
pub fn save_images_and_depth_clouds(out_dir: &Path, rig: &Rig, cams: &[CameraImage]) -> Result<()> {
    for cam in cams {
        let name = &rig.sensor(cam.sensor_id).name;
        let image_file = observation_file_name(out_dir, name, cam.timestamp, "jpg");
        if let Some(dir) = image_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        info!("writing: {}", image_file.display());
        cam.image
            .save(&image_file)
            .with_context(|| format!("cannot write {}", image_file.display()))?;

        if let Some(cloud) = &cam.depth_cloud {
            let depth_file = observation_file_name(out_dir, name, cam.timestamp, "pc");
            info!("writing: {}", depth_file.display());
            write_depth_cloud(&depth_file, cloud)?;
        }
    }
    Ok(())
}
