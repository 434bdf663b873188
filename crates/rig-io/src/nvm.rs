//! Theia-compatible NVM files (`NVM_V3`).
//!
//! Only camera poses, keypoints, and tracks are exchanged through this
//! format; focal lengths are informational and distortion is written as
//! zero. Keypoints are stored as they come: the Theia optical-center shift
//! is applied by the caller before writing and undone after reading.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;
use nalgebra::{Quaternion, UnitQuaternion};
use rig_core::{fmt_real, Iso3, Pt3, Real, Vec2};

use crate::error::IoError;

/// In-memory contents of an NVM file.
#[derive(Debug, Clone, Default)]
pub struct NvmData {
    pub camera_paths: Vec<String>,
    pub focal_lengths: Vec<Real>,
    pub world_to_cam: Vec<Iso3>,
    /// Per camera, the keypoint table referenced by the tracks.
    pub keypoints: Vec<Vec<Vec2>>,
    /// Per track, `cid -> fid`.
    pub tracks: Vec<BTreeMap<usize, usize>>,
    pub points: Vec<Pt3>,
}

fn next_token(it: &mut std::vec::IntoIter<String>, path: &Path) -> Result<String, IoError> {
    it.next()
        .ok_or_else(|| IoError::Format(format!("truncated NVM file: {}", path.display())))
}

fn next_num<T: std::str::FromStr>(
    it: &mut std::vec::IntoIter<String>,
    path: &Path,
) -> Result<T, IoError> {
    next_token(it, path)?
        .parse::<T>()
        .map_err(|_| IoError::Format(format!("bad number in {}", path.display())))
}

/// Read an NVM file.
pub fn read_nvm(path: &Path) -> Result<NvmData> {
    info!("reading nvm file: {}", path.display());
    let file = fs::File::open(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;
    let reader = BufReader::new(file);

    // Tokenize the whole file after the header line; the format is
    // whitespace-separated throughout.
    let mut lines = reader.lines();
    let header = lines
        .next()
        .transpose()?
        .unwrap_or_default();
    if !header.starts_with("NVM_V3") {
        bail!(IoError::Format(format!(
            "{} does not start with the NVM_V3 token",
            path.display()
        )));
    }

    let mut tokens: Vec<String> = Vec::new();
    for line in lines {
        let line = line?;
        tokens.extend(line.split_whitespace().map(|t| t.to_string()));
    }
    let mut it = tokens.into_iter();

    let num_cams: usize = next_num(&mut it, path)?;
    if num_cams < 1 {
        bail!(IoError::Format(format!(
            "NVM file {} is missing cameras",
            path.display()
        )));
    }

    let mut data = NvmData::default();
    for _ in 0..num_cams {
        let name = next_token(&mut it, path)?;
        let focal: Real = next_num(&mut it, path)?;
        let qw: Real = next_num(&mut it, path)?;
        let qx: Real = next_num(&mut it, path)?;
        let qy: Real = next_num(&mut it, path)?;
        let qz: Real = next_num(&mut it, path)?;
        let cx: Real = next_num(&mut it, path)?;
        let cy: Real = next_num(&mut it, path)?;
        let cz: Real = next_num(&mut it, path)?;
        let _d1: Real = next_num(&mut it, path)?;
        let _d2: Real = next_num(&mut it, path)?;

        let rot = UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz));
        let center = nalgebra::Vector3::new(cx, cy, cz);
        let translation = -(rot * center);

        data.camera_paths.push(name);
        data.focal_lengths.push(focal);
        data.world_to_cam
            .push(Iso3::from_parts(translation.into(), rot));
        data.keypoints.push(Vec::new());
    }

    let num_points: usize = next_num(&mut it, path)?;
    if num_points < 1 {
        bail!(IoError::Format(format!(
            "NVM file {} has no triangulated points",
            path.display()
        )));
    }

    for pid in 0..num_points {
        let x: Real = next_num(&mut it, path)?;
        let y: Real = next_num(&mut it, path)?;
        let z: Real = next_num(&mut it, path)?;
        let _r: Real = next_num(&mut it, path)?;
        let _g: Real = next_num(&mut it, path)?;
        let _b: Real = next_num(&mut it, path)?;
        let num_measures: usize = next_num(&mut it, path)?;

        let mut track = BTreeMap::new();
        for _ in 0..num_measures {
            let cid: usize = next_num(&mut it, path)?;
            let fid: usize = next_num(&mut it, path)?;
            let px: Real = next_num(&mut it, path)?;
            let py: Real = next_num(&mut it, path)?;
            if cid >= data.keypoints.len() {
                bail!(IoError::Format(format!(
                    "track {} references missing camera {}",
                    pid, cid
                )));
            }
            let keypoints = &mut data.keypoints[cid];
            if keypoints.len() <= fid {
                keypoints.resize(fid + 1, Vec2::zeros());
            }
            keypoints[fid] = Vec2::new(px, py);
            track.insert(cid, fid);
        }

        data.points.push(Pt3::new(x, y, z));
        data.tracks.push(track);
    }

    Ok(data)
}

/// Write an NVM file.
pub fn write_nvm(path: &Path, data: &NvmData) -> Result<()> {
    let n = data.camera_paths.len();
    if data.world_to_cam.len() != n || data.focal_lengths.len() != n || data.keypoints.len() != n {
        bail!(IoError::Format(
            "inconsistent NVM camera table sizes".to_string()
        ));
    }
    if data.tracks.len() != data.points.len() {
        bail!(IoError::Format(format!(
            "expecting as many tracks as points, got {} vs {}",
            data.tracks.len(),
            data.points.len()
        )));
    }

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    info!("writing nvm file: {}", path.display());
    let mut f = fs::File::create(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;

    writeln!(f, "NVM_V3")?;
    writeln!(f, "{}", n)?;
    for cid in 0..n {
        let pose = &data.world_to_cam[cid];
        let q = pose.rotation.quaternion();
        // Camera center in world coordinates.
        let center = -(pose.rotation.inverse() * pose.translation.vector);
        writeln!(
            f,
            "{} {} {} {} {} {} {} {} {} 0 0",
            data.camera_paths[cid],
            fmt_real(data.focal_lengths[cid]),
            fmt_real(q.w),
            fmt_real(q.i),
            fmt_real(q.j),
            fmt_real(q.k),
            fmt_real(center.x),
            fmt_real(center.y),
            fmt_real(center.z),
        )?;
    }

    writeln!(f, "{}", data.points.len())?;
    for (pid, track) in data.tracks.iter().enumerate() {
        if track.len() < 2 {
            bail!(IoError::Format(format!(
                "track {} has {} measurements; at least 2 are required",
                pid,
                track.len()
            )));
        }
        let p = &data.points[pid];
        write!(
            f,
            "{} {} {} 0 0 0 {}",
            fmt_real(p.x),
            fmt_real(p.y),
            fmt_real(p.z),
            track.len()
        )?;
        for (&cid, &fid) in track {
            let kp = data.keypoints[cid][fid];
            write!(f, " {} {} {} {}", cid, fid, fmt_real(kp.x), fmt_real(kp.y))?;
        }
        writeln!(f)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn sample() -> NvmData {
        let rot1 = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.3);
        let rot2 = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -0.2);
        let mut keypoints = vec![Vec::new(), Vec::new()];
        keypoints[0] = vec![Vec2::new(10.25, -3.5), Vec2::new(100.0, 42.0)];
        keypoints[1] = vec![Vec2::new(-7.75, 8.125), Vec2::new(55.5, 66.25)];

        let mut t1 = BTreeMap::new();
        t1.insert(0, 0);
        t1.insert(1, 0);
        let mut t2 = BTreeMap::new();
        t2.insert(0, 1);
        t2.insert(1, 1);

        NvmData {
            camera_paths: vec!["nav_cam/10.5.jpg".into(), "nav_cam/11.5.jpg".into()],
            focal_lengths: vec![621.0, 621.0],
            world_to_cam: vec![
                Iso3::from_parts(Vector3::new(0.1, 0.2, 0.3).into(), rot1),
                Iso3::from_parts(Vector3::new(-0.4, 0.0, 1.0).into(), rot2),
            ],
            keypoints,
            tracks: vec![t1, t2],
            points: vec![Pt3::new(1.0, 2.0, 3.0), Pt3::new(-1.0, 0.5, 4.0)],
        }
    }

    #[test]
    fn round_trips_paths_poses_and_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameras.nvm");
        let data = sample();
        write_nvm(&path, &data).unwrap();
        let back = read_nvm(&path).unwrap();

        assert_eq!(back.camera_paths, data.camera_paths);
        assert_eq!(back.tracks, data.tracks);
        for (a, b) in back.world_to_cam.iter().zip(data.world_to_cam.iter()) {
            let d = (a.to_homogeneous() - b.to_homogeneous()).norm();
            assert!(d < 1e-10, "pose differs by {}", d);
        }
        for (a, b) in back.points.iter().zip(data.points.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
        for (ka, kb) in back.keypoints.iter().zip(data.keypoints.iter()) {
            for (a, b) in ka.iter().zip(kb.iter()) {
                assert!((a - b).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn missing_header_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameras.nvm");
        fs::write(&path, "NOT_NVM\n").unwrap();
        assert!(read_nvm(&path).is_err());
    }

    #[test]
    fn single_observation_track_rejected_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameras.nvm");
        let mut data = sample();
        data.tracks[0] = BTreeMap::from([(0, 0)]);
        assert!(write_nvm(&path, &data).is_err());
    }

    #[test]
    fn truncated_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameras.nvm");
        fs::write(&path, "NVM_V3\n2\nonly_one_camera 600 1 0 0 0 0 0 0 0 0\n").unwrap();
        assert!(read_nvm(&path).is_err());
    }
}
