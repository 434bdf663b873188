//! Registration: fit a similarity transform from triangulated control
//! points to measured world coordinates, then apply it everywhere at once.
//!
//! The transform touches the reference poses, the derived camera poses,
//! the triangulated points, the extrinsic translations, and the
//! depth-to-image transforms, in one place, so no stale copy survives.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Result};
use log::{info, warn};
use rig_core::{Affine3, Pt3, Real, Rig, Vec2, REF_SENSOR_ID};
use rig_io::{read_control_points, read_xyz_measurements};
use rig_linear::{
    fit_similarity, transform_cameras, transform_depth_to_image, transform_points, transform_rig,
    triangulate_pair,
};

use crate::ingest::SensorStreams;
use crate::refine::RefinerState;

/// Fit and apply the registration transform. Returns the fitted
/// similarity.
///
/// Control points live on reference-sensor images; controls whose images
/// are not part of the reference table are dropped with a warning. At
/// least 3 surviving controls are required.
pub fn apply_registration(
    hugin_file: &Path,
    xyz_file: &Path,
    rig: &mut Rig,
    streams: &SensorStreams,
    state: &mut RefinerState,
    xyz: &mut [Pt3],
) -> Result<Affine3> {
    let (images, controls) = read_control_points(hugin_file)?;
    let measured = read_xyz_measurements(xyz_file)?;

    if controls.len() != measured.len() {
        bail!(
            "could not parse an equal number of control points and xyz coordinates: {} vs {}",
            controls.len(),
            measured.len()
        );
    }

    // Resolve control images against the reference table.
    let mut image_to_ref: HashMap<usize, usize> = HashMap::new();
    for (idx, name) in images.iter().enumerate() {
        match streams.ref_index_for_image(Path::new(name)) {
            Some(r) => {
                image_to_ref.insert(idx, r);
            }
            None => warn!("will ignore image missing from the map: {}", name),
        }
    }

    // Triangulate each surviving control from its two observations.
    let ref_params = rig.intrinsics(REF_SENSOR_ID);
    let focal = ref_params.focal_length();

    let mut unregistered = Vec::new();
    let mut targets = Vec::new();
    for (control, target) in controls.iter().zip(measured.iter()) {
        let (Some(&r1), Some(&r2)) = (
            image_to_ref.get(&control.left_image),
            image_to_ref.get(&control.right_image),
        ) else {
            continue;
        };

        let undist_left = ref_params.undistort_pixel(&Vec2::new(
            control.left_pixel.x,
            control.left_pixel.y,
        ));
        let undist_right = ref_params.undistort_pixel(&Vec2::new(
            control.right_pixel.x,
            control.right_pixel.y,
        ));

        let point = triangulate_pair(
            focal,
            focal,
            &state.world_to_ref[r1],
            &state.world_to_ref[r2],
            &undist_left,
            &undist_right,
        )?;
        unregistered.push(point);
        targets.push(*target);
    }

    if unregistered.len() < 3 {
        bail!(
            "must have at least 3 points to apply registration, got {}",
            unregistered.len()
        );
    }

    let mean_err = |pts: &[Pt3]| -> Real {
        pts.iter()
            .zip(targets.iter())
            .map(|(a, b)| (a - b).norm())
            .sum::<Real>()
            / pts.len() as Real
    };
    info!(
        "mean absolute error before registration: {:.5} meters",
        mean_err(&unregistered)
    );

    let transform = fit_similarity(&unregistered, &targets)?;
    let scale = transform.uniform_scale();
    info!("registration resulted in a scale adjustment of: {:.5}", scale);

    let registered: Vec<Pt3> = unregistered
        .iter()
        .map(|p| transform.transform_point(p))
        .collect();
    info!(
        "mean absolute error after registration: {:.5} meters",
        mean_err(&registered)
    );

    // Apply everywhere, keeping every copy of the geometry in sync.
    transform_cameras(&transform, &mut state.world_to_ref);
    transform_cameras(&transform, &mut state.world_to_cam);
    transform_points(&transform, xyz);
    transform_rig(&transform, &mut state.extrinsics);
    for s in 0..rig.num_sensors() {
        let mut d2i = state.full_depth_to_image(s);
        transform_depth_to_image(&transform, &mut d2i);
        // Keep the separated scale; the whole adjustment lands in the
        // scale-free part's translation and the scale product.
        state.depth_to_image[s] = Affine3 {
            linear: d2i.linear / (state.depth_scales[s] * scale),
            translation: d2i.translation,
        };
        state.depth_scales[s] *= scale;

        rig.set_depth_to_image(s, d2i);
        rig.set_extrinsic(s, state.extrinsics[s]);
    }

    Ok(transform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::BracketOutput;
    use crate::ingest::{ImageRecord, SensorStreams};
    use crate::types::CameraImage;
    use image::GrayImage;
    use rig_core::{Distortion, ImageSize, Iso3, Sensor, SensorParams};
    use std::fs;
    use std::path::PathBuf;

    fn test_rig() -> Rig {
        let params = SensorParams::new(
            Vec2::new(600.0, 600.0),
            Vec2::new(320.0, 240.0),
            Distortion::None,
            ImageSize::new(640, 480),
            ImageSize::new(640, 480),
        )
        .unwrap();
        Rig::new(
            vec![Sensor {
                name: "nav_cam".into(),
                params,
                ref_to_sensor: Affine3::identity(),
                depth_to_image: Affine3 {
                    linear: rig_core::Mat3::identity() * 1.001,
                    translation: rig_core::Vec3::new(0.01, 0.0, 0.0),
                },
                timestamp_offset: 0.0,
            }],
            true,
        )
        .unwrap()
    }

    fn project(cam: &Iso3, p: &Pt3) -> Vec2 {
        let pc = cam.transform_point(p);
        Vec2::new(600.0 * pc.x / pc.z + 320.0, 600.0 * pc.y / pc.z + 240.0)
    }

    /// Ground truth is a world scaled 2x from the unregistered frame.
    #[test]
    fn doubling_registration_scales_all_translations() {
        let rig_model = test_rig();

        let pose0 = Iso3::identity();
        let pose1 = Iso3::translation(-0.4, 0.0, 0.0);

        // Control points in the unregistered world.
        let points = [
            Pt3::new(0.0, 0.0, 3.0),
            Pt3::new(0.5, 0.2, 3.5),
            Pt3::new(-0.4, 0.4, 2.5),
            Pt3::new(0.2, -0.3, 4.0),
        ];

        let records: Vec<ImageRecord> = [(0.0, pose0), (1.0, pose1)]
            .iter()
            .map(|(ts, pose)| ImageRecord {
                timestamp: *ts,
                path: PathBuf::from(format!("nav_cam/{ts}.jpg")),
                image: GrayImage::new(4, 4),
                world_to_cam: Affine3::from_iso(pose),
            })
            .collect();
        let streams = SensorStreams::from_records(1, vec![records], vec![Vec::new()]).unwrap();

        let cams: Vec<CameraImage> = [(0.0, 0usize), (1.0, 1usize)]
            .iter()
            .map(|&(ts, r)| CameraImage {
                sensor_id: 0,
                timestamp: ts,
                ref_timestamp: ts,
                beg_ref_index: r,
                end_ref_index: r,
                image: GrayImage::new(4, 4),
                image_path: PathBuf::from(format!("nav_cam/{ts}.jpg")),
                depth_cloud: None,
                depth_timestamp: None,
                depth_path: None,
            })
            .collect();

        let bracket = BracketOutput {
            cams: cams.clone(),
            min_timestamp_offset: vec![-1.0],
            max_timestamp_offset: vec![1.0],
        };
        let mut rig_model = rig_model;
        let mut state = RefinerState::new(&rig_model, &streams, &cams, &bracket).unwrap();

        // Hugin file with the two images and one control line per point.
        let dir = tempfile::tempdir().unwrap();
        let hugin = dir.path().join("reg.pto");
        let mut text = String::new();
        text.push_str("i w640 h480 f0 n\"nav_cam/0.jpg\"\n");
        text.push_str("i w640 h480 f0 n\"nav_cam/1.jpg\"\n");
        for p in &points {
            let l = project(&pose0, p);
            let r = project(&pose1, p);
            text.push_str(&format!(
                "c n0 N1 x{} y{} X{} Y{} t0\n",
                l.x, l.y, r.x, r.y
            ));
        }
        fs::write(&hugin, text).unwrap();

        // Measured coordinates: the same points, scaled 2x.
        let xyz_path = dir.path().join("points.xyz");
        let mut text = String::new();
        for p in &points {
            text.push_str(&format!("{} {} {}\n", 2.0 * p.x, 2.0 * p.y, 2.0 * p.z));
        }
        fs::write(&xyz_path, text).unwrap();

        let d2i_before = rig_model.depth_to_image(0).translation;
        let mut xyz = points.to_vec();
        let transform = apply_registration(
            &hugin,
            &xyz_path,
            &mut rig_model,
            &streams,
            &mut state,
            &mut xyz,
        )
        .unwrap();

        assert!((transform.uniform_scale() - 2.0).abs() < 1e-9);

        // Depth-to-image translation doubles.
        let d2i_after = rig_model.depth_to_image(0).translation;
        assert!((d2i_after - 2.0 * d2i_before).norm() < 1e-9);
        // The depth-to-image linear part doubles too.
        assert!(
            (rig_model.depth_to_image(0).uniform_scale() - 2.0 * 1.001).abs() < 1e-9
        );

        // Points moved to the measured frame.
        for (p, orig) in xyz.iter().zip(points.iter()) {
            assert!((p.coords - 2.0 * orig.coords).norm() < 1e-8);
        }

        // Camera translations doubled (identity rotation here).
        assert!(
            (state.world_to_ref[1].translation.vector.x - 2.0 * (-0.4)).abs() < 1e-8
        );
    }

    #[test]
    fn too_few_controls_fail() {
        let dir = tempfile::tempdir().unwrap();
        let hugin = dir.path().join("reg.pto");
        fs::write(
            &hugin,
            "i w640 h480 f0 n\"nav_cam/0.jpg\"\n\
             i w640 h480 f0 n\"nav_cam/1.jpg\"\n\
             c n0 N1 x320 y240 X320 Y240 t0\n",
        )
        .unwrap();
        let xyz_path = dir.path().join("points.xyz");
        fs::write(&xyz_path, "1 2 3\n").unwrap();

        let mut rig_model = test_rig();
        let records: Vec<ImageRecord> = vec![ImageRecord {
            timestamp: 0.0,
            path: PathBuf::from("nav_cam/0.jpg"),
            image: GrayImage::new(4, 4),
            world_to_cam: Affine3::identity(),
        }];
        let streams = SensorStreams::from_records(1, vec![records], vec![Vec::new()]).unwrap();
        let cams: Vec<CameraImage> = Vec::new();
        let bracket = BracketOutput {
            cams: Vec::new(),
            min_timestamp_offset: vec![0.0],
            max_timestamp_offset: vec![0.0],
        };
        let mut state = RefinerState::new(&rig_model, &streams, &cams, &bracket).unwrap();
        let mut xyz = Vec::new();

        let res = apply_registration(
            &hugin,
            &xyz_path,
            &mut rig_model,
            &streams,
            &mut state,
            &mut xyz,
        );
        assert!(res.is_err());
    }
}
