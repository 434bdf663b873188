//! The pass controller: triangulate → mesh → assemble → solve → copy
//! back → re-flag, `refiner_num_passes` times.

use std::collections::HashMap;

use anyhow::{Context, Result};
use log::info;
use nalgebra::DVector;
use rig_core::{Affine3, Distortion, Iso3, Pt3, Real, Rig, SensorParams, Vec2, REF_SENSOR_ID};
use rig_features::Track;
use rig_optim::{dvec_to_affine, dvec_to_iso3, BackendSolveOptions, LinearSolverKind};

use crate::assemble::{assemble_problem, eval_residuals, names, AssembleInput, ResidualTag};
use crate::bracket::{calc_world_to_cam, initial_world_to_cam, BracketOutput};
use crate::config::RefinerConfig;
use crate::ingest::SensorStreams;
use crate::mesh::MeshOracle;
use crate::outliers::{flag_outliers_by_angle_and_reproj, flag_outliers_by_exclusion};
use crate::triangulate::{mesh_intersections, triangulate_tracks, InlierMask};
use crate::types::CameraImage;

/// The mutable optimization state, mirroring the parameter blocks.
///
/// `world_to_ref` and `world_to_cam` must stay in sync at all times; every
/// solve is followed by a copy-back and a world-to-cam update before
/// anything reads them.
#[derive(Debug, Clone)]
pub struct RefinerState {
    pub world_to_ref: Vec<Iso3>,
    pub ref_timestamps: Vec<Real>,
    /// Per observation. Derived by interpolation in rig mode; independent
    /// parameters with `no_extrinsics`.
    pub world_to_cam: Vec<Iso3>,
    pub extrinsics: Vec<Iso3>,
    pub offsets: Vec<Real>,
    pub focals: Vec<Real>,
    pub centers: Vec<Vec2>,
    pub distortions: Vec<Distortion>,
    /// Depth-to-image with the uniform scale divided out.
    pub depth_to_image: Vec<Affine3>,
    /// The separated cube-root scales.
    pub depth_scales: Vec<Real>,
    pub min_timestamp_offset: Vec<Real>,
    pub max_timestamp_offset: Vec<Real>,
}

impl RefinerState {
    pub fn new(
        rig: &Rig,
        streams: &SensorStreams,
        cams: &[CameraImage],
        bracket: &BracketOutput,
    ) -> Result<Self> {
        let n = rig.num_sensors();

        let mut depth_to_image = Vec::with_capacity(n);
        let mut depth_scales = Vec::with_capacity(n);
        for s in 0..n {
            let full = rig.depth_to_image(s);
            let scale = full.uniform_scale();
            depth_to_image.push(Affine3 {
                linear: full.linear / scale,
                translation: full.translation,
            });
            depth_scales.push(scale);
        }

        let world_to_cam = initial_world_to_cam(rig, streams, cams)?;

        // With no usable config extrinsics, bootstrap them from the
        // image-list poses.
        let extrinsics = if rig.have_rig_transforms() {
            (0..n).map(|s| rig.extrinsic(s)).collect()
        } else {
            crate::bracket::derive_extrinsics(rig, streams, cams)?
        };

        Ok(Self {
            world_to_ref: streams.world_to_ref.clone(),
            ref_timestamps: streams.ref_timestamps.clone(),
            world_to_cam,
            extrinsics,
            offsets: (0..n).map(|s| rig.offset(s)).collect(),
            focals: (0..n).map(|s| rig.intrinsics(s).focal_length()).collect(),
            centers: (0..n).map(|s| rig.intrinsics(s).optical_center()).collect(),
            distortions: (0..n).map(|s| *rig.intrinsics(s).distortion()).collect(),
            depth_to_image,
            depth_scales,
            min_timestamp_offset: bracket.min_timestamp_offset.clone(),
            max_timestamp_offset: bracket.max_timestamp_offset.clone(),
        })
    }

    /// Recompute `world_to_cam` from the reference poses, extrinsics, and
    /// offsets. A no-op with `no_extrinsics`, where the poses are the
    /// parameters themselves.
    pub fn update_world_to_cam(&mut self, cams: &[CameraImage], no_extrinsics: bool) -> Result<()> {
        if no_extrinsics {
            return Ok(());
        }
        self.world_to_cam = calc_world_to_cam(
            cams,
            &self.world_to_ref,
            &self.ref_timestamps,
            &self.extrinsics,
            &self.offsets,
        )?;
        Ok(())
    }

    /// The depth-to-image transform of a sensor with its scale multiplied
    /// back in.
    pub fn full_depth_to_image(&self, s: usize) -> Affine3 {
        Affine3 {
            linear: self.depth_to_image[s].linear * self.depth_scales[s],
            translation: self.depth_to_image[s].translation,
        }
    }
}

/// Borrowed inputs of the pass loop.
pub struct RefinerInput<'a> {
    pub streams: &'a SensorStreams,
    pub cams: &'a [CameraImage],
    pub tracks: &'a [Track],
    pub keypoints: &'a [Vec<(f32, f32)>],
    pub bracket: &'a BracketOutput,
    pub mesh: Option<&'a dyn MeshOracle>,
}

/// What the pass loop leaves behind.
pub struct PassOutput {
    pub state: RefinerState,
    pub xyz: Vec<Pt3>,
    pub inliers: InlierMask,
}

/// Run the optimization passes, mutating the rig in place.
pub fn run_passes(
    rig: &mut Rig,
    input: &RefinerInput<'_>,
    config: &RefinerConfig,
) -> Result<PassOutput> {
    config.validate()?;

    let mut state = RefinerState::new(rig, input.streams, input.cams, input.bracket)?;
    let mut inliers = InlierMask::new(input.tracks);

    flag_outliers_by_exclusion(
        rig,
        input.cams,
        input.tracks,
        input.keypoints,
        config.num_exclude_boundary_pixels,
        &mut inliers,
    );

    // When the reference intrinsics stay frozen, the pre-run values (with
    // their two distinct focal lengths) are restored verbatim afterwards.
    let orig_ref_params = rig.intrinsics(REF_SENSOR_ID).clone();

    let mut xyz = Vec::new();

    for pass in 0..config.refiner_num_passes {
        info!(
            "optimization pass {} / {}",
            pass + 1,
            config.refiner_num_passes
        );

        state.update_world_to_cam(input.cams, config.no_extrinsics)?;

        let before = inliers.num_inliers();
        xyz = triangulate_tracks(
            rig,
            input.cams,
            &state.world_to_cam,
            input.tracks,
            input.keypoints,
            &mut inliers,
        );

        let (mesh_per_feature, mesh_per_track) = match input.mesh {
            Some(oracle) => {
                let (f, t) = mesh_intersections(
                    rig,
                    input.cams,
                    &state.world_to_cam,
                    input.tracks,
                    input.keypoints,
                    &inliers,
                    oracle,
                    config.min_ray_dist,
                    config.max_ray_dist,
                );
                (Some(f), Some(t))
            }
            None => (None, None),
        };

        let assembled = assemble_problem(&AssembleInput {
            rig,
            state: &state,
            cams: input.cams,
            tracks: input.tracks,
            keypoints: input.keypoints,
            xyz: &xyz,
            inliers: &inliers,
            mesh_per_feature: mesh_per_feature.as_deref(),
            mesh_per_track: mesh_per_track.as_deref(),
            config,
        })?;

        log_residual_stats(
            "before opt",
            &assembled.tags,
            &eval_residuals(&assembled.ir, &assembled.initial),
        );

        let solution = if config.num_iterations > 0 {
            let opts = BackendSolveOptions {
                max_iters: config.num_iterations,
                verbosity: 0,
                num_threads: config.num_opt_threads,
                linear_solver: LinearSolverKind::SparseCholesky,
                min_abs_decrease: 1e-16,
                min_rel_decrease: config.parameter_tolerance,
                min_error: 1e-16,
            };
            rig_optim::solve(&assembled.ir, &assembled.initial, &opts)
                .context("the optimization pass failed")?
                .params
        } else {
            assembled.initial.clone()
        };

        copy_back(&solution, &mut state, &mut xyz, input, config);

        log_residual_stats(
            "after opt",
            &assembled.tags,
            &eval_residuals(&assembled.ir, &solution),
        );

        // Push the state into the rig so the next pass (and the outlier
        // gates below) see the optimized intrinsics.
        sync_rig(rig, &state, &orig_ref_params, config);

        state.update_world_to_cam(input.cams, config.no_extrinsics)?;

        flag_outliers_by_angle_and_reproj(
            rig,
            input.cams,
            &state.world_to_cam,
            input.tracks,
            input.keypoints,
            &xyz,
            config.refiner_min_angle,
            config.max_reprojection_error,
            &mut inliers,
        );

        let after = inliers.num_inliers();
        info!("pass {}: inliers {} -> {}", pass + 1, before, after);
    }

    Ok(PassOutput {
        state,
        xyz,
        inliers,
    })
}

/// Copy the solved parameter values back into the state.
fn copy_back(
    solution: &HashMap<String, DVector<f64>>,
    state: &mut RefinerState,
    xyz: &mut [Pt3],
    input: &RefinerInput<'_>,
    config: &RefinerConfig,
) {
    if config.no_extrinsics {
        for (cid, cam) in input.cams.iter().enumerate() {
            if let Some(v) = solution.get(&names::cam_pose(cid)) {
                let pose = dvec_to_iso3(v.as_view()).expect("solver returned a 7D pose");
                state.world_to_cam[cid] = pose;
                // Reference observations double as the reference poses.
                if cam.sensor_id == REF_SENSOR_ID {
                    state.world_to_ref[cam.beg_ref_index] = pose;
                }
            }
        }
    } else {
        for r in 0..state.world_to_ref.len() {
            if let Some(v) = solution.get(&names::ref_pose(r)) {
                state.world_to_ref[r] = dvec_to_iso3(v.as_view()).expect("7D pose");
            }
        }
    }

    for s in 0..state.extrinsics.len() {
        if let Some(v) = solution.get(&names::extr(s)) {
            state.extrinsics[s] = dvec_to_iso3(v.as_view()).expect("7D extrinsic");
        }
        if let Some(v) = solution.get(&names::offset(s)) {
            state.offsets[s] = v[0];
        }
        if let Some(v) = solution.get(&names::focal(s)) {
            state.focals[s] = v[0];
        }
        if let Some(v) = solution.get(&names::center(s)) {
            state.centers[s] = Vec2::new(v[0], v[1]);
        }
        if let Some(v) = solution.get(&names::dist(s)) {
            if !matches!(state.distortions[s], Distortion::None) {
                let coeffs: Vec<Real> = v.iter().copied().collect();
                state.distortions[s]
                    .set_coeffs(&coeffs)
                    .expect("solver kept the coefficient count");
            }
        }
        if let Some(v) = solution.get(&names::depth_to_image(s)) {
            state.depth_to_image[s] = if config.affine_depth_to_image {
                dvec_to_affine(v.as_view()).expect("12D affine")
            } else {
                Affine3::from_iso(&dvec_to_iso3(v.as_view()).expect("7D rigid"))
            };
        }
        if let Some(v) = solution.get(&names::depth_scale(s)) {
            state.depth_scales[s] = v[0];
        }
    }

    for (pid, point) in xyz.iter_mut().enumerate() {
        if let Some(v) = solution.get(&names::xyz(pid)) {
            *point = Pt3::new(v[0], v[1], v[2]);
        }
    }
}

/// Write the state into the rig model.
pub fn sync_rig(
    rig: &mut Rig,
    state: &RefinerState,
    orig_ref_params: &SensorParams,
    config: &RefinerConfig,
) {
    for s in 0..rig.num_sensors() {
        let restore_ref = s == REF_SENSOR_ID
            && (!config.intrinsics_to_float_for(REF_SENSOR_ID).any() || config.num_iterations == 0);
        if restore_ref {
            // The reference model keeps its two distinct focal lengths when
            // the solver never touched it.
            rig.set_intrinsics(s, orig_ref_params.clone());
        } else {
            let mut params = rig.intrinsics(s).clone();
            params.set_focal_length(state.focals[s]);
            params.set_optical_center(state.centers[s]);
            *params.distortion_mut() = state.distortions[s];
            rig.set_intrinsics(s, params);
        }

        rig.set_extrinsic(s, state.extrinsics[s]);
        rig.set_offset(s, state.offsets[s]);
        rig.set_depth_to_image(s, state.full_depth_to_image(s));
    }
}

/// Percentile statistics of the raw (unrobustified) residuals, grouped by
/// kind and compensated for their weights.
fn log_residual_stats(tag: &str, tags: &[ResidualTag], residuals: &[f64]) {
    let mut by_name: HashMap<&str, Vec<f64>> = HashMap::new();
    let mut offset = 0usize;
    for t in tags {
        let entry = by_name.entry(t.name.as_str()).or_default();
        for k in 0..t.dim {
            entry.push((residuals[offset + k] / t.scale).abs());
        }
        offset += t.dim;
    }

    info!("the 25, 50, 75, and 100th percentile residual stats {tag}");
    let mut names: Vec<&&str> = by_name.keys().collect();
    names.sort();
    for name in names {
        let mut vals = by_name[*name].clone();
        vals.sort_by(|a, b| a.total_cmp(b));
        let len = vals.len();
        if len == 0 {
            info!("{}: none", name);
            continue;
        }
        let q = |f: f64| vals[((f * len as f64) as usize).min(len - 1)];
        info!(
            "{}: {:.5} {:.5} {:.5} {:.5} ({} residuals)",
            name,
            q(0.25),
            q(0.50),
            q(0.75),
            vals[len - 1],
            len
        );
    }
}
