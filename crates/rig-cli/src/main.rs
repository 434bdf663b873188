//! `rig_refiner`: joint refinement of a multi-sensor camera rig.
//!
//! Reads a rig configuration and an image list, brackets every
//! non-reference observation between consecutive reference frames, builds
//! feature tracks, and refines poses, extrinsics, intrinsics,
//! depth-to-image transforms, and clock offsets in a joint optimization.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rig_features::{
    build_tracks, detect_and_match, GradientCornerDetector, MatchOptions, MatchingCamera,
};
use rig_io::{read_rig_config, write_rig_config};
use rig_pipeline::output;
use rig_pipeline::{
    apply_registration, bracket_images, load_streams, run_passes, IntrinsicsToFloat,
    MeshOracle, RefinerConfig, RefinerInput, RefinerReport, TriangleMesh,
};

#[derive(Debug, Parser)]
#[command(
    name = "rig_refiner",
    about = "Refine the calibration of a multi-sensor camera rig"
)]
struct Args {
    /// The rig configuration file.
    #[arg(long)]
    rig_config: PathBuf,

    /// The image list: image, sensor id, timestamp, depth file, and
    /// world-to-camera transform per line.
    #[arg(long)]
    image_list: PathBuf,

    /// Save the refined rig configuration and related outputs here.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Constrain the refinement with this mesh (PLY).
    #[arg(long)]
    mesh: Option<PathBuf>,

    /// How many images forward in time to match against a given image.
    #[arg(long, default_value_t = 10)]
    num_overlaps: usize,

    /// Look up non-reference images only between consecutive reference
    /// frames no further apart than this, in seconds, after adjusting for
    /// the timestamp offset.
    #[arg(long, default_value_t = 0.6)]
    bracket_len: f64,

    /// Solver iterations per pass.
    #[arg(long, default_value_t = 20)]
    num_iterations: usize,

    /// Threads for the solver.
    #[arg(long, default_value_t = 16)]
    num_opt_threads: usize,

    /// Threads for feature detection and matching. A large number can use
    /// a lot of memory.
    #[arg(long, default_value_t = 8)]
    num_match_threads: usize,

    /// Residuals much larger than this are attenuated by the robust loss.
    #[arg(long, default_value_t = 3.0)]
    robust_threshold: f64,

    /// Stop when the variables change by less than this.
    #[arg(long, default_value_t = 1e-12)]
    parameter_tolerance: f64,

    /// Weight of the depth-to-triangulation constraint.
    #[arg(long, default_value_t = 1000.0)]
    depth_tri_weight: f64,

    /// Weight pulling triangulated points toward the mesh.
    #[arg(long, default_value_t = 0.0)]
    mesh_tri_weight: f64,

    /// Weight pulling depth clouds toward the mesh.
    #[arg(long, default_value_t = 0.0)]
    depth_mesh_weight: f64,

    /// Minimum ray search distance when intersecting the mesh, meters.
    #[arg(long, default_value_t = 0.0)]
    min_ray_dist: f64,

    /// Maximum ray search distance when intersecting the mesh, meters.
    #[arg(long, default_value_t = 100.0)]
    max_ray_dist: f64,

    /// Outlier threshold, in pixels, for matches made before the cameras
    /// are optimized. Use a large value when the initial cameras are
    /// poor.
    #[arg(long, default_value_t = 300.0)]
    initial_max_reprojection_error: f64,

    /// Outlier threshold, in pixels, applied after each pass.
    #[arg(long, default_value_t = 25.0)]
    max_reprojection_error: f64,

    /// Flag triangulated points whose rays converge at less than this
    /// angle, in degrees.
    #[arg(long, default_value_t = 0.5)]
    refiner_min_angle: f64,

    /// Optimization passes; outliers are removed after each.
    #[arg(long, default_value_t = 2)]
    refiner_num_passes: usize,

    /// Flag reference-sensor pixels closer than this to the image
    /// boundary.
    #[arg(long, default_value_t = 0)]
    num_exclude_boundary_pixels: u32,

    /// Reference-sensor intrinsics to refine, as a quoted list, e.g.
    /// 'focal_length optical_center distortion'.
    #[arg(long, default_value = "")]
    nav_cam_intrinsics_to_float: String,

    /// haz_cam intrinsics to refine.
    #[arg(long, default_value = "")]
    haz_cam_intrinsics_to_float: String,

    /// sci_cam intrinsics to refine.
    #[arg(long, default_value = "")]
    sci_cam_intrinsics_to_float: String,

    /// The sensors whose extrinsics to refine, and whether to refine the
    /// depth-to-image transforms, as a quoted list, e.g.
    /// 'haz_cam sci_cam depth_to_image'.
    #[arg(long, default_value = "haz_cam sci_cam depth_to_image")]
    extrinsics_to_float: String,

    /// Refine the scale of the depth clouds.
    #[arg(long, default_value_t = false)]
    float_scale: bool,

    /// Refine the reference poses. Can invalidate the scale of the
    /// extrinsics and the registration; consider mesh constraints or
    /// re-registration.
    #[arg(long, default_value_t = false)]
    float_sparse_map: bool,

    /// Refine the timestamp offsets among the sensors.
    #[arg(long, default_value_t = false)]
    float_timestamp_offsets: bool,

    /// With --no_extrinsics, refine the non-reference camera poses.
    #[arg(long, default_value_t = false)]
    float_nonref_cameras: bool,

    /// Do not model the extrinsics: every camera pose varies on its own.
    #[arg(long, default_value_t = false)]
    no_extrinsics: bool,

    /// Model depth-to-image as an arbitrary affine transform rather than
    /// rotation plus scale.
    #[arg(long, default_value_t = false)]
    affine_depth_to_image: bool,

    /// When floating the timestamp offsets, do not let them move by more
    /// than this, in seconds.
    #[arg(long, default_value_t = 1.0)]
    timestamp_offsets_max_change: f64,

    /// Use a depth cloud only when it is within this many seconds of its
    /// sensor's image.
    #[arg(long, default_value_t = 0.2)]
    max_image_to_depth_timestamp_diff: f64,

    /// Use only these sci_cam timestamps: a file with one timestamp per
    /// line.
    #[arg(long)]
    sci_cam_timestamps: Option<PathBuf>,

    /// Re-register the refined map using the control points in
    /// --hugin_file and --xyz_file; scales all extrinsics accordingly.
    #[arg(long, default_value_t = false)]
    registration: bool,

    /// Hugin project file with registration control points.
    #[arg(long)]
    hugin_file: Option<PathBuf>,

    /// Measured world coordinates of the control points.
    #[arg(long)]
    xyz_file: Option<PathBuf>,

    /// Save the interest point matches.
    #[arg(long, default_value_t = false)]
    save_matches: bool,

    /// Save the images and depth clouds used in processing.
    #[arg(long, default_value_t = false)]
    save_images_and_depth_clouds: bool,

    /// Print verbose information about matching.
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

fn build_config(args: &Args, rig: &rig_core::Rig) -> Result<RefinerConfig> {
    let mut intrinsics_to_float = vec![IntrinsicsToFloat::default(); rig.num_sensors()];
    for (name, list) in [
        ("nav_cam", &args.nav_cam_intrinsics_to_float),
        ("haz_cam", &args.haz_cam_intrinsics_to_float),
        ("sci_cam", &args.sci_cam_intrinsics_to_float),
    ] {
        let parsed = IntrinsicsToFloat::parse(list)?;
        if let Some(s) = rig.sensor_id(name) {
            intrinsics_to_float[s] = parsed;
        } else if parsed.any() {
            anyhow::bail!("cannot float intrinsics of unknown sensor {}", name);
        }
    }

    let mut extrinsics_to_float = HashSet::new();
    let mut float_depth_to_image = false;
    for token in args.extrinsics_to_float.split_whitespace() {
        if token == "depth_to_image" {
            float_depth_to_image = true;
        } else {
            extrinsics_to_float.insert(token.to_string());
        }
    }

    let mut timestamps_to_use = vec![HashSet::new(); rig.num_sensors()];
    if let Some(path) = &args.sci_cam_timestamps {
        let sensor = rig
            .sensor_id("sci_cam")
            .context("--sci_cam_timestamps given but the rig has no sci_cam sensor")?;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        for token in text.split_whitespace() {
            let val: f64 = token
                .parse()
                .with_context(|| format!("bad timestamp in {}: {}", path.display(), token))?;
            timestamps_to_use[sensor].insert(val.to_bits());
        }
    }

    Ok(RefinerConfig {
        num_overlaps: args.num_overlaps,
        bracket_len: args.bracket_len,
        num_iterations: args.num_iterations,
        num_opt_threads: args.num_opt_threads,
        num_match_threads: args.num_match_threads,
        robust_threshold: args.robust_threshold,
        parameter_tolerance: args.parameter_tolerance,
        depth_tri_weight: args.depth_tri_weight,
        mesh_tri_weight: args.mesh_tri_weight,
        depth_mesh_weight: args.depth_mesh_weight,
        min_ray_dist: args.min_ray_dist,
        max_ray_dist: args.max_ray_dist,
        initial_max_reprojection_error: args.initial_max_reprojection_error,
        max_reprojection_error: args.max_reprojection_error,
        refiner_min_angle: args.refiner_min_angle,
        refiner_num_passes: args.refiner_num_passes,
        num_exclude_boundary_pixels: args.num_exclude_boundary_pixels,
        intrinsics_to_float,
        extrinsics_to_float,
        float_depth_to_image,
        float_scale: args.float_scale,
        float_sparse_map: args.float_sparse_map,
        float_timestamp_offsets: args.float_timestamp_offsets,
        float_nonref_cameras: args.float_nonref_cameras,
        no_extrinsics: args.no_extrinsics,
        affine_depth_to_image: args.affine_depth_to_image,
        timestamp_offsets_max_change: args.timestamp_offsets_max_change,
        max_image_to_depth_timestamp_diff: args.max_image_to_depth_timestamp_diff,
        timestamps_to_use,
        registration: args.registration,
        hugin_file: args.hugin_file.clone(),
        xyz_file: args.xyz_file.clone(),
        out_dir: args.out_dir.clone(),
        save_matches: args.save_matches,
        save_images_and_depth_clouds: args.save_images_and_depth_clouds,
    })
}

fn try_main(args: Args) -> Result<()> {
    let mut rig = read_rig_config(&args.rig_config)?;
    let config = build_config(&args, &rig)?;
    config.validate()?;

    let mesh: Option<TriangleMesh> = match &args.mesh {
        Some(path) => Some(TriangleMesh::load_ply(path)?),
        None => None,
    };

    let streams = load_streams(&args.image_list, &rig)?;
    let bracket = bracket_images(&rig, &streams, &config)?;

    // Features and tracks, with the initial cameras driving the geometric
    // pre-filter.
    let world_to_cam = rig_pipeline::initial_world_to_cam(&rig, &streams, &bracket.cams)?;
    let matching_cams: Vec<MatchingCamera> = bracket
        .cams
        .iter()
        .zip(world_to_cam.iter())
        .map(|(cam, pose)| MatchingCamera {
            image: &cam.image,
            params: rig.intrinsics(cam.sensor_id),
            world_to_cam: *pose,
        })
        .collect();

    let detector = GradientCornerDetector::default();
    let graph = detect_and_match(
        &matching_cams,
        &detector,
        &MatchOptions {
            num_overlaps: config.num_overlaps,
            initial_max_reprojection_error: config.initial_max_reprojection_error,
            num_threads: config.num_match_threads,
            ..Default::default()
        },
    )?;

    if config.save_matches {
        let out_dir = config.out_dir.as_ref().expect("validated with save_matches");
        output::save_match_pairs(out_dir, &bracket.cams, &graph.pixel_matches)?;
    }

    let tracks = build_tracks(&graph.matches)?;
    info!("built {} tracks", tracks.len());

    let input = RefinerInput {
        streams: &streams,
        cams: &bracket.cams,
        tracks: &tracks,
        keypoints: &graph.keypoints,
        bracket: &bracket,
        mesh: mesh.as_ref().map(|m| m as &dyn MeshOracle),
    };
    let mut pass = run_passes(&mut rig, &input, &config)?;

    let mut registration_scale = None;
    if config.registration {
        let transform = apply_registration(
            config.hugin_file.as_ref().expect("validated"),
            config.xyz_file.as_ref().expect("validated"),
            &mut rig,
            &streams,
            &mut pass.state,
            &mut pass.xyz,
        )?;
        registration_scale = Some(transform.uniform_scale());
        pass.state
            .update_world_to_cam(&bracket.cams, config.no_extrinsics)?;
    }

    if let Some(out_dir) = &config.out_dir {
        write_rig_config(&out_dir.join("rig_config.txt"), &rig, !config.no_extrinsics)?;
        output::save_image_list(out_dir, &bracket.cams, &pass.state.world_to_cam)?;
        output::save_nvm(
            &out_dir.join("cameras.nvm"),
            &rig,
            &bracket.cams,
            &pass.state.world_to_cam,
            &graph.keypoints,
            &tracks,
            &pass.inliers,
            &pass.xyz,
        )?;
        if config.save_matches {
            output::save_inlier_match_pairs(
                out_dir,
                config.num_overlaps,
                &bracket.cams,
                &graph.keypoints,
                &tracks,
                &pass.inliers,
            )?;
        }
        if config.save_images_and_depth_clouds {
            output::save_images_and_depth_clouds(out_dir, &rig, &bracket.cams)?;
        }

        let mean_err = mean_reprojection_error(&rig, &bracket.cams, &pass, &graph.keypoints, &tracks);
        let report = RefinerReport {
            num_sensors: rig.num_sensors(),
            num_ref_frames: streams.ref_timestamps.len(),
            num_images: bracket.cams.len(),
            num_tracks: tracks.len(),
            num_inlier_features: pass.inliers.num_inliers(),
            num_passes: config.refiner_num_passes,
            mean_reprojection_error_px: mean_err,
            timestamp_offsets: (0..rig.num_sensors()).map(|s| rig.offset(s)).collect(),
            focal_lengths: (0..rig.num_sensors())
                .map(|s| rig.intrinsics(s).focal_length())
                .collect(),
            registration_scale,
        };
        report.save(&out_dir.join("report.json"))?;
    }

    Ok(())
}

fn mean_reprojection_error(
    rig: &rig_core::Rig,
    cams: &[rig_pipeline::CameraImage],
    pass: &rig_pipeline::PassOutput,
    keypoints: &[Vec<(f32, f32)>],
    tracks: &[rig_features::Track],
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (pid, track) in tracks.iter().enumerate() {
        for (&cid, &fid) in track {
            if !pass.inliers.is_inlier(pid, cid) {
                continue;
            }
            let params = rig.intrinsics(cams[cid].sensor_id);
            let pc = pass.state.world_to_cam[cid].transform_point(&pass.xyz[pid]);
            if let Some(predicted) = params.project(&pc.coords) {
                let (x, y) = keypoints[cid][fid];
                sum += (predicted - rig_core::Vec2::new(x as f64, y as f64)).norm();
                count += 1;
            }
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if let Err(err) = try_main(args) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
