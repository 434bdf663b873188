//! The refiner configuration: one explicit value carrying every option,
//! validated up front.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, ensure, Result};
use rig_core::Real;

/// Which intrinsics of one sensor may float.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntrinsicsToFloat {
    pub focal_length: bool,
    pub optical_center: bool,
    pub distortion: bool,
}

impl IntrinsicsToFloat {
    /// Parse a quoted list like `"focal_length optical_center distortion"`.
    pub fn parse(list: &str) -> Result<Self> {
        let mut out = Self::default();
        for token in list.split_whitespace() {
            match token {
                "focal_length" => out.focal_length = true,
                "optical_center" => out.optical_center = true,
                "distortion" => out.distortion = true,
                other => bail!("unknown intrinsic to float: {}", other),
            }
        }
        Ok(out)
    }

    pub fn any(&self) -> bool {
        self.focal_length || self.optical_center || self.distortion
    }
}

/// All options of a refinement run.
#[derive(Debug, Clone)]
pub struct RefinerConfig {
    pub num_overlaps: usize,
    pub bracket_len: Real,
    pub num_iterations: usize,
    pub num_opt_threads: usize,
    pub num_match_threads: usize,
    pub robust_threshold: Real,
    pub parameter_tolerance: Real,

    pub depth_tri_weight: Real,
    pub mesh_tri_weight: Real,
    pub depth_mesh_weight: Real,
    pub min_ray_dist: Real,
    pub max_ray_dist: Real,

    pub initial_max_reprojection_error: Real,
    pub max_reprojection_error: Real,
    pub refiner_min_angle: Real,
    pub refiner_num_passes: usize,
    /// Boundary-exclusion margin for reference-sensor features, pixels.
    pub num_exclude_boundary_pixels: u32,

    /// Per sensor, which intrinsics float. Indexed by sensor id; missing
    /// entries mean everything frozen.
    pub intrinsics_to_float: Vec<IntrinsicsToFloat>,
    /// Names of the sensors whose extrinsics float.
    pub extrinsics_to_float: HashSet<String>,
    /// Whether the depth-to-image transforms float (the `depth_to_image`
    /// entry of the extrinsics list).
    pub float_depth_to_image: bool,

    pub float_scale: bool,
    pub float_sparse_map: bool,
    pub float_timestamp_offsets: bool,
    pub float_nonref_cameras: bool,
    pub no_extrinsics: bool,
    pub affine_depth_to_image: bool,

    pub timestamp_offsets_max_change: Real,
    pub max_image_to_depth_timestamp_diff: Real,
    /// Optional per-sensor whitelist of timestamps to use.
    pub timestamps_to_use: Vec<HashSet<u64>>,

    pub registration: bool,
    pub hugin_file: Option<PathBuf>,
    pub xyz_file: Option<PathBuf>,

    pub out_dir: Option<PathBuf>,
    pub save_matches: bool,
    pub save_images_and_depth_clouds: bool,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            num_overlaps: 10,
            bracket_len: 0.6,
            num_iterations: 20,
            num_opt_threads: 16,
            num_match_threads: 8,
            robust_threshold: 3.0,
            parameter_tolerance: 1e-12,
            depth_tri_weight: 1000.0,
            mesh_tri_weight: 0.0,
            depth_mesh_weight: 0.0,
            min_ray_dist: 0.0,
            max_ray_dist: 100.0,
            initial_max_reprojection_error: 300.0,
            max_reprojection_error: 25.0,
            refiner_min_angle: 0.5,
            refiner_num_passes: 2,
            num_exclude_boundary_pixels: 0,
            intrinsics_to_float: Vec::new(),
            extrinsics_to_float: HashSet::new(),
            float_depth_to_image: false,
            float_scale: false,
            float_sparse_map: false,
            float_timestamp_offsets: false,
            float_nonref_cameras: false,
            no_extrinsics: false,
            affine_depth_to_image: false,
            timestamp_offsets_max_change: 1.0,
            max_image_to_depth_timestamp_diff: 0.2,
            timestamps_to_use: Vec::new(),
            registration: false,
            hugin_file: None,
            xyz_file: None,
            out_dir: None,
            save_matches: false,
            save_images_and_depth_clouds: false,
        }
    }
}

impl RefinerConfig {
    /// Cross-validate the options. Mirrors the constraints a run relies on;
    /// violations are configuration errors and abort before any data is
    /// read.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.robust_threshold > 0.0, "the robust threshold must be positive");
        ensure!(self.bracket_len > 0.0, "bracket length must be positive");
        ensure!(self.num_overlaps >= 1, "number of overlaps must be positive");
        ensure!(
            self.timestamp_offsets_max_change >= 0.0,
            "the timestamp offsets max change must be non-negative"
        );
        ensure!(
            self.refiner_min_angle > 0.0,
            "the min triangulation angle must be positive"
        );
        ensure!(self.depth_tri_weight >= 0.0, "the depth weight must be non-negative");
        ensure!(self.mesh_tri_weight >= 0.0, "the mesh weight must be non-negative");
        ensure!(
            self.depth_mesh_weight >= 0.0,
            "the depth mesh weight must be non-negative"
        );

        if self.registration && (self.hugin_file.is_none() || self.xyz_file.is_none()) {
            bail!("in order to register the map, the hugin and xyz files must be specified");
        }
        if self.float_scale && self.affine_depth_to_image {
            bail!(
                "the options --float_scale and --affine_depth_to_image should not be used \
                 together; with an affine transform the scale always floats"
            );
        }
        if self.float_nonref_cameras && !self.no_extrinsics {
            bail!("--float_nonref_cameras must be used only with --no_extrinsics");
        }
        if self.no_extrinsics && self.float_timestamp_offsets {
            bail!("cannot float timestamp offsets with --no_extrinsics");
        }
        if !self.affine_depth_to_image && self.float_scale && !self.float_depth_to_image {
            bail!(
                "cannot float the scale of depth_to_image unless depth_to_image is part of \
                 the extrinsics to float"
            );
        }
        if self.save_images_and_depth_clouds && self.out_dir.is_none() {
            bail!("cannot save images and depth clouds if no output directory was provided");
        }
        if self.save_matches && self.out_dir.is_none() {
            bail!("cannot save matches if no output directory was provided");
        }
        Ok(())
    }

    pub fn intrinsics_to_float_for(&self, sensor: usize) -> IntrinsicsToFloat {
        self.intrinsics_to_float
            .get(sensor)
            .copied()
            .unwrap_or_default()
    }

    pub fn use_timestamp(&self, sensor: usize, timestamp: Real) -> bool {
        match self.timestamps_to_use.get(sensor) {
            Some(set) if !set.is_empty() => set.contains(&timestamp.to_bits()),
            _ => true,
        }
    }
}
