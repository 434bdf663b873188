//! The run summary written next to the refined rig config.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Summary of a refinement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinerReport {
    pub num_sensors: usize,
    pub num_ref_frames: usize,
    pub num_images: usize,
    pub num_tracks: usize,
    pub num_inlier_features: usize,
    pub num_passes: usize,
    /// Mean absolute pixel residual over the inliers after the last pass.
    pub mean_reprojection_error_px: f64,
    /// Per-sensor timestamp offsets after refinement, seconds.
    pub timestamp_offsets: Vec<f64>,
    /// Per-sensor focal lengths after refinement, pixels.
    pub focal_lengths: Vec<f64>,
    /// The registration scale, when registration ran.
    pub registration_scale: Option<f64>,
}

impl RefinerReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("cannot write report {}", path.display()))
    }
}
