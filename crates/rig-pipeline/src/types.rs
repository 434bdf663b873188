//! The bracketed observation type shared across the pipeline.

use std::path::PathBuf;

use image::GrayImage;
use rig_core::Real;
use rig_io::DepthCloud;

/// One admitted observation: an image with its bracketing bookkeeping and
/// optionally the depth cloud acquired nearest in time.
///
/// For a reference-sensor observation `beg_ref_index == end_ref_index` and
/// `ref_timestamp == timestamp`. After bracketing, observations are sorted
/// by `ref_timestamp`; the bracketing indices keep pointing into the
/// reference-frame table, which never reorders.
#[derive(Debug, Clone)]
pub struct CameraImage {
    pub sensor_id: usize,
    /// Acquisition time on this sensor's own clock.
    pub timestamp: Real,
    /// `timestamp` shifted onto the reference clock.
    pub ref_timestamp: Real,
    pub beg_ref_index: usize,
    pub end_ref_index: usize,
    pub image: GrayImage,
    pub image_path: PathBuf,
    pub depth_cloud: Option<DepthCloud>,
    pub depth_timestamp: Option<Real>,
    pub depth_path: Option<PathBuf>,
}

impl CameraImage {
    pub fn has_depth(&self) -> bool {
        self.depth_cloud.as_ref().is_some_and(|c| !c.is_empty())
    }
}
