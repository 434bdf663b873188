//! Ingest: turn the image list into per-sensor chronological streams.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::GrayImage;
use log::info;
use rig_core::{Affine3, Real, Rig, REF_SENSOR_ID};
use rig_io::{read_depth_cloud, read_image_list, DepthCloud, ImageListEntry};

/// One loaded image observation.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub timestamp: Real,
    pub path: PathBuf,
    pub image: GrayImage,
    pub world_to_cam: Affine3,
}

/// One loaded depth observation.
#[derive(Debug, Clone)]
pub struct DepthRecord {
    pub timestamp: Real,
    pub path: PathBuf,
    pub cloud: DepthCloud,
}

/// Per-sensor time-ordered streams plus the reference-frame table.
#[derive(Debug, Clone, Default)]
pub struct SensorStreams {
    /// `images[sensor]` is chronological.
    pub images: Vec<Vec<ImageRecord>>,
    /// `depths[sensor]` is chronological.
    pub depths: Vec<Vec<DepthRecord>>,
    /// Reference-sensor timestamps, non-decreasing.
    pub ref_timestamps: Vec<Real>,
    /// World-to-reference poses, parallel to `ref_timestamps`.
    pub world_to_ref: Vec<rig_core::Iso3>,
    /// Reference image paths, parallel to `ref_timestamps`.
    pub ref_image_paths: Vec<PathBuf>,
}

impl SensorStreams {
    /// Assemble streams from already-loaded records. Records are sorted by
    /// timestamp per sensor; the reference table is derived from sensor 0.
    pub fn from_records(
        num_sensors: usize,
        mut images: Vec<Vec<ImageRecord>>,
        mut depths: Vec<Vec<DepthRecord>>,
    ) -> Result<Self> {
        images.resize(num_sensors, Vec::new());
        depths.resize(num_sensors, Vec::new());
        for stream in images.iter_mut() {
            stream.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        }
        for stream in depths.iter_mut() {
            stream.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        }

        let reference = &images[REF_SENSOR_ID];
        if reference.is_empty() {
            bail!("no reference-sensor images found");
        }

        let ref_timestamps: Vec<Real> = reference.iter().map(|r| r.timestamp).collect();
        let world_to_ref = reference
            .iter()
            .map(|r| r.world_to_cam.to_iso())
            .collect();
        let ref_image_paths = reference.iter().map(|r| r.path.clone()).collect();

        Ok(Self {
            images,
            depths,
            ref_timestamps,
            world_to_ref,
            ref_image_paths,
        })
    }

    /// Look up the index of a reference frame by image path.
    pub fn ref_index_for_image(&self, path: &Path) -> Option<usize> {
        self.ref_image_paths.iter().position(|p| p == path)
    }
}

/// Read the image list and load every image (as 8-bit grayscale) and depth
/// cloud it names.
pub fn load_streams(image_list: &Path, rig: &Rig) -> Result<SensorStreams> {
    let entries = read_image_list(image_list)?;
    load_entries(&entries, rig)
}

fn load_entries(entries: &[ImageListEntry], rig: &Rig) -> Result<SensorStreams> {
    let num_sensors = rig.num_sensors();
    let mut images: Vec<Vec<ImageRecord>> = vec![Vec::new(); num_sensors];
    let mut depths: Vec<Vec<DepthRecord>> = vec![Vec::new(); num_sensors];

    for entry in entries {
        if entry.sensor_id >= num_sensors {
            bail!(
                "image list references sensor id {} but the rig has {} sensors",
                entry.sensor_id,
                num_sensors
            );
        }

        let dynamic = image::open(&entry.image_path)
            .with_context(|| format!("cannot load image {}", entry.image_path.display()))?;
        let image = dynamic.to_luma8();

        images[entry.sensor_id].push(ImageRecord {
            timestamp: entry.timestamp,
            path: entry.image_path.clone(),
            image,
            world_to_cam: entry.world_to_cam,
        });

        if let Some(depth_path) = &entry.depth_path {
            let cloud = read_depth_cloud(depth_path)
                .with_context(|| format!("cannot load depth cloud {}", depth_path.display()))?;
            depths[entry.sensor_id].push(DepthRecord {
                timestamp: entry.timestamp,
                path: depth_path.clone(),
                cloud,
            });
        }
    }

    info!(
        "loaded {} images across {} sensors",
        entries.len(),
        num_sensors
    );
    SensorStreams::from_records(num_sensors, images, depths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::Iso3;

    fn record(ts: Real) -> ImageRecord {
        ImageRecord {
            timestamp: ts,
            path: PathBuf::from(format!("nav_cam/{ts}.jpg")),
            image: GrayImage::new(4, 4),
            world_to_cam: Affine3::from_iso(&Iso3::translation(ts, 0.0, 0.0)),
        }
    }

    #[test]
    fn streams_are_sorted_and_reference_table_derived() {
        let images = vec![vec![record(2.0), record(0.0), record(1.0)], vec![record(0.5)]];
        let streams = SensorStreams::from_records(2, images, vec![Vec::new(); 2]).unwrap();
        assert_eq!(streams.ref_timestamps, vec![0.0, 1.0, 2.0]);
        assert_eq!(streams.world_to_ref.len(), 3);
        assert!((streams.world_to_ref[2].translation.vector.x - 2.0).abs() < 1e-12);
        assert_eq!(
            streams.ref_index_for_image(Path::new("nav_cam/1.jpg")),
            Some(1)
        );
    }

    #[test]
    fn missing_reference_stream_is_fatal() {
        let images = vec![Vec::new(), vec![record(0.5)]];
        assert!(SensorStreams::from_records(2, images, vec![Vec::new(); 2]).is_err());
    }
}
