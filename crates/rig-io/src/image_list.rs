//! The image list: one line per observation.
//!
//! ```text
//! # image_file sensor_id timestamp depth_file world_to_image
//! nav_cam/1234.5.jpg 0 1234.5 none 1 0 0 0 1 0 0 0 1 0 0 0
//! ```
//!
//! `world_to_image` is the row-major 3×4 world-to-camera transform;
//! `depth_file` is the literal `none` when there is no depth cloud.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use log::info;
use rig_core::{fmt_real, Affine3, Real};

use crate::error::IoError;

/// Marker used in place of a depth file when an observation has none.
pub const NO_DEPTH_FILE: &str = "none";

/// One parsed image-list line.
#[derive(Debug, Clone)]
pub struct ImageListEntry {
    pub image_path: PathBuf,
    pub sensor_id: usize,
    pub timestamp: Real,
    /// `None` when the depth column was [`NO_DEPTH_FILE`].
    pub depth_path: Option<PathBuf>,
    pub world_to_cam: Affine3,
}

/// Read an image list. Duplicate `(sensor, timestamp)` pairs are fatal.
pub fn read_image_list(path: &Path) -> Result<Vec<ImageListEntry>> {
    info!("reading image list: {}", path.display());
    let file = fs::File::open(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut entries = Vec::new();
    let mut seen = HashSet::<(usize, u64)>::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() != 4 + 12 {
            bail!(IoError::Parse {
                what: "image list line",
                path: path.display().to_string(),
                line: line.clone(),
            });
        }

        let parse_fail = || IoError::Parse {
            what: "image list line",
            path: path.display().to_string(),
            line: line.clone(),
        };

        let image_path = PathBuf::from(tokens[0]);
        let sensor_id: usize = tokens[1].parse().map_err(|_| parse_fail())?;
        let timestamp: Real = tokens[2].parse().map_err(|_| parse_fail())?;
        let depth_path = if tokens[3] == NO_DEPTH_FILE {
            None
        } else {
            Some(PathBuf::from(tokens[3]))
        };

        let vals: Vec<Real> = tokens[4..]
            .iter()
            .map(|t| t.parse::<Real>().map_err(|_| parse_fail()))
            .collect::<Result<_, _>>()?;
        let world_to_cam = Affine3::from_row_major(&vals)?;

        if !seen.insert((sensor_id, timestamp.to_bits())) {
            bail!(IoError::DuplicateTimestamp {
                timestamp,
                sensor: sensor_id,
            });
        }

        entries.push(ImageListEntry {
            image_path,
            sensor_id,
            timestamp,
            depth_path,
            world_to_cam,
        });
    }

    Ok(entries)
}

/// Write an image list.
pub fn write_image_list(path: &Path, entries: &[ImageListEntry]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    info!("writing image list: {}", path.display());
    let mut f = fs::File::create(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;

    writeln!(f, "# image_file sensor_id timestamp depth_file world_to_image")?;
    for e in entries {
        let vals: Vec<String> = e
            .world_to_cam
            .to_row_major()
            .iter()
            .map(|v| fmt_real(*v))
            .collect();
        writeln!(
            f,
            "{} {} {} {} {}",
            e.image_path.display(),
            e.sensor_id,
            fmt_real(e.timestamp),
            e.depth_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| NO_DEPTH_FILE.to_string()),
            vals.join(" ")
        )?;
    }
    Ok(())
}
