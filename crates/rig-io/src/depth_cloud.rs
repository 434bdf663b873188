//! Raw depth clouds (`*.pc`): a little-endian `i32` header
//! `rows, cols, channels` followed by `rows * cols * channels` IEEE-754
//! `f32` values. Channels is always 3 (x, y, z); an all-zero triple marks
//! an invalid measurement.

use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Result};
use rig_core::{Real, Vec3};

use crate::error::IoError;

/// A dense grid of per-pixel 3D measurements in the depth sensor frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthCloud {
    pub rows: usize,
    pub cols: usize,
    /// Row-major `(x, y, z)` triples, `rows * cols` of them.
    pub points: Vec<[f32; 3]>,
}

impl DepthCloud {
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Nearest-neighbour lookup at a distorted pixel. Returns `None` for
    /// out-of-grid pixels and for the invalid `(0, 0, 0)` marker; a pixel
    /// rounding exactly onto the far edge is out of grid too.
    pub fn value_at(&self, col: Real, row: Real) -> Option<Vec3> {
        if self.is_empty() {
            return None;
        }
        let c = col.round() as i64;
        let r = row.round() as i64;
        if c < 0 || r < 0 || c >= self.cols as i64 || r >= self.rows as i64 {
            return None;
        }
        let p = self.points[r as usize * self.cols + c as usize];
        if p == [0.0, 0.0, 0.0] {
            return None;
        }
        Some(Vec3::new(p[0] as Real, p[1] as Real, p[2] as Real))
    }
}

/// Read a `*.pc` depth cloud.
pub fn read_depth_cloud(path: &Path) -> Result<DepthCloud> {
    let file = fs::File::open(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 12];
    reader.read_exact(&mut header)?;
    let rows = i32::from_le_bytes(header[0..4].try_into().unwrap());
    let cols = i32::from_le_bytes(header[4..8].try_into().unwrap());
    let channels = i32::from_le_bytes(header[8..12].try_into().unwrap());

    if rows < 0 || cols < 0 {
        bail!(IoError::Format(format!(
            "negative depth cloud dimensions in {}: {} x {}",
            path.display(),
            rows,
            cols
        )));
    }
    if channels != 3 {
        bail!(IoError::Format(format!(
            "expecting 3 channels in {}, got {}",
            path.display(),
            channels
        )));
    }

    let count = rows as usize * cols as usize;
    let mut buf = vec![0u8; count * 3 * 4];
    reader.read_exact(&mut buf)?;

    let mut points = Vec::with_capacity(count);
    for chunk in buf.chunks_exact(12) {
        points.push([
            f32::from_le_bytes(chunk[0..4].try_into().unwrap()),
            f32::from_le_bytes(chunk[4..8].try_into().unwrap()),
            f32::from_le_bytes(chunk[8..12].try_into().unwrap()),
        ]);
    }

    Ok(DepthCloud {
        rows: rows as usize,
        cols: cols as usize,
        points,
    })
}

/// Write a `*.pc` depth cloud.
pub fn write_depth_cloud(path: &Path, cloud: &DepthCloud) -> Result<()> {
    if cloud.points.len() != cloud.rows * cloud.cols {
        bail!(IoError::Format(format!(
            "depth cloud has {} points for a {} x {} grid",
            cloud.points.len(),
            cloud.rows,
            cloud.cols
        )));
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = fs::File::create(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&(cloud.rows as i32).to_le_bytes())?;
    writer.write_all(&(cloud.cols as i32).to_le_bytes())?;
    writer.write_all(&3i32.to_le_bytes())?;
    for p in &cloud.points {
        for c in p {
            writer.write_all(&c.to_le_bytes())?;
        }
    }
    Ok(())
}
