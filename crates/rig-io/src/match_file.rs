//! Binary interest-point match files (`*.match`).
//!
//! Layout: `u64 n1, u64 n2`, then `n1 + n2` records of
//! `f32 x, f32 y, i32 ix, i32 iy, f32 orientation, f32 scale,
//! f32 interest, u8 polarity, u32 octave, u32 scale_lvl,
//! u64 descriptor_len, f32[descriptor_len]`, all little-endian. The first
//! `n1` records belong to the left image, the rest to the right.

use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::Result;

use crate::error::IoError;

/// One interest-point record.
#[derive(Debug, Clone, PartialEq)]
pub struct IpRecord {
    pub x: f32,
    pub y: f32,
    pub ix: i32,
    pub iy: i32,
    pub orientation: f32,
    pub scale: f32,
    pub interest: f32,
    pub polarity: bool,
    pub octave: u32,
    pub scale_lvl: u32,
    pub descriptor: Vec<f32>,
}

impl IpRecord {
    /// A record carrying only a pixel position, as written for tracks whose
    /// descriptors have been released.
    pub fn from_pixel(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ix: x.round() as i32,
            iy: y.round() as i32,
            orientation: 0.0,
            scale: 1.0,
            interest: 0.0,
            polarity: false,
            octave: 0,
            scale_lvl: 0,
            descriptor: Vec::new(),
        }
    }
}

fn write_record(w: &mut impl Write, p: &IpRecord) -> Result<()> {
    w.write_all(&p.x.to_le_bytes())?;
    w.write_all(&p.y.to_le_bytes())?;
    w.write_all(&p.ix.to_le_bytes())?;
    w.write_all(&p.iy.to_le_bytes())?;
    w.write_all(&p.orientation.to_le_bytes())?;
    w.write_all(&p.scale.to_le_bytes())?;
    w.write_all(&p.interest.to_le_bytes())?;
    w.write_all(&[p.polarity as u8])?;
    w.write_all(&p.octave.to_le_bytes())?;
    w.write_all(&p.scale_lvl.to_le_bytes())?;
    w.write_all(&(p.descriptor.len() as u64).to_le_bytes())?;
    for v in &p.descriptor {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_record(r: &mut impl Read) -> Result<IpRecord> {
    let mut f32buf = [0u8; 4];
    let mut u64buf = [0u8; 8];
    let mut byte = [0u8; 1];

    let mut read_f32 = |r: &mut dyn Read, buf: &mut [u8; 4]| -> Result<f32> {
        r.read_exact(buf)?;
        Ok(f32::from_le_bytes(*buf))
    };

    let x = read_f32(r, &mut f32buf)?;
    let y = read_f32(r, &mut f32buf)?;
    r.read_exact(&mut f32buf)?;
    let ix = i32::from_le_bytes(f32buf);
    r.read_exact(&mut f32buf)?;
    let iy = i32::from_le_bytes(f32buf);
    let orientation = read_f32(r, &mut f32buf)?;
    let scale = read_f32(r, &mut f32buf)?;
    let interest = read_f32(r, &mut f32buf)?;
    r.read_exact(&mut byte)?;
    let polarity = byte[0] != 0;
    r.read_exact(&mut f32buf)?;
    let octave = u32::from_le_bytes(f32buf);
    r.read_exact(&mut f32buf)?;
    let scale_lvl = u32::from_le_bytes(f32buf);
    r.read_exact(&mut u64buf)?;
    let len = u64::from_le_bytes(u64buf) as usize;

    let mut descriptor = Vec::with_capacity(len);
    for _ in 0..len {
        descriptor.push(read_f32(r, &mut f32buf)?);
    }

    Ok(IpRecord {
        x,
        y,
        ix,
        iy,
        orientation,
        scale,
        interest,
        polarity,
        octave,
        scale_lvl,
        descriptor,
    })
}

/// Write the matches of one image pair.
pub fn write_match_file(path: &Path, left: &[IpRecord], right: &[IpRecord]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = fs::File::create(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut w = BufWriter::new(file);
    w.write_all(&(left.len() as u64).to_le_bytes())?;
    w.write_all(&(right.len() as u64).to_le_bytes())?;
    for p in left.iter().chain(right.iter()) {
        write_record(&mut w, p)?;
    }
    Ok(())
}

/// Read the matches of one image pair.
pub fn read_match_file(path: &Path) -> Result<(Vec<IpRecord>, Vec<IpRecord>)> {
    let file = fs::File::open(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut r = BufReader::new(file);

    let mut u64buf = [0u8; 8];
    r.read_exact(&mut u64buf)?;
    let n1 = u64::from_le_bytes(u64buf) as usize;
    r.read_exact(&mut u64buf)?;
    let n2 = u64::from_le_bytes(u64buf) as usize;

    let mut left = Vec::with_capacity(n1);
    for _ in 0..n1 {
        left.push(read_record(&mut r)?);
    }
    let mut right = Vec::with_capacity(n2);
    for _ in 0..n2 {
        right.push(read_record(&mut r)?);
    }
    Ok((left, right))
}

/// The name of the match file for an image pair. Sensor directory names are
/// kept in the file name so two sensors with same-named images cannot
/// collide.
pub fn match_file_name(
    match_dir: &Path,
    left_image: &Path,
    right_image: &Path,
    suffix: &str,
) -> Result<std::path::PathBuf> {
    let part = |image: &Path| -> Result<String> {
        let cam = image
            .parent()
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let stem = image
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if cam.is_empty() || stem.is_empty() {
            anyhow::bail!(
                "the image name must have the form cam_name/image, got: {}",
                image.display()
            );
        }
        Ok(format!("{}-{}", cam, stem))
    };
    Ok(match_dir.join(format!(
        "{}__{}{}.match",
        part(left_image)?,
        part(right_image)?,
        suffix
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record(seed: f32) -> IpRecord {
        IpRecord {
            x: seed,
            y: seed + 0.5,
            ix: seed as i32,
            iy: seed as i32 + 1,
            orientation: 0.25,
            scale: 2.0,
            interest: 100.0,
            polarity: true,
            octave: 3,
            scale_lvl: 1,
            descriptor: vec![seed, -seed, 0.125],
        }
    }

    #[test]
    fn round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pair.match");
        let left = vec![record(1.0), record(2.0)];
        let right = vec![record(3.0)];
        write_match_file(&path, &left, &right).unwrap();
        let (l, r) = read_match_file(&path).unwrap();
        assert_eq!(l, left);
        assert_eq!(r, right);
    }

    #[test]
    fn empty_descriptor_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pair.match");
        let left = vec![IpRecord::from_pixel(10.5, 20.5)];
        write_match_file(&path, &left, &[]).unwrap();
        let (l, r) = read_match_file(&path).unwrap();
        assert_eq!(l, left);
        assert!(r.is_empty());
    }

    #[test]
    fn match_file_name_includes_sensor_dirs() {
        let name = match_file_name(
            Path::new("out/matches"),
            Path::new("data/nav_cam/10.5.jpg"),
            Path::new("data/sci_cam/10.7.jpg"),
            "-inliers",
        )
        .unwrap();
        assert_eq!(
            name,
            PathBuf::from("out/matches/nav_cam-10.5__sci_cam-10.7-inliers.match")
        );
    }

    #[test]
    fn bare_image_name_is_rejected() {
        assert!(match_file_name(
            Path::new("out"),
            Path::new("10.5.jpg"),
            Path::new("nav_cam/10.7.jpg"),
            "",
        )
        .is_err());
    }
}
