//! The plain-text rig configuration format.
//!
//! ```text
//! ref_sensor_id: 0
//!
//! sensor_id: 0
//! sensor_name: nav_cam
//! focal_length: 600
//! optical_center: 320 240
//! distortion_coeffs: -0.25 0.05 0.001 -0.001
//! distortion_type: radtan
//! image_size: 640 480
//! undistorted_image_size: 720 540
//! ref_to_sensor_transform: 1 0 0 0 1 0 0 0 1 0 0 0
//! depth_to_image_transform: 1 0 0 0 1 0 0 0 1 0 0 0
//! ref_to_sensor_timestamp_offset: 0
//! ```
//!
//! Sensor blocks repeat; their order defines the sensor indices, and
//! sensor 0 must be the reference. An all-zero `ref_to_sensor_transform`
//! means the rig transforms are unknown.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;
use rig_core::{
    fmt_real, Affine3, Distortion, ImageSize, Real, Rig, Sensor, SensorParams, Vec2,
};

use crate::error::IoError;

/// A line-oriented tag reader: skips blank and `#` lines, insists the next
/// line starts with the expected tag.
struct TagReader<R: BufRead> {
    reader: R,
    path: String,
}

impl<R: BufRead> TagReader<R> {
    fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Ok(Some(trimmed.to_string()));
        }
    }

    /// Read the values following `tag`. `expected` of `None` allows any
    /// count.
    fn values(&mut self, tag: &'static str, expected: Option<usize>) -> Result<Vec<Real>> {
        let line = self.next_line()?.ok_or_else(|| IoError::MissingTag {
            tag,
            path: self.path.clone(),
        })?;
        let mut tokens = line.split_whitespace();
        let first = tokens.next().unwrap_or_default();
        if first != tag {
            bail!(IoError::MissingTag {
                tag,
                path: self.path.clone(),
            });
        }
        let vals: Vec<Real> = tokens
            .map(|t| {
                t.parse::<Real>().map_err(|_| IoError::Parse {
                    what: "number",
                    path: self.path.clone(),
                    line: line.clone(),
                })
            })
            .collect::<Result<_, _>>()?;
        if let Some(n) = expected {
            if vals.len() != n {
                bail!(IoError::ValueCount {
                    tag,
                    path: self.path.clone(),
                    expected: n,
                    got: vals.len(),
                });
            }
        }
        Ok(vals)
    }

    fn string(&mut self, tag: &'static str) -> Result<String> {
        let line = self.next_line()?.ok_or_else(|| IoError::MissingTag {
            tag,
            path: self.path.clone(),
        })?;
        let mut tokens = line.split_whitespace();
        let first = tokens.next().unwrap_or_default();
        if first != tag {
            bail!(IoError::MissingTag {
                tag,
                path: self.path.clone(),
            });
        }
        tokens
            .next()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                IoError::ValueCount {
                    tag,
                    path: self.path.clone(),
                    expected: 1,
                    got: 0,
                }
                .into()
            })
    }
}

/// Read a rig configuration file.
pub fn read_rig_config(path: &Path) -> Result<Rig> {
    info!("reading rig config: {}", path.display());
    let file = fs::File::open(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut reader = TagReader {
        reader: BufReader::new(file),
        path: path.display().to_string(),
    };

    let ref_id = reader.values("ref_sensor_id:", Some(1))?[0] as i64;
    if ref_id != 0 {
        bail!("the reference sensor id must be 0, got {}", ref_id);
    }

    let mut sensors = Vec::new();
    let mut have_rig_transforms = true;
    loop {
        let sensor_id = match reader.values("sensor_id:", Some(1)) {
            Ok(v) => v[0] as usize,
            // No more sensor blocks.
            Err(_) => break,
        };
        if sensor_id != sensors.len() {
            bail!(
                "expecting to read sensor id {}, got {}",
                sensors.len(),
                sensor_id
            );
        }

        let name = reader.string("sensor_name:")?;
        let focal = reader.values("focal_length:", Some(1))?[0];
        let center = reader.values("optical_center:", Some(2))?;
        let coeffs = reader.values("distortion_coeffs:", None)?;
        let kind = reader.string("distortion_type:")?;
        let distortion = Distortion::from_coeffs(&kind, &coeffs)
            .with_context(|| format!("sensor {}", name))?;

        let image_size = reader.values("image_size:", Some(2))?;
        let undist_size = reader.values("undistorted_image_size:", Some(2))?;

        let ref_to_sensor =
            Affine3::from_row_major(&reader.values("ref_to_sensor_transform:", Some(12))?)?;
        if ref_to_sensor.is_zero() {
            have_rig_transforms = false;
        }
        let depth_to_image =
            Affine3::from_row_major(&reader.values("depth_to_image_transform:", Some(12))?)?;
        let timestamp_offset = reader.values("ref_to_sensor_timestamp_offset:", Some(1))?[0];

        let params = SensorParams::new(
            Vec2::new(focal, focal),
            Vec2::new(center[0], center[1]),
            distortion,
            ImageSize::new(image_size[0] as u32, image_size[1] as u32),
            ImageSize::new(undist_size[0] as u32, undist_size[1] as u32),
        )?;

        sensors.push(Sensor {
            name,
            params,
            ref_to_sensor,
            depth_to_image,
            timestamp_offset,
        });
    }

    if sensors.is_empty() {
        bail!("no sensor blocks found in {}", path.display());
    }

    Rig::new(sensors, have_rig_transforms)
}

fn affine_to_str(t: &Affine3) -> String {
    t.to_row_major()
        .iter()
        .map(|v| fmt_real(*v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write a rig configuration file. When `model_rig` is false the
/// ref-to-sensor transforms are written as zeros, marking them unknown.
pub fn write_rig_config(path: &Path, rig: &Rig, model_rig: bool) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    info!("writing rig config: {}", path.display());
    let mut f = fs::File::create(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;

    writeln!(f, "ref_sensor_id: 0")?;
    for (id, sensor) in rig.sensors().iter().enumerate() {
        let p = &sensor.params;
        writeln!(f)?;
        writeln!(f, "sensor_id: {}", id)?;
        writeln!(f, "sensor_name: {}", sensor.name)?;
        writeln!(f, "focal_length: {}", fmt_real(p.focal_length()))?;
        writeln!(
            f,
            "optical_center: {} {}",
            fmt_real(p.optical_center().x),
            fmt_real(p.optical_center().y)
        )?;
        let coeffs: Vec<String> = p.distortion().coeffs().iter().map(|v| fmt_real(*v)).collect();
        writeln!(f, "distortion_coeffs: {}", coeffs.join(" "))?;
        writeln!(f, "distortion_type: {}", p.distortion().kind())?;
        writeln!(
            f,
            "image_size: {} {}",
            p.distorted_size().width,
            p.distorted_size().height
        )?;
        writeln!(
            f,
            "undistorted_image_size: {} {}",
            p.undistorted_size().width,
            p.undistorted_size().height
        )?;
        let extr = if model_rig {
            sensor.ref_to_sensor
        } else {
            Affine3::zero()
        };
        writeln!(f, "ref_to_sensor_transform: {}", affine_to_str(&extr))?;
        writeln!(
            f,
            "depth_to_image_transform: {}",
            affine_to_str(&sensor.depth_to_image)
        )?;
        writeln!(
            f,
            "ref_to_sensor_timestamp_offset: {}",
            fmt_real(sensor.timestamp_offset)
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::Iso3;

    fn sample_rig() -> Rig {
        let nav = Sensor {
            name: "nav_cam".to_string(),
            params: SensorParams::new(
                Vec2::new(621.04422100000001, 621.04422100000001),
                Vec2::new(580.56426899999998, 495.51202200000001),
                Distortion::Fisheye {
                    w: 0.99869300000000002,
                },
                ImageSize::new(1280, 960),
                ImageSize::new(1100, 776),
            )
            .unwrap(),
            ref_to_sensor: Affine3::identity(),
            depth_to_image: Affine3::identity(),
            timestamp_offset: 0.0,
        };
        let haz = Sensor {
            name: "haz_cam".to_string(),
            params: SensorParams::new(
                Vec2::new(210.80636000000001, 210.80636000000001),
                Vec2::new(120.5, 85.25),
                Distortion::from_coeffs(
                    "radtan",
                    &[-0.259498, 0.083842599999999996, 0.00031321599999999999, -0.000346696],
                )
                .unwrap(),
                ImageSize::new(224, 171),
                ImageSize::new(250, 200),
            )
            .unwrap(),
            ref_to_sensor: Affine3::from_iso(&Iso3::translation(0.1, -0.05, 0.02)),
            depth_to_image: Affine3 {
                linear: rig_core::Mat3::identity() * 1.0017,
                translation: rig_core::Vec3::new(0.001, -0.002, 0.003),
            },
            timestamp_offset: -0.02,
        };
        Rig::new(vec![nav, haz], true).unwrap()
    }

    #[test]
    fn write_read_write_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path1 = dir.path().join("rig_config.txt");
        let path2 = dir.path().join("rig_config_again.txt");

        let rig = sample_rig();
        write_rig_config(&path1, &rig, true).unwrap();
        let rig2 = read_rig_config(&path1).unwrap();
        write_rig_config(&path2, &rig2, true).unwrap();

        let bytes1 = fs::read(&path1).unwrap();
        let bytes2 = fs::read(&path2).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn zero_extrinsics_mark_rig_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig_config.txt");
        write_rig_config(&path, &sample_rig(), false).unwrap();
        let rig = read_rig_config(&path).unwrap();
        assert!(!rig.have_rig_transforms());
    }

    #[test]
    fn nonzero_reference_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig_config.txt");
        fs::write(&path, "ref_sensor_id: 1\n").unwrap();
        assert!(read_rig_config(&path).is_err());
    }

    #[test]
    fn distortion_type_and_count_must_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig_config.txt");
        let text = "\
ref_sensor_id: 0

sensor_id: 0
sensor_name: nav_cam
focal_length: 600
optical_center: 320 240
distortion_coeffs: 0.1 0.2
distortion_type: fisheye
image_size: 640 480
undistorted_image_size: 640 480
ref_to_sensor_transform: 1 0 0 0 1 0 0 0 1 0 0 0
depth_to_image_transform: 1 0 0 0 1 0 0 0 1 0 0 0
ref_to_sensor_timestamp_offset: 0
";
        fs::write(&path, text).unwrap();
        assert!(read_rig_config(&path).is_err());
    }

    #[test]
    fn sensor_ids_must_be_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig_config.txt");
        let text = "\
ref_sensor_id: 0

sensor_id: 1
sensor_name: nav_cam
";
        fs::write(&path, text).unwrap();
        assert!(read_rig_config(&path).is_err());
    }
}
