//! Registration inputs: hugin `.pto` control points and the file of
//! measured world coordinates.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Result};
use rig_core::{Pt3, Real, Vec2};

use crate::error::IoError;

/// One control point: the same world feature marked in two images.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPoint {
    pub left_image: usize,
    pub right_image: usize,
    pub left_pixel: Vec2,
    pub right_pixel: Vec2,
}

/// Parse a hugin project file: `i`-lines name the images, `c`-lines carry
/// the control points. Returns the image names and the points.
pub fn read_control_points(path: &Path) -> Result<(Vec<String>, Vec<ControlPoint>)> {
    let file = fs::File::open(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut images = Vec::new();
    let mut points = Vec::new();

    for line in BufReader::new(file).lines() {
        let line = line?;

        if line.starts_with("i ") {
            // The image name sits in the n"..." field.
            let Some(pos) = line.find("n\"") else {
                bail!(IoError::Parse {
                    what: "hugin image line",
                    path: path.display().to_string(),
                    line,
                });
            };
            let rest = &line[pos + 2..];
            let Some(end) = rest.find('"') else {
                bail!(IoError::Parse {
                    what: "hugin image line",
                    path: path.display().to_string(),
                    line,
                });
            };
            images.push(rest[..end].to_string());
        } else if line.starts_with("c ") {
            // A line like `c n0 N1 x367 y240 X144.18 Y243.04 t0`; strip the
            // letters and read six numbers: left and right image indices,
            // then the two pixels.
            let stripped: String = line
                .chars()
                .map(|c| if c.is_ascii_alphabetic() { ' ' } else { c })
                .collect();
            let vals: Vec<Real> = stripped
                .split_whitespace()
                .map(|t| t.parse::<Real>())
                .collect::<Result<_, _>>()
                .map_err(|_| IoError::Parse {
                    what: "hugin control point",
                    path: path.display().to_string(),
                    line: line.clone(),
                })?;
            if vals.len() < 6 {
                bail!(IoError::Parse {
                    what: "hugin control point",
                    path: path.display().to_string(),
                    line,
                });
            }
            let left_image = vals[0] as usize;
            let right_image = vals[1] as usize;
            if left_image == right_image {
                bail!(
                    "the left and right images of a control point must be distinct, \
                     offending line in {}: {}",
                    path.display(),
                    line
                );
            }
            points.push(ControlPoint {
                left_image,
                right_image,
                left_pixel: Vec2::new(vals[2], vals[3]),
                right_pixel: Vec2::new(vals[4], vals[5]),
            });
        }
    }

    Ok((images, points))
}

/// Parse the measured world coordinates: one `x y z` triple per line,
/// commas allowed as separators, `#` comments and blank lines skipped.
pub fn read_xyz_measurements(path: &Path) -> Result<Vec<Pt3>> {
    let file = fs::File::open(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut xyz = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let cleaned = line.replace(',', " ");
        let trimmed = cleaned.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let vals: Vec<Real> = trimmed
            .split_whitespace()
            .map(|t| t.parse::<Real>())
            .collect::<Result<_, _>>()
            .map_err(|_| IoError::Parse {
                what: "xyz measurement",
                path: path.display().to_string(),
                line: line.clone(),
            })?;
        if vals.len() != 3 {
            bail!(IoError::Parse {
                what: "xyz measurement",
                path: path.display().to_string(),
                line,
            });
        }
        xyz.push(Pt3::new(vals[0], vals[1], vals[2]));
    }
    Ok(xyz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hugin_images_and_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg.pto");
        fs::write(
            &path,
            "# hugin project file\n\
             i w1280 h960 f0 n\"nav_cam/10.5.jpg\"\n\
             i w1280 h960 f0 n\"nav_cam/11.5.jpg\"\n\
             c n0 N1 x367.5 y240 X144.25 Y243.75 t0\n",
        )
        .unwrap();

        let (images, points) = read_control_points(&path).unwrap();
        assert_eq!(images, vec!["nav_cam/10.5.jpg", "nav_cam/11.5.jpg"]);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].left_image, 0);
        assert_eq!(points[0].right_image, 1);
        assert_eq!(points[0].left_pixel, Vec2::new(367.5, 240.0));
        assert_eq!(points[0].right_pixel, Vec2::new(144.25, 243.75));
    }

    #[test]
    fn same_image_control_point_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg.pto");
        fs::write(&path, "c n0 N0 x1 y2 X3 Y4 t0\n").unwrap();
        assert!(read_control_points(&path).is_err());
    }

    #[test]
    fn parses_xyz_with_commas_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.xyz");
        fs::write(&path, "# measured\n1.0, 2.0, 3.0\n\n4 5 6\n").unwrap();
        let xyz = read_xyz_measurements(&path).unwrap();
        assert_eq!(xyz, vec![Pt3::new(1.0, 2.0, 3.0), Pt3::new(4.0, 5.0, 6.0)]);
    }

    #[test]
    fn short_xyz_line_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.xyz");
        fs::write(&path, "1.0 2.0\n").unwrap();
        assert!(read_xyz_measurements(&path).is_err());
    }
}
