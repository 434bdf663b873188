//! The feature detector interface and a small built-in implementation.
//!
//! Detection proper (SIFT, SURF, ...) is an external concern: anything that
//! yields keypoints with float descriptors can drive the matcher. Detectors
//! must report keypoints in image pixel coordinates, with no internal
//! offset left for the caller to undo.

use image::GrayImage;

/// A detected keypoint, in distorted image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub response: f32,
}

/// A keypoint with its descriptor.
#[derive(Debug, Clone)]
pub struct Feature {
    pub keypoint: KeyPoint,
    pub descriptor: Vec<f32>,
}

/// Interface to an interest-point detector.
pub trait FeatureDetector: Send + Sync {
    fn detect(&self, image: &GrayImage) -> Vec<Feature>;
}

/// Built-in corner detector: Harris-style response over an image pyramid,
/// one strongest keypoint per coarse cell, with mean-free normalized patch
/// descriptors.
///
/// This is a deterministic stand-in for a proper scale-invariant detector;
/// swap in a SIFT-class implementation through [`FeatureDetector`] when
/// matching quality matters more than dependency weight.
#[derive(Debug, Clone)]
pub struct GradientCornerDetector {
    /// Side of the grid cell within which only the strongest corner
    /// survives, in pixels.
    pub cell_size: u32,
    /// Minimum corner response; cells whose best corner falls below this
    /// yield nothing.
    pub min_response: f32,
    /// Number of pyramid levels (each level halves the resolution).
    pub num_levels: u32,
}

impl Default for GradientCornerDetector {
    fn default() -> Self {
        Self {
            cell_size: 24,
            min_response: 50.0,
            num_levels: 3,
        }
    }
}

/// Half-side of the descriptor sampling window.
const PATCH_RADIUS: i64 = 4;

impl GradientCornerDetector {
    fn detect_level(&self, image: &GrayImage, level: u32, out: &mut Vec<Feature>) {
        let (w, h) = image.dimensions();
        if w < 16 || h < 16 {
            return;
        }
        let lv_scale = (1u32 << level) as f32;

        let px = |x: i64, y: i64| -> f32 {
            let x = x.clamp(0, w as i64 - 1) as u32;
            let y = y.clamp(0, h as i64 - 1) as u32;
            image.get_pixel(x, y)[0] as f32
        };

        // Harris response from central-difference gradients, accumulated
        // over a 3x3 window.
        let response = |cx: i64, cy: i64| -> f32 {
            let mut sxx = 0.0;
            let mut syy = 0.0;
            let mut sxy = 0.0;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let gx = 0.5 * (px(cx + dx + 1, cy + dy) - px(cx + dx - 1, cy + dy));
                    let gy = 0.5 * (px(cx + dx, cy + dy + 1) - px(cx + dx, cy + dy - 1));
                    sxx += gx * gx;
                    syy += gy * gy;
                    sxy += gx * gy;
                }
            }
            let det = sxx * syy - sxy * sxy;
            let trace = sxx + syy;
            det - 0.04 * trace * trace
        };

        let margin = PATCH_RADIUS + 1;
        let cells_x = w.div_ceil(self.cell_size);
        let cells_y = h.div_ceil(self.cell_size);

        for cell_y in 0..cells_y {
            for cell_x in 0..cells_x {
                let x0 = (cell_x * self.cell_size) as i64;
                let y0 = (cell_y * self.cell_size) as i64;
                let x1 = (x0 + self.cell_size as i64).min(w as i64);
                let y1 = (y0 + self.cell_size as i64).min(h as i64);

                let mut best: Option<(i64, i64, f32)> = None;
                for y in y0.max(margin)..y1.min(h as i64 - margin) {
                    for x in x0.max(margin)..x1.min(w as i64 - margin) {
                        let r = response(x, y);
                        if r >= self.min_response && best.map_or(true, |(_, _, br)| r > br) {
                            best = Some((x, y, r));
                        }
                    }
                }

                if let Some((x, y, r)) = best {
                    let descriptor = sample_patch(image, x, y);
                    out.push(Feature {
                        keypoint: KeyPoint {
                            x: x as f32 * lv_scale,
                            y: y as f32 * lv_scale,
                            scale: lv_scale,
                            response: r,
                        },
                        descriptor,
                    });
                }
            }
        }
    }
}

fn sample_patch(image: &GrayImage, cx: i64, cy: i64) -> Vec<f32> {
    let (w, h) = image.dimensions();
    let side = (2 * PATCH_RADIUS + 1) as usize;
    let mut vals = Vec::with_capacity(side * side);
    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            let x = (cx + dx).clamp(0, w as i64 - 1) as u32;
            let y = (cy + dy).clamp(0, h as i64 - 1) as u32;
            vals.push(image.get_pixel(x, y)[0] as f32);
        }
    }
    let mean = vals.iter().sum::<f32>() / vals.len() as f32;
    for v in vals.iter_mut() {
        *v -= mean;
    }
    let norm = vals.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-6 {
        for v in vals.iter_mut() {
            *v /= norm;
        }
    }
    vals
}

fn downsample(image: &GrayImage) -> GrayImage {
    let (w, h) = image.dimensions();
    let (nw, nh) = (w / 2, h / 2);
    let mut out = GrayImage::new(nw, nh);
    for y in 0..nh {
        for x in 0..nw {
            let sum = image.get_pixel(2 * x, 2 * y)[0] as u32
                + image.get_pixel(2 * x + 1, 2 * y)[0] as u32
                + image.get_pixel(2 * x, 2 * y + 1)[0] as u32
                + image.get_pixel(2 * x + 1, 2 * y + 1)[0] as u32;
            out.put_pixel(x, y, image::Luma([(sum / 4) as u8]));
        }
    }
    out
}

impl FeatureDetector for GradientCornerDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Feature> {
        let mut features = Vec::new();
        let mut level_image = image.clone();
        for level in 0..self.num_levels {
            if level > 0 {
                level_image = downsample(&level_image);
            }
            self.detect_level(&level_image, level, &mut features);
        }
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checkerboard image with plenty of corners.
    fn checkerboard(w: u32, h: u32, square: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let on = ((x / square) + (y / square)) % 2 == 0;
            image::Luma([if on { 220 } else { 30 }])
        })
    }

    #[test]
    fn detects_checkerboard_corners() {
        let img = checkerboard(128, 96, 16);
        let det = GradientCornerDetector::default();
        let features = det.detect(&img);
        assert!(
            features.len() > 10,
            "expected plenty of corners, got {}",
            features.len()
        );
        for f in &features {
            assert!(f.keypoint.x >= 0.0 && f.keypoint.x < 128.0);
            assert!(f.keypoint.y >= 0.0 && f.keypoint.y < 96.0);
            assert_eq!(f.descriptor.len(), 81);
        }
    }

    #[test]
    fn flat_image_yields_nothing() {
        let img = GrayImage::from_pixel(64, 64, image::Luma([128]));
        let det = GradientCornerDetector::default();
        assert!(det.detect(&img).is_empty());
    }

    #[test]
    fn detection_is_deterministic() {
        let img = checkerboard(96, 96, 12);
        let det = GradientCornerDetector::default();
        let a = det.detect(&img);
        let b = det.detect(&img);
        assert_eq!(a.len(), b.len());
        for (fa, fb) in a.iter().zip(b.iter()) {
            assert_eq!(fa.keypoint, fb.keypoint);
        }
    }

    #[test]
    fn descriptors_are_normalized() {
        let img = checkerboard(64, 64, 8);
        let det = GradientCornerDetector::default();
        for f in det.detect(&img) {
            let norm: f32 = f.descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "norm = {}", norm);
        }
    }
}
