//! The pairwise feature graph: detection, matching with a geometric
//! pre-filter, and keypoint unification.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use image::GrayImage;
use log::{debug, info};
use rayon::prelude::*;
use rig_core::{Iso3, Real, SensorParams, Vec2};
use rig_linear::triangulate_pair;

use crate::detector::FeatureDetector;
use crate::matcher::{match_descriptors, DEFAULT_RATIO};
use crate::ransac::{filter_matches_affine2d, RansacOptions};

/// One image entering the feature graph, with the state needed for the
/// geometric pre-filter.
pub struct MatchingCamera<'a> {
    pub image: &'a GrayImage,
    pub params: &'a SensorParams,
    pub world_to_cam: Iso3,
}

/// Options controlling detection and matching.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Match image `i` against `i+1 ..= i+num_overlaps`.
    pub num_overlaps: usize,
    /// Pre-filter threshold on the reprojection of the pairwise
    /// triangulation, in pixels. Deliberately loose: the initial cameras
    /// may be poor.
    pub initial_max_reprojection_error: Real,
    /// Worker threads for detection and matching.
    pub num_threads: usize,
    /// Lowe ratio for the descriptor matcher.
    pub ratio: f32,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            num_overlaps: 10,
            initial_max_reprojection_error: 300.0,
            num_threads: 8,
            ratio: DEFAULT_RATIO,
        }
    }
}

/// Matches of one image pair, as raw distorted pixel pairs.
pub type PairMatches = Vec<(Vec2, Vec2)>;

/// Output of [`detect_and_match`].
pub struct FeatureGraph {
    /// Per image, the unified keypoint table: `keypoints[cid][fid]` is a
    /// distorted pixel.
    pub keypoints: Vec<Vec<(f32, f32)>>,
    /// Per image pair `(cid_left, cid_right)`, matches as `(fid, fid)`.
    pub matches: BTreeMap<(usize, usize), Vec<(usize, usize)>>,
    /// The same matches as raw pixel pairs, for saving match files.
    pub pixel_matches: BTreeMap<(usize, usize), PairMatches>,
}

/// Detect features in every image and match all overlapping pairs.
///
/// Detection runs one task per image and matching one task per pair on a
/// bounded worker pool; the shared match map is the only cross-thread
/// structure and is written under a single lock, once per finished pair.
pub fn detect_and_match(
    cams: &[MatchingCamera],
    detector: &dyn FeatureDetector,
    opts: &MatchOptions,
) -> Result<FeatureGraph> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.num_threads.max(1))
        .build()
        .context("failed to build the matching thread pool")?;

    info!("detecting features in {} images", cams.len());
    let features: Vec<_> = pool.install(|| {
        cams.par_iter()
            .map(|cam| detector.detect(cam.image))
            .collect()
    });

    let mut pairs = Vec::new();
    for i in 0..cams.len() {
        for j in (i + 1)..cams.len().min(i + opts.num_overlaps + 1) {
            pairs.push((i, j));
        }
    }

    info!("matching {} image pairs", pairs.len());
    let matches = Mutex::new(BTreeMap::<(usize, usize), PairMatches>::new());
    pool.install(|| {
        pairs.par_iter().for_each(|&(i, j)| {
            let pair = match_pair(&cams[i], &cams[j], &features[i], &features[j], opts, (i, j));
            if !pair.is_empty() {
                let mut map = matches.lock().expect("match map lock poisoned");
                map.insert((i, j), pair);
            }
        });
    });
    let pixel_matches = matches.into_inner().expect("match map lock poisoned");

    Ok(unify_keypoints(cams.len(), pixel_matches))
}

/// Match one image pair: descriptor matching, geometric pre-filter, then
/// RANSAC affine-2D.
fn match_pair(
    left: &MatchingCamera,
    right: &MatchingCamera,
    left_features: &[crate::detector::Feature],
    right_features: &[crate::detector::Feature],
    opts: &MatchOptions,
    pair: (usize, usize),
) -> PairMatches {
    let left_desc: Vec<Vec<f32>> = left_features.iter().map(|f| f.descriptor.clone()).collect();
    let right_desc: Vec<Vec<f32>> = right_features
        .iter()
        .map(|f| f.descriptor.clone())
        .collect();

    let candidates = match_descriptors(&left_desc, &right_desc, opts.ratio);

    // Geometric pre-filter with the current cameras: triangulate each
    // tentative match and discard it when its reprojection disagrees.
    let mut filtered: PairMatches = Vec::new();
    for (li, ri) in candidates {
        let lk = &left_features[li].keypoint;
        let rk = &right_features[ri].keypoint;
        let dist_left = Vec2::new(lk.x as Real, lk.y as Real);
        let dist_right = Vec2::new(rk.x as Real, rk.y as Real);

        if passes_reprojection_filter(left, right, &dist_left, &dist_right, opts) {
            filtered.push((dist_left, dist_right));
        }
    }

    if filtered.is_empty() {
        return filtered;
    }

    let ransac_opts = RansacOptions::default();
    let inliers = filter_matches_affine2d(&filtered, &ransac_opts);
    let kept: PairMatches = inliers.iter().map(|&k| filtered[k]).collect();
    debug!(
        "pair {} {}: {} matches after filtering",
        pair.0,
        pair.1,
        kept.len()
    );
    kept
}

fn passes_reprojection_filter(
    left: &MatchingCamera,
    right: &MatchingCamera,
    dist_left: &Vec2,
    dist_right: &Vec2,
    opts: &MatchOptions,
) -> bool {
    let undist_left = left.params.undistort_pixel(dist_left);
    let undist_right = right.params.undistort_pixel(dist_right);

    let Ok(x) = triangulate_pair(
        left.params.focal_length(),
        right.params.focal_length(),
        &left.world_to_cam,
        &right.world_to_cam,
        &undist_left,
        &undist_right,
    ) else {
        return false;
    };

    let reproj = |cam: &MatchingCamera, observed: &Vec2| -> bool {
        let pc = cam.world_to_cam.transform_point(&x);
        match cam.params.project(&pc.coords) {
            // NaN residuals compare false and are rejected here too.
            Some(pix) => (pix - observed).norm() <= opts.initial_max_reprojection_error,
            None => false,
        }
    };

    reproj(left, dist_left) && reproj(right, dist_right)
}

/// Assign a stable feature id to every distinct keypoint of every image
/// and rewrite the matches in terms of those ids.
///
/// Ids come from a sorted map over the pixel bit patterns, so the result
/// does not depend on the thread count or pair completion order.
fn unify_keypoints(
    num_images: usize,
    pixel_matches: BTreeMap<(usize, usize), PairMatches>,
) -> FeatureGraph {
    let mut keypoint_maps: Vec<BTreeMap<(u32, u32), usize>> = vec![BTreeMap::new(); num_images];

    let key = |p: &Vec2| ((p.x as f32).to_bits(), (p.y as f32).to_bits());

    for (&(ci, cj), pair) in pixel_matches.iter() {
        for (l, r) in pair {
            keypoint_maps[ci].insert(key(l), 0);
            keypoint_maps[cj].insert(key(r), 0);
        }
    }

    let mut keypoints: Vec<Vec<(f32, f32)>> = Vec::with_capacity(num_images);
    for map in keypoint_maps.iter_mut() {
        let mut vec = Vec::with_capacity(map.len());
        for (fid, (bits, id)) in map.iter_mut().enumerate() {
            *id = fid;
            vec.push((f32::from_bits(bits.0), f32::from_bits(bits.1)));
        }
        keypoints.push(vec);
    }

    let mut matches = BTreeMap::new();
    for (&(ci, cj), pair) in pixel_matches.iter() {
        let fids: Vec<(usize, usize)> = pair
            .iter()
            .map(|(l, r)| (keypoint_maps[ci][&key(l)], keypoint_maps[cj][&key(r)]))
            .collect();
        matches.insert((ci, cj), fids);
    }

    FeatureGraph {
        keypoints,
        matches,
        pixel_matches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unification_assigns_stable_ids() {
        let mut pm = BTreeMap::new();
        pm.insert(
            (0usize, 1usize),
            vec![
                (Vec2::new(10.0, 20.0), Vec2::new(11.0, 21.0)),
                (Vec2::new(30.0, 40.0), Vec2::new(31.0, 41.0)),
            ],
        );
        pm.insert(
            (1usize, 2usize),
            vec![(Vec2::new(11.0, 21.0), Vec2::new(12.0, 22.0))],
        );

        let graph = unify_keypoints(3, pm);

        assert_eq!(graph.keypoints[0].len(), 2);
        assert_eq!(graph.keypoints[1].len(), 2);
        assert_eq!(graph.keypoints[2].len(), 1);

        // The shared keypoint (11, 21) in image 1 must resolve to the same
        // fid on the right of pair (0, 1) and the left of pair (1, 2).
        let m01 = &graph.matches[&(0, 1)];
        let m12 = &graph.matches[&(1, 2)];
        let shared = graph.keypoints[1]
            .iter()
            .position(|&(x, y)| x == 11.0 && y == 21.0)
            .unwrap();
        assert!(m01.iter().any(|&(_, r)| r == shared));
        assert_eq!(m12[0].0, shared);
    }

    #[test]
    fn keypoint_table_matches_pixel_values() {
        let mut pm = BTreeMap::new();
        pm.insert(
            (0usize, 1usize),
            vec![(Vec2::new(5.5, 7.25), Vec2::new(8.0, 9.0))],
        );
        let graph = unify_keypoints(2, pm);
        let (fid_l, fid_r) = graph.matches[&(0, 1)][0];
        assert_eq!(graph.keypoints[0][fid_l], (5.5, 7.25));
        assert_eq!(graph.keypoints[1][fid_r], (8.0, 9.0));
    }
}
