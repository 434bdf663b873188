//! Feature detection, matching, and track building for `rig-refiner`.
//!
//! The detector itself is pluggable through [`FeatureDetector`]; everything
//! downstream of it lives here: the brute-force ratio matcher, the RANSAC
//! affine-2D filter, the pairwise feature graph with its geometric
//! pre-filter, and the union-find track builder.

pub mod detector;
pub mod graph;
pub mod matcher;
pub mod ransac;
pub mod tracks;

pub use detector::{Feature, FeatureDetector, GradientCornerDetector, KeyPoint};
pub use graph::{detect_and_match, FeatureGraph, MatchOptions, MatchingCamera, PairMatches};
pub use matcher::match_descriptors;
pub use ransac::{ransac, Affine2d, Affine2dEstimator, Estimator, RansacOptions};
pub use tracks::{build_tracks, Track};
