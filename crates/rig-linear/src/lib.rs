//! Linear (non-iterative) geometry for `rig-refiner`.
//!
//! - DLT triangulation of a point from two or more views
//!   ([`triangulate_pair`], [`triangulate_nview`]),
//! - closed-form similarity fitting between point sets and the transform
//!   application helpers used by registration ([`fit_similarity`],
//!   [`transform_cameras`], ...).

pub mod similarity;
pub mod triangulation;

pub use similarity::*;
pub use triangulation::*;
