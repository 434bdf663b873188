//! Core geometry and camera primitives for `rig-refiner`.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec2`, `Pt3`, ...) and a 3x4
//!   affine transform type,
//! - the polymorphic lens distortion model (`Distortion`),
//! - per-sensor camera parameters (`SensorParams`) and the rig model
//!   (`Rig`, `Sensor`),
//! - bracketed pose interpolation across sensor clocks.
//!
//! Higher-level algorithms live in `rig-linear`, `rig-features`,
//! `rig-optim`, and `rig-pipeline`.

/// Linear algebra type aliases and the affine transform type.
pub mod math;
/// Lens distortion models.
pub mod distortion;
/// Per-sensor camera parameters.
pub mod camera;
/// The rig model: sensor table with reference-sensor invariants.
pub mod rig;
/// Bracketed pose interpolation.
pub mod interp;

pub use camera::*;
pub use distortion::*;
pub use interp::*;
pub use math::*;
pub use rig::*;
