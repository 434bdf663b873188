//! Nonlinear least-squares machinery for `rig-refiner`.
//!
//! The problem is described backend-agnostically as a [`ProblemIR`]: typed
//! parameter blocks (with manifolds, per-index freezing, and bounds) plus
//! residual blocks referencing them. The solver itself sits behind
//! [`OptimBackend`]; the shipped backend compiles the IR for tiny-solver's
//! Levenberg–Marquardt optimizer, which differentiates the generic residual
//! evaluators in [`factors`] with dual numbers.

pub mod backend;
pub mod factors;
pub mod ir;
pub mod params;

pub use backend::{solve, BackendSolution, BackendSolveOptions, LinearSolverKind, OptimBackend};
pub use ir::{
    Bound, BracketStamps, DistortionKind, FactorKind, FixedMask, ManifoldKind, ParamBlock,
    ParamId, ProblemIR, ResidualBlock, RobustLoss,
};
pub use params::{affine_to_dvec, dvec_to_affine, dvec_to_iso3, iso3_to_dvec};
