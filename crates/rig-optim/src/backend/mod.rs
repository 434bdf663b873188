//! Solver backends.
//!
//! The nonlinear solver is an external collaborator consumed through the
//! [`OptimBackend`] trait; the refinement pipeline only ever sees a
//! [`ProblemIR`], initial values, and the solved values that come back.

mod tiny_solver_backend;

use std::collections::HashMap;

use anyhow::Result;
use nalgebra::DVector;

use crate::ir::ProblemIR;

pub use tiny_solver_backend::TinySolverBackend;

/// Sparse linear solver choice inside the trust-region iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverKind {
    SparseCholesky,
    SparseQR,
}

/// Options forwarded to the backend solver.
#[derive(Debug, Clone)]
pub struct BackendSolveOptions {
    pub max_iters: usize,
    pub verbosity: usize,
    /// Threads the solver may use internally. The parameter arrays belong
    /// to the solver for the duration of the call.
    pub num_threads: usize,
    pub linear_solver: LinearSolverKind,
    /// Gradient-style stop: minimum absolute cost decrease.
    pub min_abs_decrease: f64,
    /// Parameter-tolerance stop: minimum relative cost decrease.
    pub min_rel_decrease: f64,
    /// Stop outright below this cost.
    pub min_error: f64,
}

impl Default for BackendSolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 20,
            verbosity: 0,
            num_threads: 16,
            linear_solver: LinearSolverKind::SparseCholesky,
            min_abs_decrease: 1e-16,
            min_rel_decrease: 1e-12,
            min_error: 1e-16,
        }
    }
}

/// Solved parameter values plus the final cost.
#[derive(Debug, Clone)]
pub struct BackendSolution {
    pub params: HashMap<String, DVector<f64>>,
    pub final_cost: f64,
}

/// A nonlinear least-squares backend.
pub trait OptimBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
    ) -> Result<BackendSolution>;
}

/// Solve with the default backend.
pub fn solve(
    ir: &ProblemIR,
    initial: &HashMap<String, DVector<f64>>,
    opts: &BackendSolveOptions,
) -> Result<BackendSolution> {
    TinySolverBackend.solve(ir, initial, opts)
}
