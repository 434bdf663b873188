//! tiny-solver backend adapter.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use nalgebra::DVector;
use tiny_solver::factors::Factor;
use tiny_solver::loss_functions::{CauchyLoss, HuberLoss, Loss};
use tiny_solver::manifold::se3::SE3Manifold;
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::problem::Problem;
use tiny_solver::{linear::sparse::LinearSolverType, LevenbergMarquardtOptimizer};

use crate::backend::{BackendSolution, BackendSolveOptions, LinearSolverKind, OptimBackend};
use crate::factors::{
    bracketed_depth_mesh_residual, bracketed_depth_tri_residual, bracketed_reproj_residual,
    point_prior_residual,
};
use crate::ir::{
    BracketStamps, DistortionKind, FactorKind, ManifoldKind, ProblemIR, ResidualBlock, RobustLoss,
};

/// Compiles a [`ProblemIR`] into a tiny-solver problem and runs its
/// Levenberg–Marquardt optimizer.
#[derive(Debug, Clone, Copy)]
pub struct TinySolverBackend;

impl TinySolverBackend {
    fn compile(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
    ) -> Result<Problem> {
        ir.validate()?;

        let mut problem = Problem::new();

        for param in &ir.params {
            let init = initial.get(&param.name).ok_or_else(|| {
                anyhow!("initial values missing parameter {}", param.name)
            })?;
            ensure!(
                init.len() == param.dim,
                "initial dimension mismatch for {}: expected {}, got {}",
                param.name,
                param.dim,
                init.len()
            );

            match param.manifold {
                ManifoldKind::Euclidean => {
                    for idx in param.fixed.iter() {
                        problem.fix_variable(&param.name, idx);
                    }
                }
                ManifoldKind::SE3 => {
                    if param.fixed.is_empty() {
                        problem.set_variable_manifold(&param.name, Arc::new(SE3Manifold));
                    } else if param.fixed.is_all_fixed(param.dim) {
                        // No manifold: the block is frozen element-wise.
                        for idx in param.fixed.iter() {
                            problem.fix_variable(&param.name, idx);
                        }
                    } else {
                        return Err(anyhow!(
                            "cannot partially fix SE3 block {}",
                            param.name
                        ));
                    }
                }
            }

            if let Some(bounds) = &param.bounds {
                for bound in bounds {
                    problem.set_variable_bounds(&param.name, bound.idx, bound.lower, bound.upper);
                }
            }
        }

        for residual in &ir.residuals {
            let (factor, loss) = compile_factor(residual)?;
            let param_names: Vec<String> = residual
                .params
                .iter()
                .map(|id| ir[*id].name.clone())
                .collect();
            let param_refs: Vec<&str> = param_names.iter().map(|s| s.as_str()).collect();
            problem.add_residual_block(
                residual.factor.residual_dim(),
                &param_refs,
                factor,
                loss,
            );
        }

        Ok(problem)
    }
}

impl OptimBackend for TinySolverBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
    ) -> Result<BackendSolution> {
        let problem = self.compile(ir, initial)?;
        let optimizer = LevenbergMarquardtOptimizer::default();
        let options = to_optimizer_options(opts);

        // The solver parallelizes internally; give it its own pool so the
        // configured thread count holds.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.num_threads.max(1))
            .build()
            .context("failed to build the solver thread pool")?;
        let solution = pool
            .install(|| optimizer.optimize(&problem, initial, Some(options)))
            .ok_or_else(|| anyhow!("the solver failed to converge"))?;

        let param_blocks = problem.initialize_parameter_blocks(&solution);
        let residuals = problem.compute_residuals(&param_blocks, true);
        let final_cost = 0.5 * residuals.as_ref().squared_norm_l2();

        Ok(BackendSolution {
            params: solution,
            final_cost,
        })
    }
}

fn to_optimizer_options(opts: &BackendSolveOptions) -> OptimizerOptions {
    OptimizerOptions {
        max_iteration: opts.max_iters,
        verbosity_level: opts.verbosity,
        linear_solver_type: match opts.linear_solver {
            LinearSolverKind::SparseCholesky => LinearSolverType::SparseCholesky,
            LinearSolverKind::SparseQR => LinearSolverType::SparseQR,
        },
        min_abs_error_decrease_threshold: opts.min_abs_decrease,
        min_rel_error_decrease_threshold: opts.min_rel_decrease,
        min_error_threshold: opts.min_error,
        ..OptimizerOptions::default()
    }
}

fn compile_loss(loss: RobustLoss) -> Result<Option<Box<dyn Loss + Send>>> {
    match loss {
        RobustLoss::None => Ok(None),
        RobustLoss::Huber { scale } => {
            ensure!(scale > 0.0, "Huber scale must be positive");
            Ok(Some(Box::new(HuberLoss::new(scale))))
        }
        RobustLoss::Cauchy { scale } => {
            ensure!(scale > 0.0, "Cauchy scale must be positive");
            Ok(Some(Box::new(CauchyLoss::new(scale))))
        }
    }
}

type CompiledFactor = (
    Box<dyn tiny_solver::factors::FactorImpl + Send>,
    Option<Box<dyn Loss + Send>>,
);

fn compile_factor(residual: &ResidualBlock) -> Result<CompiledFactor> {
    let loss = compile_loss(residual.loss)?;
    let factor: Box<dyn tiny_solver::factors::FactorImpl + Send> = match &residual.factor {
        FactorKind::BracketedReproj {
            pixel,
            stamps,
            distortion,
        } => Box::new(TinyReprojFactor {
            pixel: *pixel,
            stamps: *stamps,
            kind: *distortion,
        }),
        FactorKind::BracketedDepthTri {
            depth_xyz,
            stamps,
            weight,
            affine,
        } => Box::new(TinyDepthTriFactor {
            depth_xyz: *depth_xyz,
            stamps: *stamps,
            weight: *weight,
            affine: *affine,
        }),
        FactorKind::BracketedDepthMesh {
            depth_xyz,
            mesh_xyz,
            stamps,
            weight,
            affine,
        } => Box::new(TinyDepthMeshFactor {
            depth_xyz: *depth_xyz,
            mesh_xyz: *mesh_xyz,
            stamps: *stamps,
            weight: *weight,
            affine: *affine,
        }),
        FactorKind::PointPrior { target, weight } => Box::new(TinyPointPriorFactor {
            target: *target,
            weight: *weight,
        }),
    };
    Ok((factor, loss))
}

#[derive(Debug, Clone)]
struct TinyReprojFactor {
    pixel: [f64; 2],
    stamps: BracketStamps,
    kind: DistortionKind,
}

impl<T: nalgebra::RealField> Factor<T> for TinyReprojFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(
            params.len(),
            8,
            "expected [beg, end, extr, point, offset, focal, center, dist]"
        );
        let r = bracketed_reproj_residual(
            params[0].as_view(),
            params[1].as_view(),
            params[2].as_view(),
            params[3].as_view(),
            params[4].as_view(),
            params[5].as_view(),
            params[6].as_view(),
            params[7].as_view(),
            self.pixel,
            &self.stamps,
            self.kind,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyDepthTriFactor {
    depth_xyz: [f64; 3],
    stamps: BracketStamps,
    weight: f64,
    affine: bool,
}

impl<T: nalgebra::RealField> Factor<T> for TinyDepthTriFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(
            params.len(),
            7,
            "expected [beg, end, extr, depth_to_image, scale, point, offset]"
        );
        let r = bracketed_depth_tri_residual(
            params[0].as_view(),
            params[1].as_view(),
            params[2].as_view(),
            params[3].as_view(),
            params[4].as_view(),
            params[5].as_view(),
            params[6].as_view(),
            self.depth_xyz,
            &self.stamps,
            self.weight,
            self.affine,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyDepthMeshFactor {
    depth_xyz: [f64; 3],
    mesh_xyz: [f64; 3],
    stamps: BracketStamps,
    weight: f64,
    affine: bool,
}

impl<T: nalgebra::RealField> Factor<T> for TinyDepthMeshFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(
            params.len(),
            6,
            "expected [beg, end, extr, depth_to_image, scale, offset]"
        );
        let r = bracketed_depth_mesh_residual(
            params[0].as_view(),
            params[1].as_view(),
            params[2].as_view(),
            params[3].as_view(),
            params[4].as_view(),
            params[5].as_view(),
            self.depth_xyz,
            self.mesh_xyz,
            &self.stamps,
            self.weight,
            self.affine,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyPointPriorFactor {
    target: [f64; 3],
    weight: f64,
}

impl<T: nalgebra::RealField> Factor<T> for TinyPointPriorFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 1, "expected [point]");
        let r = point_prior_residual(params[0].as_view(), self.target, self.weight);
        DVector::from_row_slice(r.as_slice())
    }
}
