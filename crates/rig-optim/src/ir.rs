//! Backend-independent representation of the refinement problem.

use anyhow::{anyhow, ensure, Result};
use std::collections::HashSet;

/// Identifier for a parameter block in the IR, stable within one
/// [`ProblemIR`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

/// Supported manifolds for parameter blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifoldKind {
    /// Standard Euclidean vector space.
    Euclidean,
    /// SE(3) pose stored as `[qx, qy, qz, qw, tx, ty, tz]`.
    SE3,
}

impl ManifoldKind {
    pub fn compatible_dim(self, dim: usize) -> bool {
        match self {
            ManifoldKind::Euclidean => true,
            ManifoldKind::SE3 => dim == 7,
        }
    }
}

/// Box bounds for a single parameter index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub idx: usize,
    pub lower: f64,
    pub upper: f64,
}

/// Fixed-index mask of a parameter block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixedMask {
    fixed_indices: HashSet<usize>,
}

impl FixedMask {
    pub fn all_free() -> Self {
        Self::default()
    }

    pub fn all_fixed(dim: usize) -> Self {
        Self {
            fixed_indices: (0..dim).collect(),
        }
    }

    pub fn fix_indices(indices: &[usize]) -> Self {
        Self {
            fixed_indices: indices.iter().copied().collect(),
        }
    }

    pub fn is_all_fixed(&self, dim: usize) -> bool {
        self.fixed_indices.len() == dim
    }

    pub fn is_empty(&self) -> bool {
        self.fixed_indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.fixed_indices.iter().copied()
    }
}

/// Robust loss applied to one residual block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RobustLoss {
    #[default]
    None,
    Huber {
        scale: f64,
    },
    Cauchy {
        scale: f64,
    },
}

/// Distortion kind carried by a reprojection factor. The coefficient block
/// length alone cannot distinguish a fisheye sensor from the frozen
/// placeholder a distortion-free sensor gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistortionKind {
    None,
    Fisheye,
    RadTan,
}

impl DistortionKind {
    fn compatible_block_dim(self, dim: usize) -> bool {
        match self {
            // A 1-long frozen placeholder stands in for "no coefficients".
            DistortionKind::None => dim == 1,
            DistortionKind::Fisheye => dim == 1,
            DistortionKind::RadTan => dim == 4 || dim == 5,
        }
    }
}

/// Timestamps shared by every bracketed factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BracketStamps {
    /// Left bracketing reference timestamp (reference clock).
    pub beg: f64,
    /// Right bracketing reference timestamp. Equal to `beg` for the
    /// reference sensor and for independently-posed cameras.
    pub end: f64,
    /// The observation's own timestamp (its sensor's clock).
    pub cam: f64,
}

impl BracketStamps {
    pub fn bracketed(&self) -> bool {
        self.beg != self.end
    }
}

/// Factor kinds. Each implies its parameter layout and residual dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorKind {
    /// Pixel reprojection through the bracketed camera model.
    ///
    /// Parameters: `[beg_pose, end_pose, extr, point, offset, focal,
    /// center, distortion]`. Residual: predicted − observed distorted
    /// pixel.
    BracketedReproj {
        /// Observed distorted pixel.
        pixel: [f64; 2],
        stamps: BracketStamps,
        distortion: DistortionKind,
    },
    /// Depth measurement against the triangulated point.
    ///
    /// Parameters: `[beg_pose, end_pose, extr, depth_to_image, scale,
    /// point, offset]`. Residual: `w · (X − M_world)`.
    BracketedDepthTri {
        depth_xyz: [f64; 3],
        stamps: BracketStamps,
        weight: f64,
        /// Whether `depth_to_image` is a 12-parameter affine block rather
        /// than a rigid SE(3) block.
        affine: bool,
    },
    /// Depth measurement against a mesh intersection.
    ///
    /// Parameters: `[beg_pose, end_pose, extr, depth_to_image, scale,
    /// offset]`. Residual: `w · (mesh − M_world)`.
    BracketedDepthMesh {
        depth_xyz: [f64; 3],
        mesh_xyz: [f64; 3],
        stamps: BracketStamps,
        weight: f64,
        affine: bool,
    },
    /// Pull a world point toward a fixed target (the track's averaged mesh
    /// intersection).
    ///
    /// Parameters: `[point]`. Residual: `w · (target − X)`.
    PointPrior { target: [f64; 3], weight: f64 },
}

impl FactorKind {
    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::BracketedReproj { .. } => 2,
            FactorKind::BracketedDepthTri { .. } => 3,
            FactorKind::BracketedDepthMesh { .. } => 3,
            FactorKind::PointPrior { .. } => 3,
        }
    }
}

/// Parameter block definition.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub id: ParamId,
    pub name: String,
    pub dim: usize,
    pub manifold: ManifoldKind,
    pub fixed: FixedMask,
    pub bounds: Option<Vec<Bound>>,
}

/// Residual block definition. The order of `params` must match the
/// factor's expected layout.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub params: Vec<ParamId>,
    pub loss: RobustLoss,
    pub factor: FactorKind,
}

/// The backend-agnostic problem.
#[derive(Debug, Default, Clone)]
pub struct ProblemIR {
    pub params: Vec<ParamBlock>,
    pub residuals: Vec<ResidualBlock>,
}

impl ProblemIR {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_param_block(
        &mut self,
        name: impl Into<String>,
        dim: usize,
        manifold: ManifoldKind,
        fixed: FixedMask,
        bounds: Option<Vec<Bound>>,
    ) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(ParamBlock {
            id,
            name: name.into(),
            dim,
            manifold,
            fixed,
            bounds,
        });
        id
    }

    pub fn add_residual_block(&mut self, residual: ResidualBlock) {
        self.residuals.push(residual);
    }

    pub fn param_by_name(&self, name: &str) -> Option<ParamId> {
        self.params.iter().find(|p| p.name == name).map(|p| p.id)
    }

    fn check_se3(&self, id: ParamId, what: &str) -> Result<()> {
        let p = &self.params[id.0];
        ensure!(
            p.dim == 7 && p.manifold == ManifoldKind::SE3,
            "{} expects a 7D SE3 block, got dim={} manifold={:?} for {}",
            what,
            p.dim,
            p.manifold,
            p.name
        );
        Ok(())
    }

    fn check_euclidean(&self, id: ParamId, dim: usize, what: &str) -> Result<()> {
        let p = &self.params[id.0];
        ensure!(
            p.dim == dim && p.manifold == ManifoldKind::Euclidean,
            "{} expects a {}D Euclidean block, got dim={} manifold={:?} for {}",
            what,
            dim,
            p.dim,
            p.manifold,
            p.name
        );
        Ok(())
    }

    fn check_depth_to_image(&self, id: ParamId, affine: bool, what: &str) -> Result<()> {
        if affine {
            self.check_euclidean(id, 12, what)
        } else {
            self.check_se3(id, what)
        }
    }

    /// Validate internal consistency and factor layouts.
    pub fn validate(&self) -> Result<()> {
        for (idx, param) in self.params.iter().enumerate() {
            ensure!(
                param.id.0 == idx,
                "param id mismatch: expected {}, got {:?}",
                idx,
                param.id
            );
            ensure!(
                param.manifold.compatible_dim(param.dim),
                "param {} manifold {:?} incompatible with dim {}",
                param.name,
                param.manifold,
                param.dim
            );
            for fixed_idx in param.fixed.iter() {
                ensure!(
                    fixed_idx < param.dim,
                    "param {} fixed index {} out of range",
                    param.name,
                    fixed_idx
                );
            }
            if let Some(bounds) = &param.bounds {
                for bound in bounds {
                    ensure!(
                        bound.idx < param.dim,
                        "param {} bound index {} out of range",
                        param.name,
                        bound.idx
                    );
                    ensure!(
                        bound.lower <= bound.upper,
                        "param {} bound lower {} > upper {}",
                        param.name,
                        bound.lower,
                        bound.upper
                    );
                }
            }
        }

        for (r_idx, residual) in self.residuals.iter().enumerate() {
            for param in &residual.params {
                ensure!(
                    param.0 < self.params.len(),
                    "residual {} references missing param {:?}",
                    r_idx,
                    param
                );
            }

            match &residual.factor {
                FactorKind::BracketedReproj { distortion, stamps, .. } => {
                    ensure!(
                        residual.params.len() == 8,
                        "bracketed reprojection requires 8 params \
                         [beg, end, extr, point, offset, focal, center, dist]"
                    );
                    self.check_se3(residual.params[0], "bracketed reprojection (beg)")?;
                    self.check_se3(residual.params[1], "bracketed reprojection (end)")?;
                    self.check_se3(residual.params[2], "bracketed reprojection (extr)")?;
                    self.check_euclidean(residual.params[3], 3, "bracketed reprojection (point)")?;
                    self.check_euclidean(residual.params[4], 1, "bracketed reprojection (offset)")?;
                    self.check_euclidean(residual.params[5], 1, "bracketed reprojection (focal)")?;
                    self.check_euclidean(residual.params[6], 2, "bracketed reprojection (center)")?;
                    let dist = &self.params[residual.params[7].0];
                    ensure!(
                        distortion.compatible_block_dim(dist.dim)
                            && dist.manifold == ManifoldKind::Euclidean,
                        "distortion block {} has dim {} incompatible with {:?}",
                        dist.name,
                        dist.dim,
                        distortion
                    );
                    ensure!(
                        stamps.beg <= stamps.end,
                        "residual {} has reversed bracket stamps",
                        r_idx
                    );
                }
                FactorKind::BracketedDepthTri { affine, .. } => {
                    ensure!(
                        residual.params.len() == 7,
                        "bracketed depth requires 7 params \
                         [beg, end, extr, depth_to_image, scale, point, offset]"
                    );
                    self.check_se3(residual.params[0], "bracketed depth (beg)")?;
                    self.check_se3(residual.params[1], "bracketed depth (end)")?;
                    self.check_se3(residual.params[2], "bracketed depth (extr)")?;
                    self.check_depth_to_image(
                        residual.params[3],
                        *affine,
                        "bracketed depth (depth_to_image)",
                    )?;
                    self.check_euclidean(residual.params[4], 1, "bracketed depth (scale)")?;
                    self.check_euclidean(residual.params[5], 3, "bracketed depth (point)")?;
                    self.check_euclidean(residual.params[6], 1, "bracketed depth (offset)")?;
                }
                FactorKind::BracketedDepthMesh { affine, .. } => {
                    ensure!(
                        residual.params.len() == 6,
                        "bracketed depth-mesh requires 6 params \
                         [beg, end, extr, depth_to_image, scale, offset]"
                    );
                    self.check_se3(residual.params[0], "bracketed depth-mesh (beg)")?;
                    self.check_se3(residual.params[1], "bracketed depth-mesh (end)")?;
                    self.check_se3(residual.params[2], "bracketed depth-mesh (extr)")?;
                    self.check_depth_to_image(
                        residual.params[3],
                        *affine,
                        "bracketed depth-mesh (depth_to_image)",
                    )?;
                    self.check_euclidean(residual.params[4], 1, "bracketed depth-mesh (scale)")?;
                    self.check_euclidean(residual.params[5], 1, "bracketed depth-mesh (offset)")?;
                }
                FactorKind::PointPrior { weight, .. } => {
                    ensure!(
                        residual.params.len() == 1,
                        "point prior requires 1 param [point]"
                    );
                    self.check_euclidean(residual.params[0], 3, "point prior")?;
                    ensure!(*weight >= 0.0, "point prior weight must be non-negative");
                }
            }
        }

        Ok(())
    }
}

impl std::ops::Index<ParamId> for ProblemIR {
    type Output = ParamBlock;

    fn index(&self, id: ParamId) -> &ParamBlock {
        &self.params[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamps() -> BracketStamps {
        BracketStamps {
            beg: 10.0,
            end: 11.0,
            cam: 10.4,
        }
    }

    fn reproj_ir(dist_dim: usize, kind: DistortionKind) -> ProblemIR {
        let mut ir = ProblemIR::new();
        let beg = ir.add_param_block("beg", 7, ManifoldKind::SE3, FixedMask::all_free(), None);
        let end = ir.add_param_block("end", 7, ManifoldKind::SE3, FixedMask::all_free(), None);
        let extr = ir.add_param_block("extr", 7, ManifoldKind::SE3, FixedMask::all_free(), None);
        let pt = ir.add_param_block("pt", 3, ManifoldKind::Euclidean, FixedMask::all_free(), None);
        let off = ir.add_param_block("off", 1, ManifoldKind::Euclidean, FixedMask::all_free(), None);
        let f = ir.add_param_block("f", 1, ManifoldKind::Euclidean, FixedMask::all_free(), None);
        let c = ir.add_param_block("c", 2, ManifoldKind::Euclidean, FixedMask::all_free(), None);
        let d = ir.add_param_block(
            "d",
            dist_dim,
            ManifoldKind::Euclidean,
            FixedMask::all_free(),
            None,
        );
        ir.add_residual_block(ResidualBlock {
            params: vec![beg, end, extr, pt, off, f, c, d],
            loss: RobustLoss::Cauchy { scale: 3.0 },
            factor: FactorKind::BracketedReproj {
                pixel: [100.0, 200.0],
                stamps: stamps(),
                distortion: kind,
            },
        });
        ir
    }

    #[test]
    fn valid_reprojection_layout_passes() {
        assert!(reproj_ir(4, DistortionKind::RadTan).validate().is_ok());
        assert!(reproj_ir(5, DistortionKind::RadTan).validate().is_ok());
        assert!(reproj_ir(1, DistortionKind::Fisheye).validate().is_ok());
        assert!(reproj_ir(1, DistortionKind::None).validate().is_ok());
    }

    #[test]
    fn wrong_distortion_dim_fails() {
        assert!(reproj_ir(3, DistortionKind::RadTan).validate().is_err());
        assert!(reproj_ir(2, DistortionKind::Fisheye).validate().is_err());
    }

    #[test]
    fn se3_dim_is_checked() {
        let mut ir = ProblemIR::new();
        ir.add_param_block("pose", 6, ManifoldKind::SE3, FixedMask::all_free(), None);
        assert!(ir.validate().is_err());
    }

    #[test]
    fn bounds_are_range_checked() {
        let mut ir = ProblemIR::new();
        ir.add_param_block(
            "off",
            1,
            ManifoldKind::Euclidean,
            FixedMask::all_free(),
            Some(vec![Bound {
                idx: 1,
                lower: 0.0,
                upper: 1.0,
            }]),
        );
        assert!(ir.validate().is_err());
    }

    #[test]
    fn point_prior_layout() {
        let mut ir = ProblemIR::new();
        let pt = ir.add_param_block("pt", 3, ManifoldKind::Euclidean, FixedMask::all_free(), None);
        ir.add_residual_block(ResidualBlock {
            params: vec![pt],
            loss: RobustLoss::None,
            factor: FactorKind::PointPrior {
                target: [0.0, 0.0, 1.0],
                weight: 25.0,
            },
        });
        assert!(ir.validate().is_ok());
    }
}
