//! Generic RANSAC and the affine-2D match filter.
//!
//! The engine is model-agnostic: implement [`Estimator`] and call
//! [`ransac`]. The only model this workspace needs is the 2D affine map
//! between matched pixel sets, which replaces a homography because it is
//! better behaved on the short-baseline pairs a rig produces.

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use rand::prelude::IndexedRandom;
use rand::{rngs::StdRng, SeedableRng};
use rig_core::{Real, Vec2};

/// Configuration for the RANSAC loop.
#[derive(Debug, Clone)]
pub struct RansacOptions {
    pub max_iters: usize,
    /// Inlier residual threshold, in the residual's units (pixels here).
    pub thresh: Real,
    pub confidence: Real,
    /// Seed for the sampling RNG, for reproducibility.
    pub seed: u64,
}

impl Default for RansacOptions {
    fn default() -> Self {
        // The affine-2D filter settings used during pairwise matching.
        Self {
            max_iters: 10_000,
            thresh: 20.0,
            confidence: 0.8,
            seed: 1_234_567,
        }
    }
}

/// Model estimator for [`ransac`].
pub trait Estimator {
    type Datum;
    type Model;

    /// Minimal number of samples needed to fit a model.
    const MIN_SAMPLES: usize;

    /// Fit from a minimal sample; `None` when degenerate.
    fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model>;

    /// Non-negative residual for one datum, same units as `thresh`.
    fn residual(model: &Self::Model, datum: &Self::Datum) -> Real;

    /// Refit on an inlier set; default keeps the minimal-sample model.
    fn refit(_data: &[Self::Datum], _inliers: &[usize]) -> Option<Self::Model> {
        None
    }
}

/// Number of iterations justified by the current inlier ratio.
fn required_iters(confidence: Real, inlier_ratio: Real, min_samples: usize, cap: usize) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return cap;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return cap;
    }
    (((1.0 - confidence).ln() / denom).ceil() as usize).min(cap)
}

/// Run RANSAC; returns the best model and its inlier indices, or `None`
/// when no sample produced a model with at least `MIN_SAMPLES` inliers.
pub fn ransac<E: Estimator>(
    data: &[E::Datum],
    opts: &RansacOptions,
) -> Option<(E::Model, Vec<usize>)> {
    if data.len() < E::MIN_SAMPLES {
        return None;
    }

    let indices: Vec<usize> = (0..data.len()).collect();
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let mut best: Option<(E::Model, Vec<usize>)> = None;
    let mut max_iters = opts.max_iters;

    let mut iter = 0;
    while iter < max_iters {
        iter += 1;

        let sample: Vec<usize> = indices
            .choose_multiple(&mut rng, E::MIN_SAMPLES)
            .copied()
            .collect();

        let Some(model) = E::fit(data, &sample) else {
            continue;
        };

        let inliers: Vec<usize> = data
            .iter()
            .enumerate()
            .filter(|(_, d)| E::residual(&model, d) <= opts.thresh)
            .map(|(i, _)| i)
            .collect();

        if inliers.len() < E::MIN_SAMPLES {
            continue;
        }

        let (model, inliers) = match E::refit(data, &inliers) {
            Some(refined) => {
                let refined_inliers: Vec<usize> = data
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| E::residual(&refined, d) <= opts.thresh)
                    .map(|(i, _)| i)
                    .collect();
                (refined, refined_inliers)
            }
            None => (model, inliers),
        };

        if best.as_ref().map_or(true, |(_, bi)| inliers.len() > bi.len()) {
            let ratio = inliers.len() as Real / data.len() as Real;
            max_iters = required_iters(opts.confidence, ratio, E::MIN_SAMPLES, opts.max_iters)
                .max(iter);
            best = Some((model, inliers));
        }
    }

    best
}

/// A 2D affine map `p ↦ A p + b`.
#[derive(Debug, Clone, Copy)]
pub struct Affine2d {
    pub linear: Matrix2<Real>,
    pub translation: Vector2<Real>,
}

impl Affine2d {
    pub fn apply(&self, p: &Vec2) -> Vec2 {
        self.linear * p + self.translation
    }
}

/// Estimator fitting an [`Affine2d`] to `(left_pixel, right_pixel)` pairs.
pub struct Affine2dEstimator;

fn solve_affine(data: &[(Vec2, Vec2)], idxs: &[usize]) -> Option<Affine2d> {
    // Least squares over the selected pairs: two independent 3-unknown
    // systems, one per output coordinate.
    let mut ata = Matrix3::<Real>::zeros();
    let mut atb_u = Vector3::<Real>::zeros();
    let mut atb_v = Vector3::<Real>::zeros();
    for &i in idxs {
        let (l, r) = data[i];
        let row = Vector3::new(l.x, l.y, 1.0);
        ata += row * row.transpose();
        atb_u += row * r.x;
        atb_v += row * r.y;
    }
    let inv = ata.try_inverse()?;
    let cu = inv * atb_u;
    let cv = inv * atb_v;
    Some(Affine2d {
        linear: Matrix2::new(cu.x, cu.y, cv.x, cv.y),
        translation: Vector2::new(cu.z, cv.z),
    })
}

impl Estimator for Affine2dEstimator {
    type Datum = (Vec2, Vec2);
    type Model = Affine2d;

    const MIN_SAMPLES: usize = 3;

    fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model> {
        // Reject nearly collinear samples before solving.
        let a = data[sample[0]].0;
        let b = data[sample[1]].0;
        let c = data[sample[2]].0;
        let area = ((b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)).abs();
        if area < 1e-6 {
            return None;
        }
        solve_affine(data, sample)
    }

    fn residual(model: &Self::Model, datum: &Self::Datum) -> Real {
        (model.apply(&datum.0) - datum.1).norm()
    }

    fn refit(data: &[Self::Datum], inliers: &[usize]) -> Option<Self::Model> {
        solve_affine(data, inliers)
    }
}

/// Filter matched pixel pairs with RANSAC affine-2D; returns the surviving
/// indices, or all-outliers when no model was found.
pub fn filter_matches_affine2d(pairs: &[(Vec2, Vec2)], opts: &RansacOptions) -> Vec<usize> {
    match ransac::<Affine2dEstimator>(pairs, opts) {
        Some((_, inliers)) => inliers,
        None => Vec::new(),
    }
}
