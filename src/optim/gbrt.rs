//! Surrogate-model black-box minimization with boosted regression trees
//!
//! The first `n_initial_points` evaluations are uniform random draws (after
//! an optional user-supplied `x0`). After that, each suggestion comes from
//! an ensemble of gradient-boosted tree models fitted on bootstrap resamples
//! of the observations: random candidates, plus local perturbations of the
//! incumbent, are scored by the lower confidence bound
//! `mean - kappa * spread`, and the lowest one is proposed.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tree::{RegressionTree, TreeParams};
use super::Real;

/// Outcome of a [`GbrtMinimizer`] run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeResult {
    /// Best point found
    pub x: Vec<f64>,
    /// Objective at `x`
    pub fun: f64,
    /// Every evaluated point, in order
    pub x_iters: Vec<Vec<f64>>,
    /// Objective value of each evaluated point
    pub func_vals: Vec<f64>,
}

/// Least-squares gradient boosting over [`RegressionTree`]s
#[derive(Debug, Clone)]
pub struct BoostedTrees {
    base: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

impl BoostedTrees {
    pub fn fit<R: Rng>(
        x: &[Vec<f64>],
        y: &[f64],
        n_estimators: usize,
        learning_rate: f64,
        params: TreeParams,
        rng: &mut R,
    ) -> Self {
        let base = if y.is_empty() {
            0.0
        } else {
            y.iter().sum::<f64>() / y.len() as f64
        };
        let mut fitted = vec![base; y.len()];
        let mut trees = Vec::with_capacity(n_estimators);
        for _ in 0..n_estimators {
            let residuals: Vec<f64> = y.iter().zip(&fitted).map(|(t, f)| t - f).collect();
            let tree = RegressionTree::fit(x, &residuals, params, rng);
            for (f, row) in fitted.iter_mut().zip(x) {
                *f += learning_rate * tree.predict(row);
            }
            trees.push(tree);
        }
        Self {
            base,
            learning_rate,
            trees,
        }
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        self.base
            + self
                .trees
                .iter()
                .map(|t| self.learning_rate * t.predict(row))
                .sum::<f64>()
    }
}

/// Ask/tell black-box minimizer with a boosted-tree surrogate
#[derive(Debug, Clone)]
pub struct GbrtMinimizer {
    space: Vec<Real>,
    n_calls: usize,
    n_initial_points: usize,
    kappa: f64,
    n_candidates: usize,
    n_estimators: usize,
    learning_rate: f64,
    n_models: usize,
    tree_params: TreeParams,
    /// Points evaluated before any sampling
    pending: Vec<Vec<f64>>,
    x_iters: Vec<Vec<f64>>,
    func_vals: Vec<f64>,
    rng: StdRng,
}

impl GbrtMinimizer {
    /// Create a minimizer over `space`
    pub fn new(space: Vec<Real>) -> Result<Self> {
        anyhow::ensure!(!space.is_empty(), "search space has no dimensions");
        for (i, dim) in space.iter().enumerate() {
            anyhow::ensure!(
                dim.low.is_finite() && dim.high.is_finite(),
                "dimension {i} has non-finite bounds [{}, {}]",
                dim.low,
                dim.high
            );
        }
        let n_features = space.len();
        Ok(Self {
            space,
            n_calls: 10,
            n_initial_points: 10,
            kappa: 1.96,
            n_candidates: 1000,
            n_estimators: 30,
            learning_rate: 0.1,
            n_models: 5,
            tree_params: TreeParams {
                max_depth: 3,
                min_samples_leaf: 1,
                max_features: Some(((n_features as f64).sqrt().ceil() as usize).max(1)),
            },
            pending: Vec::new(),
            x_iters: Vec::new(),
            func_vals: Vec::new(),
            rng: StdRng::seed_from_u64(0),
        })
    }

    /// Total objective evaluations for [`minimize`](Self::minimize)
    pub fn with_n_calls(mut self, n_calls: usize) -> Self {
        self.n_calls = n_calls.max(1);
        self
    }

    /// Random evaluations before the surrogate is used
    pub fn with_initial_points(mut self, n: usize) -> Self {
        self.n_initial_points = n.max(1);
        self
    }

    /// Exploration weight of the lower confidence bound
    pub fn with_kappa(mut self, kappa: f64) -> Self {
        self.kappa = kappa.max(0.0);
        self
    }

    pub fn with_candidates(mut self, n: usize) -> Self {
        self.n_candidates = n.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Evaluate `x0` first (clamped into the space)
    pub fn with_x0(mut self, x0: Vec<f64>) -> Result<Self> {
        anyhow::ensure!(
            x0.len() == self.space.len(),
            "x0 has {} values, space has {} dimensions",
            x0.len(),
            self.space.len()
        );
        let clamped = x0
            .iter()
            .zip(&self.space)
            .map(|(v, dim)| dim.clamp(*v))
            .collect();
        self.pending.push(clamped);
        Ok(self)
    }

    pub fn n_dims(&self) -> usize {
        self.space.len()
    }

    pub fn n_evaluations(&self) -> usize {
        self.func_vals.len()
    }

    /// Suggest the next point to evaluate
    pub fn ask(&mut self) -> Vec<f64> {
        if let Some(x) = self.pending.pop() {
            return x;
        }
        if self.func_vals.len() < self.n_initial_points {
            return self.random_point();
        }
        self.surrogate_point()
    }

    /// Record an evaluation; NaN objectives rank last
    pub fn tell(&mut self, x: Vec<f64>, y: f64) -> Result<()> {
        anyhow::ensure!(
            x.len() == self.space.len(),
            "point has {} values, space has {} dimensions",
            x.len(),
            self.space.len()
        );
        let y = if y.is_nan() { f64::INFINITY } else { y };
        self.x_iters.push(x);
        self.func_vals.push(y);
        Ok(())
    }

    /// Best observation so far
    pub fn best(&self) -> Option<(&[f64], f64)> {
        self.func_vals
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, &y)| (self.x_iters[i].as_slice(), y))
    }

    /// Run `n_calls` ask/evaluate/tell rounds
    pub fn minimize<F>(&mut self, mut objective: F) -> Result<OptimizeResult>
    where
        F: FnMut(&[f64]) -> Result<f64>,
    {
        for call in 0..self.n_calls {
            let x = self.ask();
            let y = objective(&x)?;
            debug!("gbrt call {}/{}: f = {:.5}", call + 1, self.n_calls, y);
            self.tell(x, y)?;
        }
        self.result()
    }

    /// Summarize the evaluations recorded so far
    pub fn result(&self) -> Result<OptimizeResult> {
        let (x, fun) = self
            .best()
            .ok_or_else(|| anyhow::anyhow!("no evaluations recorded"))?;
        Ok(OptimizeResult {
            x: x.to_vec(),
            fun,
            x_iters: self.x_iters.clone(),
            func_vals: self.func_vals.clone(),
        })
    }

    fn random_point(&mut self) -> Vec<f64> {
        let rng = &mut self.rng;
        self.space.iter().map(|dim| dim.sample(rng)).collect()
    }

    fn surrogate_point(&mut self) -> Vec<f64> {
        let models = self.fit_ensemble();
        let incumbent = self
            .best()
            .map(|(x, _)| x.to_vec())
            .unwrap_or_else(|| self.random_point());

        let mut best_point = incumbent.clone();
        let mut best_score = f64::INFINITY;
        for c in 0..self.n_candidates {
            // half global draws, half local moves around the incumbent
            let candidate = if c % 2 == 0 {
                self.random_point()
            } else {
                self.local_point(&incumbent)
            };
            let score = lower_confidence_bound(&models, &candidate, self.kappa);
            if score < best_score {
                best_score = score;
                best_point = candidate;
            }
        }
        best_point
    }

    fn local_point(&mut self, center: &[f64]) -> Vec<f64> {
        let rng = &mut self.rng;
        center
            .iter()
            .zip(&self.space)
            .map(|(&c, dim)| {
                let step = 0.1 * dim.width();
                dim.clamp(c + rng.gen_range(-1.0..=1.0) * step)
            })
            .collect()
    }

    fn fit_ensemble(&mut self) -> Vec<BoostedTrees> {
        let n = self.func_vals.len();
        let mut models = Vec::with_capacity(self.n_models);
        for _ in 0..self.n_models {
            let picks: Vec<usize> = (0..n).map(|_| self.rng.gen_range(0..n)).collect();
            let x: Vec<Vec<f64>> = picks.iter().map(|&i| self.x_iters[i].clone()).collect();
            // finite stand-in so failed evaluations don't poison the fit
            let y: Vec<f64> = picks
                .iter()
                .map(|&i| finite_or(self.func_vals[i], &self.func_vals))
                .collect();
            models.push(BoostedTrees::fit(
                &x,
                &y,
                self.n_estimators,
                self.learning_rate,
                self.tree_params,
                &mut self.rng,
            ));
        }
        models
    }
}

fn finite_or(value: f64, all: &[f64]) -> f64 {
    if value.is_finite() {
        return value;
    }
    let worst = all
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if worst.is_finite() {
        worst + 1.0
    } else {
        0.0
    }
}

fn lower_confidence_bound(models: &[BoostedTrees], x: &[f64], kappa: f64) -> f64 {
    let preds: Vec<f64> = models.iter().map(|m| m.predict(x)).collect();
    let n = preds.len() as f64;
    let mean = preds.iter().sum::<f64>() / n;
    let var = preds.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    mean - kappa * var.sqrt()
}
