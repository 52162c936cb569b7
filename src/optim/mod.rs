//! Derivative-free optimizers
//!
//! - [`GbrtMinimizer`]: surrogate-model search over a box of real
//!   dimensions, using boosted regression trees to propose candidates
//! - [`minimize_scalar_bounded`]: Brent's bounded scalar minimization
//!
//! Both minimize; callers maximizing an objective pass its negation.

mod gbrt;
mod scalar;
mod tree;

pub use gbrt::{BoostedTrees, GbrtMinimizer, OptimizeResult};
pub use scalar::{minimize_scalar_bounded, ScalarResult, DEFAULT_XATOL};
pub use tree::{RegressionTree, TreeParams};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A bounded real search dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Real {
    pub low: f64,
    pub high: f64,
}

impl Real {
    /// Bounds are swapped if given in reverse
    pub fn new(low: f64, high: f64) -> Self {
        if low <= high {
            Self { low, high }
        } else {
            Self {
                low: high,
                high: low,
            }
        }
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn contains(&self, x: f64) -> bool {
        x >= self.low && x <= self.high
    }

    pub fn clamp(&self, x: f64) -> f64 {
        x.clamp(self.low, self.high)
    }

    /// Uniform draw; a degenerate interval returns its single point
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        if self.width() > 0.0 {
            rng.gen_range(self.low..=self.high)
        } else {
            self.low
        }
    }
}
