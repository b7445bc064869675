//! Beta-Bernoulli Thompson sampling over named strategy arms.
//!
//! The sampler holds one `(α, β)` pair per arm with prior `(1, 1)`. On
//! `select`, it draws `θ ~ Beta(α, β)` for every enabled arm and returns
//! the arg-max, breaking exact ties uniformly. Randomness comes only from
//! the caller-supplied seed, so selections are reproducible in tests.
//! Arm semantics live entirely outside the kernel; the kernel never
//! consults the bandit.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

/// Posterior state of one arm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetaArm {
    /// Success count plus one.
    pub alpha: u64,
    /// Failure count plus one.
    pub beta: u64,
    /// Disabled arms are skipped by `select` but keep their state.
    pub enabled: bool,
}

impl Default for BetaArm {
    fn default() -> Self {
        Self {
            alpha: 1,
            beta: 1,
            enabled: true,
        }
    }
}

impl BetaArm {
    /// Restores an arm from persisted counts.
    #[must_use]
    pub const fn from_counts(alpha: u64, beta: u64) -> Self {
        Self {
            alpha,
            beta,
            enabled: true,
        }
    }

    /// Posterior mean `α / (α + β)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        self.alpha as f64 / (self.alpha + self.beta) as f64
    }

    /// Observed pulls (updates applied since the prior).
    #[must_use]
    pub const fn pulls(&self) -> u64 {
        (self.alpha - 1) + (self.beta - 1)
    }
}

/// Aggregate view of one arm, for leaderboards and logs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    /// Arm identifier.
    pub arm_id: String,
    /// Current α.
    pub alpha: u64,
    /// Current β.
    pub beta: u64,
    /// Updates applied.
    pub pulls: u64,
    /// Posterior mean.
    pub mean: f64,
}

/// Thompson sampler over a fixed registry of named arms.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThompsonSampler {
    arms: BTreeMap<String, BetaArm>,
}

impl ThompsonSampler {
    /// Creates a sampler with the given arm ids at the uniform prior.
    #[must_use]
    pub fn with_arms<I, S>(arm_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sampler = Self::default();
        for id in arm_ids {
            sampler.ensure(&id.into());
        }
        sampler
    }

    /// Registers an arm at the prior if it is not already present.
    pub fn ensure(&mut self, arm_id: &str) {
        self.arms.entry(arm_id.to_string()).or_default();
    }

    /// Restores an arm from persisted counts, replacing any prior state.
    pub fn restore(&mut self, arm_id: &str, alpha: u64, beta: u64) {
        self.arms
            .insert(arm_id.to_string(), BetaArm::from_counts(alpha.max(1), beta.max(1)));
    }

    /// Direct read access to an arm.
    #[must_use]
    pub fn arm(&self, arm_id: &str) -> Option<&BetaArm> {
        self.arms.get(arm_id)
    }

    /// Number of registered arms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.arms.len()
    }

    /// True when no arms are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    /// Samples every enabled arm and returns the arg-max arm id.
    ///
    /// Returns `None` when no enabled arms exist. Exact sample ties are
    /// broken uniformly with the same seeded generator.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn select(&self, seed: u64) -> Option<String> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut best: Vec<&str> = Vec::new();
        let mut best_sample = f64::NEG_INFINITY;

        for (arm_id, arm) in &self.arms {
            if !arm.enabled {
                continue;
            }
            let dist = Beta::new(arm.alpha as f64, arm.beta as f64)
                .expect("α and β are at least 1");
            let sample = dist.sample(&mut rng);
            if sample > best_sample {
                best_sample = sample;
                best.clear();
                best.push(arm_id);
            } else if sample == best_sample {
                best.push(arm_id);
            }
        }

        match best.len() {
            0 => None,
            1 => Some(best[0].to_string()),
            n => Some(best[rng.gen_range(0..n)].to_string()),
        }
    }

    /// Applies a binary reward to an arm, registering it if needed.
    ///
    /// `α` and `β` only ever grow; there is no decay and no un-learning.
    pub fn update(&mut self, arm_id: &str, reward: bool) {
        let arm = self.arms.entry(arm_id.to_string()).or_default();
        if reward {
            arm.alpha += 1;
        } else {
            arm.beta += 1;
        }
    }

    /// Per-arm stats sorted by posterior mean, best first.
    #[must_use]
    pub fn stats(&self) -> Vec<ArmStats> {
        let mut out: Vec<ArmStats> = self
            .arms
            .iter()
            .map(|(arm_id, arm)| ArmStats {
                arm_id: arm_id.clone(),
                alpha: arm.alpha,
                beta: arm.beta,
                pulls: arm.pulls(),
                mean: arm.mean(),
            })
            .collect();
        out.sort_by(|a, b| b.mean.partial_cmp(&a.mean).unwrap_or(std::cmp::Ordering::Equal));
        out
    }
}
