//! Logarithmic Market Scoring Rule (LMSR) implementation.
//!
//! The LMSR is the automated market maker that prices every market.
//! This module computes costs, probabilities and marginal trade costs
//! for markets with any number of outcomes (N >= 2 in practice).
//! Reference: Hanson (2003) "Combinatorial Information Market Design"
//!
//! All functions are pure. Sums of exponentials go through a shifted
//! log-sum-exp so large exposures never overflow `f64`.

use serde::{Deserialize, Serialize};

use super::error::PricingError;

/// LMSR pricing model for multi-outcome markets.
///
/// The liquidity parameter `b` controls market depth:
/// - Higher `b` = more liquidity, tighter spreads, slower price movement
/// - Lower `b` = less liquidity, wider spreads, faster price movement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LmsrModel {
    /// Liquidity parameter (b > 0)
    b: f64,
}

impl LmsrModel {
    /// Creates a new LMSR model with the given liquidity parameter.
    ///
    /// # Errors
    /// Returns `InvalidLiquidity` if `b` is not positive and finite.
    pub fn new(b: f64) -> Result<Self, PricingError> {
        if !(b.is_finite() && b > 0.0) {
            return Err(PricingError::InvalidLiquidity(b));
        }
        Ok(Self { b })
    }

    /// Returns the liquidity parameter.
    pub fn liquidity(&self) -> f64 {
        self.b
    }

    /// Computes the LMSR cost function: C(q) = b * ln(sum(exp(q_i / b))).
    ///
    /// Evaluated as `b * (m + ln(sum(exp(q_i/b - m))))` with `m = max(q_i/b)`.
    /// If the weights vanish (every `q_i/b` is -inf), the cost is defined as 0.
    ///
    /// # Errors
    /// Returns `ExposureOverflow` if some `q_i/b` is NaN or +inf.
    pub fn cost(&self, q: &[f64]) -> Result<f64, PricingError> {
        match self.log_sum_exp(q)? {
            Some(lse) => Ok(self.b * lse),
            None => Ok(0.0),
        }
    }

    /// Computes the implied probability (instantaneous price) of every outcome.
    ///
    /// p_i = exp(q_i/b) / sum_j(exp(q_j/b)), uniform when the weights vanish.
    pub fn probabilities(&self, q: &[f64]) -> Result<Vec<f64>, PricingError> {
        if q.is_empty() {
            return Err(PricingError::EmptyOutcomes);
        }
        let uniform = || vec![1.0 / q.len() as f64; q.len()];

        let Some(max) = self.max_scaled(q)? else {
            return Ok(uniform());
        };
        let weights: Vec<f64> = q.iter().map(|qi| (qi / self.b - max).exp()).collect();
        let total: f64 = weights.iter().sum();

        if total == 0.0 || !total.is_finite() {
            return Ok(uniform());
        }
        Ok(weights.into_iter().map(|w| w / total).collect())
    }

    /// Probability of a single outcome.
    pub fn price(&self, q: &[f64], outcome: usize) -> Result<f64, PricingError> {
        let probabilities = self.probabilities(q)?;
        probabilities
            .get(outcome)
            .copied()
            .ok_or(PricingError::InvalidOutcome {
                index: outcome,
                outcomes: q.len(),
            })
    }

    /// Signed cost of moving the market from `q_before` to `q_after`.
    ///
    /// Positive values are charged to the trader, negative values refunded.
    pub fn trade_cost(&self, q_before: &[f64], q_after: &[f64]) -> Result<f64, PricingError> {
        Ok(self.cost(q_after)? - self.cost(q_before)?)
    }

    /// Signed cost of applying `shares` to a single outcome of `q`.
    ///
    /// Returns the cost together with the resulting exposure vector.
    pub fn delta_cost(
        &self,
        q: &[f64],
        outcome: usize,
        shares: f64,
    ) -> Result<(f64, Vec<f64>), PricingError> {
        if q.is_empty() {
            return Err(PricingError::EmptyOutcomes);
        }
        if outcome >= q.len() {
            return Err(PricingError::InvalidOutcome {
                index: outcome,
                outcomes: q.len(),
            });
        }
        let mut q_after = q.to_vec();
        q_after[outcome] += shares;
        let cost = self.trade_cost(q, &q_after)?;
        Ok((cost, q_after))
    }

    /// `ln(sum(exp(q_i/b)))`, or `None` when the weights vanish.
    fn log_sum_exp(&self, q: &[f64]) -> Result<Option<f64>, PricingError> {
        if q.is_empty() {
            return Err(PricingError::EmptyOutcomes);
        }
        let Some(max) = self.max_scaled(q)? else {
            return Ok(None);
        };
        let shifted: f64 = q.iter().map(|qi| (qi / self.b - max).exp()).sum();
        if shifted == 0.0 || !shifted.is_finite() {
            return Ok(None);
        }
        Ok(Some(max + shifted.ln()))
    }

    /// Largest `q_i / b`, or `None` when every weight vanishes.
    fn max_scaled(&self, q: &[f64]) -> Result<Option<f64>, PricingError> {
        let mut max = f64::NEG_INFINITY;
        for qi in q {
            let scaled = qi / self.b;
            if scaled.is_nan() || scaled == f64::INFINITY {
                return Err(PricingError::ExposureOverflow {
                    exposure: *qi,
                    b: self.b,
                });
            }
            max = max.max(scaled);
        }
        Ok(max.is_finite().then_some(max))
    }
}
