//! # Portfolio
//!
//! $$
//! \mathbf{w}^\* = \arg\max_{\mathbf{w}} \frac{\mathbf{w}\cdot\mu - r_f}{\sqrt{\mathbf{w}^\top \Sigma \mathbf{w}}}
//! $$
//!
//! Constrained mean-variance optimization over per-asset expected returns and
//! a historical covariance matrix. [`marketstats`] assembles the inputs,
//! [`optimizer`] sweeps the efficient frontier and names the maximum-Sharpe
//! and minimum-volatility solutions.

pub mod marketstats;
pub mod optimizer;

use crate::error::PipelineError;
use crate::error::Result;

/// Tolerance on the weight budget constraint.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Asset allocation mapping symbols to weights summing to one.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortfolioWeights {
  entries: Vec<(String, f64)>,
}

impl PortfolioWeights {
  /// Validate and wrap an allocation. Weights must be finite, symbols unique
  /// and the total must equal one within [`WEIGHT_SUM_TOLERANCE`].
  pub fn new(entries: Vec<(String, f64)>) -> Result<Self> {
    if entries.is_empty() {
      return Err(PipelineError::InvalidConfiguration(
        "portfolio weights must not be empty".to_string(),
      ));
    }
    for (symbol, weight) in &entries {
      if !weight.is_finite() {
        return Err(PipelineError::InvalidConfiguration(format!(
          "weight for {symbol} is not finite"
        )));
      }
      if entries.iter().filter(|(s, _)| s == symbol).count() > 1 {
        return Err(PipelineError::InvalidConfiguration(format!(
          "duplicate symbol {symbol} in portfolio weights"
        )));
      }
    }

    let total: f64 = entries.iter().map(|(_, w)| w).sum();
    if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
      return Err(PipelineError::InvalidConfiguration(format!(
        "portfolio weights sum to {total}, expected 1.0"
      )));
    }

    Ok(Self { entries })
  }

  pub fn entries(&self) -> &[(String, f64)] {
    &self.entries
  }

  pub fn symbols(&self) -> Vec<&str> {
    self.entries.iter().map(|(s, _)| s.as_str()).collect()
  }

  /// Weight for `symbol`, zero when absent.
  pub fn weight(&self, symbol: &str) -> f64 {
    self
      .entries
      .iter()
      .find(|(s, _)| s == symbol)
      .map(|(_, w)| *w)
      .unwrap_or(0.0)
  }

  /// Symbols carrying a nonzero weight.
  pub fn active_symbols(&self) -> Vec<&str> {
    self
      .entries
      .iter()
      .filter(|(_, w)| w.abs() > 0.0)
      .map(|(s, _)| s.as_str())
      .collect()
  }
}

/// One named portfolio with its model statistics.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortfolioSolution {
  pub weights: PortfolioWeights,
  /// Annualized expected portfolio return.
  pub expected_return: f64,
  /// Annualized portfolio volatility.
  pub volatility: f64,
  pub sharpe: f64,
}

/// A swept point of the efficient frontier.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrontierPoint {
  pub target_return: f64,
  pub expected_return: f64,
  pub volatility: f64,
  pub sharpe: f64,
}

/// Which named solution downstream consumers receive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RecommendationPolicy {
  #[default]
  MaxSharpe,
  MinVolatility,
}

/// Output of one optimization run.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OptimizationOutcome {
  pub max_sharpe: PortfolioSolution,
  pub min_volatility: PortfolioSolution,
  pub frontier: Vec<FrontierPoint>,
  pub policy: RecommendationPolicy,
}

impl OptimizationOutcome {
  /// The solution selected by the configured recommendation policy.
  pub fn recommended(&self) -> &PortfolioSolution {
    match self.policy {
      RecommendationPolicy::MaxSharpe => &self.max_sharpe,
      RecommendationPolicy::MinVolatility => &self.min_volatility,
    }
  }
}
