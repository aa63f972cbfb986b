//! # Forecast Metrics
//!
//! $$
//! \mathrm{RMSE} = \sqrt{\tfrac{1}{n}\sum_t (y_t - \hat y_t)^2}
//! $$
//!
//! Held-out-window error metrics and the pluggable information criteria used
//! to score order-search candidates.

use crate::error::PipelineError;
use crate::error::Result;

/// Point-forecast error metrics over a held-out window.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorMetrics {
  /// Mean absolute error.
  pub mae: f64,
  /// Root mean squared error.
  pub rmse: f64,
  /// Mean absolute percentage error, in percent.
  pub mape: f64,
}

/// Compute [`ErrorMetrics`] over aligned actual/predicted slices.
pub fn evaluate(actual: &[f64], predicted: &[f64]) -> Result<ErrorMetrics> {
  if actual.is_empty() {
    return Err(PipelineError::InsufficientData(
      "cannot score a forecast on an empty test window".to_string(),
    ));
  }
  if actual.len() != predicted.len() {
    return Err(PipelineError::InsufficientData(format!(
      "actual/predicted length mismatch: {} vs {}",
      actual.len(),
      predicted.len()
    )));
  }

  let n = actual.len() as f64;
  let mut abs_sum = 0.0;
  let mut sq_sum = 0.0;
  let mut pct_sum = 0.0;

  for (a, p) in actual.iter().zip(predicted.iter()) {
    let d = a - p;
    abs_sum += d.abs();
    sq_sum += d * d;
    if a.abs() > f64::EPSILON {
      pct_sum += (d / a).abs();
    }
  }

  Ok(ErrorMetrics {
    mae: abs_sum / n,
    rmse: (sq_sum / n).sqrt(),
    mape: pct_sum / n * 100.0,
  })
}

/// Scoring function for order-search candidates. Lower is better. Implemented
/// by the built-in information criteria; the search loop is agnostic to which
/// one is plugged in.
pub trait OrderScorer {
  /// Score a fitted candidate from its sum of squared errors, observation
  /// count and parameter count.
  fn score(&self, sse: f64, nobs: usize, n_params: usize) -> f64;
}

/// Akaike information criterion.
#[derive(Clone, Copy, Debug, Default)]
pub struct Aic;

impl OrderScorer for Aic {
  fn score(&self, sse: f64, nobs: usize, n_params: usize) -> f64 {
    let n = nobs as f64;
    n * (sse / n).ln() + 2.0 * n_params as f64
  }
}

/// Bayesian information criterion.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bic;

impl OrderScorer for Bic {
  fn score(&self, sse: f64, nobs: usize, n_params: usize) -> f64 {
    let n = nobs as f64;
    n * (sse / n).ln() + (n_params as f64) * n.ln()
  }
}
