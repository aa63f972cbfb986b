//! # Trend Projection
//!
//! $$
//! \hat P_t \pm 1.96\, \sigma P_0 \sqrt{t / 252}
//! $$
//!
//! Extends a trained model recursively beyond the observed horizon and wraps
//! the path in widening 95% confidence bounds. The band scale is anchored on
//! the last observed price so the interval width grows strictly with the
//! horizon offset even when the projected path declines.

use chrono::NaiveDate;
use tracing::info;

use crate::error::PipelineError;
use crate::error::Result;
use crate::forecast::RecursiveForecaster;
use crate::market::future_trading_days;
use crate::market::TRADING_DAYS_PER_YEAR;

/// Two-sided 95% critical value of the standard normal distribution.
const Z_95: f64 = 1.96;

/// One projected trading day.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProjectionPoint {
  /// Trading-day offset from the last observed date, starting at 1.
  pub offset: usize,
  pub date: NaiveDate,
  pub estimate: f64,
  pub lower: f64,
  pub upper: f64,
}

/// Immutable future price path with confidence bounds.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrendProjection {
  points: Vec<ProjectionPoint>,
}

impl TrendProjection {
  pub fn points(&self) -> &[ProjectionPoint] {
    &self.points
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  pub fn last(&self) -> Option<&ProjectionPoint> {
    self.points.last()
  }
}

/// Inputs fixed at projection time.
#[derive(Clone, Copy, Debug)]
pub struct ProjectionContext {
  /// Last observed trading date; the projection starts the next weekday.
  pub last_date: NaiveDate,
  /// Last observed price, anchor for the band scale.
  pub last_price: f64,
  /// Daily return volatility estimated from the training window.
  pub daily_volatility: f64,
}

/// Project `horizon` trading days ahead with a trained model.
///
/// The band half-width at offset `t` is `1.96 · σ · P_last · sqrt(t / 252)`,
/// which is strictly increasing in `t`. The narrowing `sqrt(252 / t)` variant
/// of this formula found in some published material contradicts compounding
/// uncertainty and is deliberately not reproduced.
pub fn project(
  model: &dyn RecursiveForecaster,
  context: &ProjectionContext,
  horizon: usize,
) -> Result<TrendProjection> {
  if horizon == 0 {
    return Err(PipelineError::InvalidConfiguration(
      "projection horizon must be at least 1 trading day".to_string(),
    ));
  }
  if !model.is_trained() {
    return Err(PipelineError::UntrainedModel(
      "trend projection requires a trained model".to_string(),
    ));
  }
  if !context.daily_volatility.is_finite() || context.daily_volatility < 0.0 {
    return Err(PipelineError::InvalidConfiguration(format!(
      "daily volatility must be finite and non-negative, got {}",
      context.daily_volatility
    )));
  }

  let path = model.forecast_path(horizon)?;
  let dates = future_trading_days(context.last_date, horizon);
  let band_scale = Z_95 * context.daily_volatility * context.last_price;

  let points = path
    .into_iter()
    .zip(dates)
    .enumerate()
    .map(|(i, (estimate, date))| {
      let offset = i + 1;
      let half_width = band_scale * (offset as f64 / TRADING_DAYS_PER_YEAR as f64).sqrt();
      ProjectionPoint {
        offset,
        date,
        estimate,
        lower: estimate - half_width,
        upper: estimate + half_width,
      }
    })
    .collect();

  let projection = TrendProjection { points };
  info!(
    horizon,
    last = %context.last_date,
    "trend projection generated"
  );
  Ok(projection)
}
