//! # Report Payloads
//!
//! Plain data shapes for the four read-only query surfaces consumed by
//! reporting collaborators: price history, trend projection, recommended
//! portfolio and backtest comparison. Error payloads carry the typed kind
//! and human-readable cause only, never model internals.

use chrono::NaiveDate;

use crate::backtest::BacktestReport;
use crate::backtest::StrategyPerformance;
use crate::error::PipelineError;
use crate::forecast::projection::TrendProjection;
use crate::market::PriceSeries;
use crate::pipeline::PipelineReport;
use crate::portfolio::PortfolioSolution;
use crate::portfolio::RecommendationPolicy;

/// One historical price record.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PriceRecord {
  pub date: NaiveDate,
  pub open: f64,
  pub high: f64,
  pub low: f64,
  pub close: f64,
  pub adj_close: f64,
  pub volume: f64,
}

/// Historical price history for one symbol.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PriceHistoryPayload {
  pub symbol: String,
  pub records: Vec<PriceRecord>,
}

impl From<&PriceSeries> for PriceHistoryPayload {
  fn from(series: &PriceSeries) -> Self {
    Self {
      symbol: series.symbol().to_string(),
      records: series
        .bars()
        .iter()
        .map(|b| PriceRecord {
          date: b.date,
          open: b.open,
          high: b.high,
          low: b.low,
          close: b.close,
          adj_close: b.adj_close,
          volume: b.volume,
        })
        .collect(),
    }
  }
}

/// One projected day with its confidence bounds.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProjectionRow {
  pub date: NaiveDate,
  pub estimate: f64,
  pub lower: f64,
  pub upper: f64,
}

/// Trend projection over the configured horizon.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProjectionPayload {
  pub rows: Vec<ProjectionRow>,
}

impl From<&TrendProjection> for ProjectionPayload {
  fn from(projection: &TrendProjection) -> Self {
    Self {
      rows: projection
        .points()
        .iter()
        .map(|p| ProjectionRow {
          date: p.date,
          estimate: p.estimate,
          lower: p.lower,
          upper: p.upper,
        })
        .collect(),
    }
  }
}

/// Recommended allocation with weights expressed in percent.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecommendationPayload {
  /// `"max_sharpe"` or `"min_volatility"`.
  pub policy: String,
  /// Symbol with its weight in percent of the portfolio.
  pub weights_pct: Vec<(String, f64)>,
  pub expected_return: f64,
  pub volatility: f64,
  pub sharpe: f64,
}

impl RecommendationPayload {
  pub fn from_solution(policy: RecommendationPolicy, solution: &PortfolioSolution) -> Self {
    let policy = match policy {
      RecommendationPolicy::MaxSharpe => "max_sharpe".to_string(),
      RecommendationPolicy::MinVolatility => "min_volatility".to_string(),
    };
    Self {
      policy,
      weights_pct: solution
        .weights
        .entries()
        .iter()
        .map(|(s, w)| (s.clone(), w * 100.0))
        .collect(),
      expected_return: solution.expected_return,
      volatility: solution.volatility,
      sharpe: solution.sharpe,
    }
  }
}

/// Realized statistics of one side of the backtest.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PerformanceSummary {
  pub label: String,
  pub cumulative_return: f64,
  pub annualized_return: f64,
  pub annualized_volatility: f64,
  pub sharpe: f64,
}

impl From<&StrategyPerformance> for PerformanceSummary {
  fn from(perf: &StrategyPerformance) -> Self {
    Self {
      label: perf.label.clone(),
      cumulative_return: perf.cumulative_return,
      annualized_return: perf.annualized_return,
      annualized_volatility: perf.annualized_volatility,
      sharpe: perf.sharpe,
    }
  }
}

/// Strategy versus benchmark summary.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacktestPayload {
  pub strategy: PerformanceSummary,
  pub benchmark: PerformanceSummary,
  pub outperformance: f64,
}

impl From<&BacktestReport> for BacktestPayload {
  fn from(report: &BacktestReport) -> Self {
    Self {
      strategy: PerformanceSummary::from(&report.strategy),
      benchmark: PerformanceSummary::from(&report.benchmark),
      outperformance: report.outperformance,
    }
  }
}

/// All four query payloads of one completed run.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReportBundle {
  pub prices: PriceHistoryPayload,
  pub projection: ProjectionPayload,
  pub recommendation: RecommendationPayload,
  pub backtest: BacktestPayload,
}

impl From<&PipelineReport> for ReportBundle {
  fn from(report: &PipelineReport) -> Self {
    Self {
      prices: PriceHistoryPayload::from(&report.modeled_prices),
      projection: ProjectionPayload::from(&report.projection),
      recommendation: RecommendationPayload::from_solution(
        report.optimization.policy,
        report.optimization.recommended(),
      ),
      backtest: BacktestPayload::from(&report.backtest),
    }
  }
}

/// Stable machine-readable error shape for callers that surface failures.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorPayload {
  /// Stable kind tag, one per error variant.
  pub kind: String,
  pub message: String,
}

impl From<&PipelineError> for ErrorPayload {
  fn from(err: &PipelineError) -> Self {
    let kind = match err {
      PipelineError::InsufficientData(_) => "insufficient_data",
      PipelineError::NonConvergence(_) => "non_convergence",
      PipelineError::UntrainedModel(_) => "untrained_model",
      PipelineError::InfeasibleConstraints(_) => "infeasible_constraints",
      PipelineError::IllConditionedCovariance(_) => "ill_conditioned_covariance",
      PipelineError::WindowMismatch(_) => "window_mismatch",
      PipelineError::InvalidConfiguration(_) => "invalid_configuration",
    };
    Self {
      kind: kind.to_string(),
      message: err.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_relative_eq;
  use chrono::NaiveDate;

  use super::*;
  use crate::market::series_from_closes;
  use crate::portfolio::PortfolioWeights;

  #[test]
  fn price_payload_mirrors_the_series() {
    let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    let series = series_from_closes("TST", start, &[100.0, 101.0, 102.0]);
    let payload = PriceHistoryPayload::from(&series);
    assert_eq!(payload.symbol, "TST");
    assert_eq!(payload.records.len(), 3);
    assert_relative_eq!(payload.records[1].adj_close, 101.0);
  }

  #[test]
  fn recommendation_weights_are_percent() {
    let solution = PortfolioSolution {
      weights: PortfolioWeights::new(vec![
        ("A".to_string(), 0.27),
        ("B".to_string(), 0.48),
        ("C".to_string(), 0.25),
      ])
      .unwrap(),
      expected_return: 0.12,
      volatility: 0.2,
      sharpe: 0.45,
    };
    let payload =
      RecommendationPayload::from_solution(RecommendationPolicy::MaxSharpe, &solution);
    assert_eq!(payload.policy, "max_sharpe");
    assert_relative_eq!(payload.weights_pct[0].1, 27.0);
    assert_relative_eq!(payload.weights_pct[1].1, 48.0);
  }

  #[test]
  fn error_payload_has_stable_kind_tags() {
    let err = PipelineError::InfeasibleConstraints("caps sum below one".to_string());
    let payload = ErrorPayload::from(&err);
    assert_eq!(payload.kind, "infeasible_constraints");
    assert!(payload.message.contains("caps sum below one"));
  }
}
