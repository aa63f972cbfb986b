//! # Backtester
//!
//! $$
//! R_{\text{cum}} = \prod_t (1 + \mathbf{w}\cdot\mathbf{r}_t) - 1, \qquad
//! \mathrm{Sharpe} = \frac{\bar r_p - r_f/252}{\sigma_p}\sqrt{252}
//! $$
//!
//! Evaluates a fixed-weight allocation against a benchmark over a shared
//! historical window. Weights are held constant, which is equivalent to
//! rebalancing back to target every trading day; transaction costs and
//! slippage are not modeled.

use chrono::NaiveDate;
use tracing::info;

use crate::error::PipelineError;
use crate::error::Result;
use crate::market::ReturnSeries;
use crate::market::TRADING_DAYS_PER_YEAR;
use crate::portfolio::PortfolioWeights;

/// Configuration shared by strategy and benchmark evaluation.
#[derive(Clone, Copy, Debug)]
pub struct BacktestConfig {
  /// Annualized risk-free rate used in Sharpe computations.
  pub risk_free: f64,
}

impl Default for BacktestConfig {
  fn default() -> Self {
    Self { risk_free: 0.03 }
  }
}

/// Realized statistics of one fixed-weight portfolio over the window.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StrategyPerformance {
  pub label: String,
  /// Daily portfolio returns on the shared date grid.
  pub daily_returns: Vec<(NaiveDate, f64)>,
  pub cumulative_return: f64,
  pub annualized_return: f64,
  pub annualized_volatility: f64,
  pub sharpe: f64,
}

/// Strategy versus benchmark over one window.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacktestReport {
  pub strategy: StrategyPerformance,
  pub benchmark: StrategyPerformance,
  /// Strategy cumulative return minus benchmark cumulative return.
  pub outperformance: f64,
}

/// Runs fixed-weight portfolios over aligned daily return series.
#[derive(Clone, Copy, Debug, Default)]
pub struct Backtester {
  config: BacktestConfig,
}

impl Backtester {
  pub fn new(config: BacktestConfig) -> Self {
    Self { config }
  }

  /// Evaluate `strategy` and `benchmark` over the same window and report both
  /// with their cumulative-return gap.
  pub fn run(
    &self,
    series: &[ReturnSeries],
    strategy: &PortfolioWeights,
    benchmark: &PortfolioWeights,
  ) -> Result<BacktestReport> {
    let dates = shared_date_grid(series, &[strategy, benchmark])?;
    info!(
      days = dates.len(),
      start = %dates[0],
      end = %dates[dates.len() - 1],
      "backtest window"
    );

    let strategy_perf = self.evaluate("strategy", series, strategy, &dates)?;
    let benchmark_perf = self.evaluate("benchmark", series, benchmark, &dates)?;
    let outperformance = strategy_perf.cumulative_return - benchmark_perf.cumulative_return;
    info!(
      strategy_cum = strategy_perf.cumulative_return,
      benchmark_cum = benchmark_perf.cumulative_return,
      outperformance,
      "backtest complete"
    );

    Ok(BacktestReport {
      strategy: strategy_perf,
      benchmark: benchmark_perf,
      outperformance,
    })
  }

  fn evaluate(
    &self,
    label: &str,
    series: &[ReturnSeries],
    weights: &PortfolioWeights,
    dates: &[NaiveDate],
  ) -> Result<StrategyPerformance> {
    let mut daily = vec![0.0; dates.len()];
    for s in series {
      let weight = weights.weight(s.symbol());
      if weight == 0.0 {
        continue;
      }
      for (t, (_, r)) in s.points().iter().enumerate() {
        daily[t] += weight * r;
      }
    }

    let daily_returns: Vec<(NaiveDate, f64)> =
      dates.iter().copied().zip(daily.iter().copied()).collect();
    let cumulative_return = daily.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;
    let mean = daily.iter().sum::<f64>() / daily.len() as f64;
    let variance = daily
      .iter()
      .map(|r| {
        let d = r - mean;
        d * d
      })
      .sum::<f64>()
      / (daily.len() - 1) as f64;
    let daily_std = variance.sqrt();

    let annualized_return = mean * TRADING_DAYS_PER_YEAR as f64;
    let annualized_volatility = daily_std * (TRADING_DAYS_PER_YEAR as f64).sqrt();
    let sharpe = if daily_std > 1e-15 {
      (mean - self.config.risk_free / TRADING_DAYS_PER_YEAR as f64) / daily_std
        * (TRADING_DAYS_PER_YEAR as f64).sqrt()
    } else {
      0.0
    };

    Ok(StrategyPerformance {
      label: label.to_string(),
      daily_returns,
      cumulative_return,
      annualized_return,
      annualized_volatility,
      sharpe,
    })
  }
}

/// The exact date grid every weighted series must share. Any symbol held by
/// either portfolio must be present, every present series must cover the
/// identical trading days and the window must span at least two days.
fn shared_date_grid(
  series: &[ReturnSeries],
  portfolios: &[&PortfolioWeights],
) -> Result<Vec<NaiveDate>> {
  for portfolio in portfolios {
    for symbol in portfolio.active_symbols() {
      if !series.iter().any(|s| s.symbol() == symbol) {
        return Err(PipelineError::WindowMismatch(format!(
          "no return series supplied for weighted symbol {symbol}"
        )));
      }
    }
  }

  let first = series.first().ok_or_else(|| {
    PipelineError::WindowMismatch("backtest requires at least one return series".to_string())
  })?;
  let dates: Vec<NaiveDate> = first.points().iter().map(|(d, _)| *d).collect();
  if dates.len() < 2 {
    return Err(PipelineError::WindowMismatch(format!(
      "backtest window has {} observations, need at least 2",
      dates.len()
    )));
  }

  for s in &series[1..] {
    let other: Vec<NaiveDate> = s.points().iter().map(|(d, _)| *d).collect();
    if other != dates {
      return Err(PipelineError::WindowMismatch(format!(
        "return series {} covers a different date grid than {}",
        s.symbol(),
        first.symbol()
      )));
    }
  }

  Ok(dates)
}

#[cfg(test)]
mod tests {
  use approx::assert_relative_eq;
  use chrono::NaiveDate;

  use super::*;
  use crate::market::series_from_closes;

  fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
  }

  fn weights(entries: &[(&str, f64)]) -> PortfolioWeights {
    PortfolioWeights::new(
      entries
        .iter()
        .map(|(s, w)| (s.to_string(), *w))
        .collect(),
    )
    .unwrap()
  }

  fn compounding_closes(base: f64, daily: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| base * (1.0 + daily).powi(i as i32)).collect()
  }

  #[test]
  fn single_asset_buy_and_hold_matches_price_ratio() {
    let closes = [100.0, 103.0, 101.5, 104.0, 107.2];
    let series = series_from_closes("SPY", start(), &closes).returns().unwrap();
    let report = Backtester::default()
      .run(
        &[series],
        &weights(&[("SPY", 1.0)]),
        &weights(&[("SPY", 1.0)]),
      )
      .unwrap();

    let expected = closes[closes.len() - 1] / closes[0] - 1.0;
    assert_relative_eq!(
      report.strategy.cumulative_return,
      expected,
      max_relative = 1e-9
    );
    assert_relative_eq!(report.outperformance, 0.0, epsilon = 1e-12);
  }

  #[test]
  fn constant_daily_return_compounds() {
    let closes = compounding_closes(100.0, 0.001, 101);
    let series = series_from_closes("AAA", start(), &closes).returns().unwrap();
    let report = Backtester::default()
      .run(
        &[series],
        &weights(&[("AAA", 1.0)]),
        &weights(&[("AAA", 1.0)]),
      )
      .unwrap();

    assert_relative_eq!(
      report.strategy.cumulative_return,
      1.001_f64.powi(100) - 1.0,
      max_relative = 1e-9
    );
    // Constant returns have zero variance, so Sharpe degrades to zero.
    assert_eq!(report.strategy.sharpe, 0.0);
  }

  #[test]
  fn blended_weights_mix_daily_returns() {
    let a = series_from_closes("SPY", start(), &[100.0, 102.0, 103.0, 101.0])
      .returns()
      .unwrap();
    let b = series_from_closes("BND", start(), &[50.0, 50.1, 50.3, 50.2])
      .returns()
      .unwrap();
    let strategy = weights(&[("SPY", 0.6), ("BND", 0.4)]);
    let report = Backtester::default()
      .run(&[a.clone(), b.clone()], &strategy, &strategy)
      .unwrap();

    for (t, (_, blended)) in report.strategy.daily_returns.iter().enumerate() {
      let expected = 0.6 * a.points()[t].1 + 0.4 * b.points()[t].1;
      assert_relative_eq!(*blended, expected, max_relative = 1e-12);
    }
  }

  #[test]
  fn missing_weighted_symbol_is_a_window_mismatch() {
    let a = series_from_closes("SPY", start(), &[100.0, 101.0, 102.0])
      .returns()
      .unwrap();
    let err = Backtester::default()
      .run(
        &[a],
        &weights(&[("SPY", 0.5), ("TSLA", 0.5)]),
        &weights(&[("SPY", 1.0)]),
      )
      .unwrap_err();
    assert!(matches!(err, PipelineError::WindowMismatch(_)));
  }

  #[test]
  fn different_date_grids_are_rejected() {
    let a = series_from_closes("SPY", start(), &[100.0, 101.0, 102.0, 103.0])
      .returns()
      .unwrap();
    let later = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
    let b = series_from_closes("BND", later, &[50.0, 50.1, 50.2, 50.3])
      .returns()
      .unwrap();
    let strategy = weights(&[("SPY", 0.6), ("BND", 0.4)]);
    let err = Backtester::default()
      .run(&[a, b], &strategy, &strategy)
      .unwrap_err();
    assert!(matches!(err, PipelineError::WindowMismatch(_)));
  }

  #[test]
  fn too_short_window_is_rejected() {
    let a = series_from_closes("SPY", start(), &[100.0, 101.0])
      .returns()
      .unwrap();
    let strategy = weights(&[("SPY", 1.0)]);
    let err = Backtester::default()
      .run(&[a], &strategy, &strategy)
      .unwrap_err();
    assert!(matches!(err, PipelineError::WindowMismatch(_)));
  }

  #[test]
  fn strategy_and_benchmark_are_reported_independently() {
    let a = series_from_closes("SPY", start(), &[100.0, 101.5, 100.8, 102.3, 103.0, 102.1])
      .returns()
      .unwrap();
    let b = series_from_closes("BND", start(), &[50.0, 50.1, 50.05, 50.2, 50.15, 50.3])
      .returns()
      .unwrap();
    let c = series_from_closes("TSLA", start(), &[200.0, 207.0, 199.0, 210.0, 216.0, 209.0])
      .returns()
      .unwrap();

    let strategy = weights(&[("SPY", 0.27), ("BND", 0.48), ("TSLA", 0.25)]);
    let benchmark = weights(&[("SPY", 0.6), ("BND", 0.4)]);
    let report = Backtester::default()
      .run(&[a, b, c], &strategy, &benchmark)
      .unwrap();

    // Both sides cover the identical window with the same risk-free rate;
    // neither is normalized against the other.
    assert_eq!(
      report.strategy.daily_returns.len(),
      report.benchmark.daily_returns.len()
    );
    assert_ne!(report.strategy.sharpe, report.benchmark.sharpe);
    assert_ne!(
      report.strategy.cumulative_return,
      report.benchmark.cumulative_return
    );
  }

  #[test]
  fn outperformance_is_strategy_minus_benchmark() {
    let growth = series_from_closes("TSLA", start(), &compounding_closes(100.0, 0.002, 60))
      .returns()
      .unwrap();
    let flat = series_from_closes("BND", start(), &compounding_closes(50.0, 0.0002, 60))
      .returns()
      .unwrap();

    let strategy = weights(&[("TSLA", 0.8), ("BND", 0.2)]);
    let benchmark = weights(&[("TSLA", 0.6), ("BND", 0.4)]);
    let report = Backtester::default()
      .run(&[growth, flat], &strategy, &benchmark)
      .unwrap();

    assert!(report.strategy.cumulative_return > report.benchmark.cumulative_return);
    assert_relative_eq!(
      report.outperformance,
      report.strategy.cumulative_return - report.benchmark.cumulative_return,
      max_relative = 1e-12
    );
  }
}
