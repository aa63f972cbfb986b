//! # Pipeline
//!
//! Orchestrates one full analysis run: validate inputs, fit and compare
//! forecast models, refit the champion on the full history, project the
//! trend, optimize the allocation and backtest it against the benchmark.
//! Stages run strictly in order; any stage error aborts the run and nothing
//! from the failed run enters the model cache.

use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::info;

use crate::backtest::BacktestConfig;
use crate::backtest::BacktestReport;
use crate::backtest::Backtester;
use crate::error::PipelineError;
use crate::error::Result;
use crate::forecast::arima::ArimaModel;
use crate::forecast::engine::ForecastEngine;
use crate::forecast::engine::ForecastEngineConfig;
use crate::forecast::engine::ModelComparison;
use crate::forecast::lstm::LstmModel;
use crate::forecast::metrics::Aic;
use crate::forecast::projection;
use crate::forecast::projection::ProjectionContext;
use crate::forecast::projection::TrendProjection;
use crate::forecast::ModelKind;
use crate::forecast::RecursiveForecaster;
use crate::market::PriceSeries;
use crate::portfolio::marketstats;
use crate::portfolio::optimizer::OptimizerConfig;
use crate::portfolio::optimizer::PortfolioOptimizer;
use crate::portfolio::OptimizationOutcome;
use crate::portfolio::PortfolioWeights;
use crate::portfolio::RecommendationPolicy;

/// Everything one analysis run needs up front.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
  /// Asset universe, in reporting order.
  pub symbols: Vec<String>,
  /// The symbol whose expected return comes from the forecast models.
  pub modeled_symbol: String,
  /// First trading day of the analysis window.
  pub start: NaiveDate,
  /// Last training day of the model-comparison split.
  pub split: NaiveDate,
  /// Last trading day of the analysis window.
  pub end: NaiveDate,
  /// First day of the backtest window. `None` evaluates over the full
  /// analysis window; setting it holds out a disjoint evaluation period.
  pub backtest_start: Option<NaiveDate>,
  /// Projection horizon in trading days.
  pub horizon: usize,
  /// Annualized risk-free rate shared by optimizer and backtester.
  pub risk_free: f64,
  pub allow_short: bool,
  /// Optional covariance shrinkage intensity passed to the optimizer.
  pub shrinkage: Option<f64>,
  /// Benchmark allocation, weights summing to one.
  pub benchmark: Vec<(String, f64)>,
  pub policy: RecommendationPolicy,
  pub forecast: ForecastEngineConfig,
}

impl PipelineConfig {
  /// Configuration with the standard horizon, risk-free rate and 60/40
  /// benchmark over the last two listed symbols.
  pub fn new(
    symbols: Vec<String>,
    modeled_symbol: impl Into<String>,
    start: NaiveDate,
    split: NaiveDate,
    end: NaiveDate,
  ) -> Self {
    let benchmark = match symbols.as_slice() {
      [.., a, b] => vec![(a.clone(), 0.6), (b.clone(), 0.4)],
      [only] => vec![(only.clone(), 1.0)],
      [] => Vec::new(),
    };
    Self {
      symbols,
      modeled_symbol: modeled_symbol.into(),
      start,
      split,
      end,
      backtest_start: None,
      horizon: 252,
      risk_free: 0.03,
      allow_short: false,
      shrinkage: None,
      benchmark,
      policy: RecommendationPolicy::MaxSharpe,
      forecast: ForecastEngineConfig::default(),
    }
  }

  /// Fail fast on malformed configuration before any data is touched.
  pub fn validate(&self) -> Result<()> {
    if self.symbols.is_empty() {
      return Err(PipelineError::InvalidConfiguration(
        "pipeline requires at least one symbol".to_string(),
      ));
    }
    for symbol in &self.symbols {
      if self.symbols.iter().filter(|s| *s == symbol).count() > 1 {
        return Err(PipelineError::InvalidConfiguration(format!(
          "duplicate symbol {symbol} in pipeline configuration"
        )));
      }
    }
    if !self.symbols.contains(&self.modeled_symbol) {
      return Err(PipelineError::InvalidConfiguration(format!(
        "modeled symbol {} is not in the configured universe",
        self.modeled_symbol
      )));
    }
    for (symbol, _) in &self.benchmark {
      if !self.symbols.contains(symbol) {
        return Err(PipelineError::InvalidConfiguration(format!(
          "benchmark symbol {symbol} is not in the configured universe"
        )));
      }
    }
    let benchmark_total: f64 = self.benchmark.iter().map(|(_, w)| w).sum();
    if (benchmark_total - 1.0).abs() > crate::portfolio::WEIGHT_SUM_TOLERANCE {
      return Err(PipelineError::InvalidConfiguration(format!(
        "benchmark weights sum to {benchmark_total}, expected 1.0"
      )));
    }
    if !(self.start < self.split && self.split < self.end) {
      return Err(PipelineError::InvalidConfiguration(format!(
        "window boundaries must satisfy start < split < end, got {} / {} / {}",
        self.start, self.split, self.end
      )));
    }
    if let Some(backtest_start) = self.backtest_start {
      if backtest_start < self.start || backtest_start >= self.end {
        return Err(PipelineError::InvalidConfiguration(format!(
          "backtest start {backtest_start} must lie within [{}, {})",
          self.start, self.end
        )));
      }
    }
    if let Some(lambda) = self.shrinkage {
      if !lambda.is_finite() || !(0.0..=1.0).contains(&lambda) {
        return Err(PipelineError::InvalidConfiguration(format!(
          "shrinkage intensity must be in [0, 1], got {lambda}"
        )));
      }
    }
    if self.horizon == 0 {
      return Err(PipelineError::InvalidConfiguration(
        "projection horizon must be at least 1 trading day".to_string(),
      ));
    }
    if !self.risk_free.is_finite() {
      return Err(PipelineError::InvalidConfiguration(format!(
        "risk-free rate must be finite, got {}",
        self.risk_free
      )));
    }
    Ok(())
  }
}

/// Cache key: one trained model per symbol, model kind and training-window
/// end date.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
  symbol: String,
  kind: ModelKind,
  train_end: NaiveDate,
}

enum CachedModel {
  Arima(ArimaModel),
  Lstm(LstmModel),
}

impl CachedModel {
  fn as_forecaster(&self) -> &dyn RecursiveForecaster {
    match self {
      CachedModel::Arima(model) => model,
      CachedModel::Lstm(model) => model,
    }
  }
}

/// Trained models and comparisons from successful runs only.
#[derive(Default)]
pub struct ModelCache {
  models: HashMap<CacheKey, CachedModel>,
  comparisons: HashMap<(String, NaiveDate), ModelComparison>,
}

/// Artifacts produced during one run, committed to the cache only after
/// every stage has succeeded.
#[derive(Default)]
struct StagedRun {
  models: Vec<(CacheKey, CachedModel)>,
  comparison: Option<((String, NaiveDate), ModelComparison)>,
}

impl ModelCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of cached trained models.
  pub fn len(&self) -> usize {
    self.models.len()
  }

  pub fn is_empty(&self) -> bool {
    self.models.is_empty()
  }
}

/// One completed analysis run.
#[derive(Clone, Debug)]
pub struct PipelineReport {
  /// Full-window price history of the modeled asset.
  pub modeled_prices: PriceSeries,
  pub comparison: ModelComparison,
  pub projection: TrendProjection,
  pub optimization: OptimizationOutcome,
  pub backtest: BacktestReport,
}

/// Runs the full forecast-to-backtest sequence for one configuration.
pub struct Pipeline {
  config: PipelineConfig,
  cache: ModelCache,
}

impl Pipeline {
  pub fn new(config: PipelineConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      config,
      cache: ModelCache::new(),
    })
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn cache(&self) -> &ModelCache {
    &self.cache
  }

  /// Execute every stage in order over the supplied price histories.
  pub fn run(&mut self, series: &[PriceSeries]) -> Result<PipelineReport> {
    let windowed = self.ingest(series)?;
    let modeled = windowed
      .iter()
      .find(|s| s.symbol() == self.config.modeled_symbol)
      .cloned()
      .ok_or_else(|| {
        PipelineError::InvalidConfiguration(format!(
          "no price series supplied for modeled symbol {}",
          self.config.modeled_symbol
        ))
      })?;

    let mut staged = StagedRun::default();
    let comparison = self.compare_models(&modeled, &mut staged)?;
    let projection = self.project_trend(&modeled, comparison.champion, &mut staged)?;
    let optimization = self.optimize(&windowed, &modeled, &projection)?;
    let backtest = self.backtest(&windowed, &optimization)?;

    // Every stage succeeded; only now do the run's artifacts enter the cache.
    for (key, model) in staged.models {
      self.cache.models.insert(key, model);
    }
    if let Some((key, comparison)) = staged.comparison {
      self.cache.comparisons.insert(key, comparison);
    }

    Ok(PipelineReport {
      modeled_prices: modeled,
      comparison,
      projection,
      optimization,
      backtest,
    })
  }

  /// Window every configured symbol to `[start, end]` and require data for
  /// all of them.
  fn ingest(&self, series: &[PriceSeries]) -> Result<Vec<PriceSeries>> {
    let mut windowed = Vec::with_capacity(self.config.symbols.len());
    for symbol in &self.config.symbols {
      let full = series.iter().find(|s| s.symbol() == *symbol).ok_or_else(|| {
        PipelineError::InvalidConfiguration(format!(
          "no price series supplied for configured symbol {symbol}"
        ))
      })?;
      let cut = full.window(self.config.start, self.config.end);
      if cut.is_empty() {
        return Err(PipelineError::InsufficientData(format!(
          "symbol {symbol} has no bars between {} and {}",
          self.config.start, self.config.end
        )));
      }
      windowed.push(cut);
    }
    info!(assets = windowed.len(), "pipeline ingest complete");
    Ok(windowed)
  }

  fn compare_models(
    &self,
    modeled: &PriceSeries,
    staged: &mut StagedRun,
  ) -> Result<ModelComparison> {
    let (train, _) = modeled.split_at(self.config.split);
    let train_end = train.last_bar().map(|b| b.date).ok_or_else(|| {
      PipelineError::InsufficientData(format!(
        "no training bars before {} for {}",
        self.config.split,
        modeled.symbol()
      ))
    })?;

    let comparison_key = (modeled.symbol().to_string(), train_end);
    if let Some(cached) = self.cache.comparisons.get(&comparison_key) {
      info!(
        symbol = modeled.symbol(),
        %train_end,
        "model comparison cache hit"
      );
      return Ok(cached.clone());
    }

    let engine = ForecastEngine::new(self.config.forecast);
    let (comparison, models) = engine.run(modeled, self.config.split)?;

    staged.models.push((
      CacheKey {
        symbol: modeled.symbol().to_string(),
        kind: ModelKind::LinearAutoregressive,
        train_end,
      },
      CachedModel::Arima(models.arima),
    ));
    staged.models.push((
      CacheKey {
        symbol: modeled.symbol().to_string(),
        kind: ModelKind::RecurrentSequence,
        train_end,
      },
      CachedModel::Lstm(models.lstm),
    ));
    staged.comparison = Some((comparison_key, comparison.clone()));
    Ok(comparison)
  }

  /// Refit the champion kind on the full window so the projection starts
  /// after the last observed bar, then project `horizon` days ahead.
  fn project_trend(
    &self,
    modeled: &PriceSeries,
    champion: ModelKind,
    staged: &mut StagedRun,
  ) -> Result<TrendProjection> {
    let last_bar = modeled.last_bar().copied().ok_or_else(|| {
      PipelineError::InsufficientData(format!("price series {} is empty", modeled.symbol()))
    })?;
    let key = CacheKey {
      symbol: modeled.symbol().to_string(),
      kind: champion,
      train_end: last_bar.date,
    };
    let context = ProjectionContext {
      last_date: last_bar.date,
      last_price: last_bar.adj_close,
      daily_volatility: modeled.returns()?.daily_volatility(),
    };

    if let Some(model) = self.cache.models.get(&key) {
      info!(
        symbol = modeled.symbol(),
        kind = %champion,
        train_end = %last_bar.date,
        "projection model cache hit"
      );
      return projection::project(model.as_forecaster(), &context, self.config.horizon);
    }

    let closes = modeled.adj_closes();
    let model = match champion {
      ModelKind::LinearAutoregressive => CachedModel::Arima(ArimaModel::fit_auto(
        &closes,
        &self.config.forecast.arima,
        &Aic,
      )?),
      ModelKind::RecurrentSequence => {
        let mut lstm = LstmModel::new(self.config.forecast.lstm)?;
        lstm.fit(&closes)?;
        CachedModel::Lstm(lstm)
      }
    };
    let projection =
      projection::project(model.as_forecaster(), &context, self.config.horizon)?;
    staged.models.push((key, model));
    Ok(projection)
  }

  fn optimize(
    &self,
    windowed: &[PriceSeries],
    modeled: &PriceSeries,
    projection: &TrendProjection,
  ) -> Result<OptimizationOutcome> {
    let last_price = modeled
      .last_bar()
      .map(|b| b.adj_close)
      .unwrap_or(f64::NAN);
    let modeled_return = marketstats::projected_annual_return(last_price, projection)?;

    let returns = windowed
      .iter()
      .map(|s| s.returns())
      .collect::<Result<Vec<_>>>()?;
    let universe = marketstats::build_universe(
      &returns,
      Some((self.config.modeled_symbol.as_str(), modeled_return)),
    )?;

    let optimizer = PortfolioOptimizer::new(OptimizerConfig {
      risk_free: self.config.risk_free,
      allow_short: self.config.allow_short,
      shrinkage: self.config.shrinkage,
      policy: self.config.policy,
      ..OptimizerConfig::default()
    });
    optimizer.optimize(&universe)
  }

  /// Evaluate the recommendation over the backtest window. With
  /// `backtest_start` set the evaluation period is held out from the data
  /// the models and optimizer saw in full.
  fn backtest(
    &self,
    windowed: &[PriceSeries],
    optimization: &OptimizationOutcome,
  ) -> Result<BacktestReport> {
    let backtest_start = self.config.backtest_start.unwrap_or(self.config.start);
    let returns = windowed
      .iter()
      .map(|s| s.window(backtest_start, self.config.end).returns())
      .collect::<Result<Vec<_>>>()?;
    let benchmark = PortfolioWeights::new(self.config.benchmark.clone())?;
    let backtester = Backtester::new(BacktestConfig {
      risk_free: self.config.risk_free,
    });
    backtester.run(&returns, &optimization.recommended().weights, &benchmark)
  }
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;
  use rand::rngs::StdRng;
  use rand::Rng;
  use rand::SeedableRng;

  use super::*;
  use crate::forecast::arima::ArimaSearchConfig;
  use crate::forecast::lstm::LstmTrainConfig;
  use crate::market::series_from_closes;

  fn noisy_closes(base: f64, drift: f64, n: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
      .map(|i| base + i as f64 * drift + rng.gen_range(-1.0..1.0))
      .collect()
  }

  fn test_universe(n: usize) -> Vec<PriceSeries> {
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    vec![
      series_from_closes("GRW", start, &noisy_closes(100.0, 0.3, n, 7)),
      series_from_closes("IDX", start, &noisy_closes(400.0, 0.15, n, 11)),
      series_from_closes("BND", start, &noisy_closes(75.0, 0.01, n, 13)),
    ]
  }

  fn test_config(series: &[PriceSeries]) -> PipelineConfig {
    let dates = series[0].dates();
    let mut config = PipelineConfig::new(
      vec!["GRW".to_string(), "IDX".to_string(), "BND".to_string()],
      "GRW",
      dates[0],
      dates[119],
      *dates.last().unwrap(),
    );
    config.horizon = 20;
    config.forecast = ForecastEngineConfig {
      arima: ArimaSearchConfig {
        max_p: 2,
        max_q: 1,
        ..ArimaSearchConfig::default()
      },
      lstm: LstmTrainConfig {
        window: 10,
        hidden: 8,
        dense: 4,
        epochs: 2,
        batch_size: 16,
        learning_rate: 1e-2,
        seed: 42,
      },
    };
    config
  }

  #[test]
  fn full_run_produces_consistent_report() {
    let series = test_universe(160);
    let mut pipeline = Pipeline::new(test_config(&series)).unwrap();
    let report = pipeline.run(&series).unwrap();

    assert_eq!(report.projection.len(), 20);
    let weights = &report.optimization.recommended().weights;
    let sum: f64 = weights.entries().iter().map(|(_, w)| w).sum();
    assert!((sum - 1.0).abs() <= 1e-6);
    assert_eq!(report.backtest.strategy.daily_returns.len(), 159);
  }

  #[test]
  fn second_run_hits_the_model_cache() {
    let series = test_universe(160);
    let mut pipeline = Pipeline::new(test_config(&series)).unwrap();

    pipeline.run(&series).unwrap();
    let cached_models = pipeline.cache().len();
    assert!(cached_models >= 2);

    pipeline.run(&series).unwrap();
    assert_eq!(pipeline.cache().len(), cached_models);
  }

  #[test]
  fn cached_runs_are_identical() {
    let series = test_universe(160);
    let mut pipeline = Pipeline::new(test_config(&series)).unwrap();

    let first = pipeline.run(&series).unwrap();
    let second = pipeline.run(&series).unwrap();

    assert_eq!(
      first.comparison.arima.metrics.rmse,
      second.comparison.arima.metrics.rmse
    );
    assert_eq!(first.comparison.champion, second.comparison.champion);
    assert_eq!(
      first.projection.last().unwrap().estimate,
      second.projection.last().unwrap().estimate
    );
  }

  #[test]
  fn missing_series_aborts_the_run() {
    let series = test_universe(160);
    let config = test_config(&series);
    let mut pipeline = Pipeline::new(config).unwrap();
    let err = pipeline.run(&series[..2]).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
    assert!(pipeline.cache().is_empty());
  }

  #[test]
  fn late_stage_failure_leaves_cache_empty() {
    let mut series = test_universe(160);
    // Shift one symbol's date grid by a trading day. Forecasting and
    // optimization still succeed on tail-aligned returns, the backtest then
    // rejects the mismatched grids.
    series[2] = series_from_closes(
      "BND",
      NaiveDate::from_ymd_opt(2023, 1, 3).unwrap(),
      &noisy_closes(75.0, 0.01, 160, 13),
    );
    let mut pipeline = Pipeline::new(test_config(&series)).unwrap();

    let err = pipeline.run(&series).unwrap_err();
    assert!(matches!(err, PipelineError::WindowMismatch(_)));
    assert!(pipeline.cache().is_empty());
  }

  #[test]
  fn backtest_window_can_be_held_out() {
    let series = test_universe(160);
    let dates = series[0].dates();
    let holdout_start = dates[130];
    let mut config = test_config(&series);
    config.backtest_start = Some(holdout_start);

    let mut pipeline = Pipeline::new(config).unwrap();
    let report = pipeline.run(&series).unwrap();

    // 30 held-out bars yield 29 daily returns, all after the holdout start.
    assert_eq!(report.backtest.strategy.daily_returns.len(), 29);
    assert!(report
      .backtest
      .strategy
      .daily_returns
      .iter()
      .all(|(d, _)| *d > holdout_start));
  }

  #[test]
  fn validation_rejects_backtest_start_outside_window() {
    let series = test_universe(160);
    let mut config = test_config(&series);
    config.backtest_start = Some(config.end);
    assert!(config.validate().is_err());
  }

  #[test]
  fn validation_rejects_out_of_range_shrinkage() {
    let series = test_universe(160);
    let mut config = test_config(&series);
    config.shrinkage = Some(1.5);
    assert!(config.validate().is_err());
  }

  #[test]
  fn validation_rejects_unknown_modeled_symbol() {
    let series = test_universe(160);
    let mut config = test_config(&series);
    config.modeled_symbol = "NOPE".to_string();
    let err = Pipeline::new(config).err().unwrap();
    assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
  }

  #[test]
  fn validation_rejects_bad_window_order() {
    let series = test_universe(160);
    let mut config = test_config(&series);
    config.split = config.end;
    assert!(config.validate().is_err());
  }

  #[test]
  fn validation_rejects_unbalanced_benchmark() {
    let series = test_universe(160);
    let mut config = test_config(&series);
    config.benchmark = vec![("IDX".to_string(), 0.6), ("BND".to_string(), 0.3)];
    assert!(config.validate().is_err());
  }

  #[test]
  fn validation_rejects_zero_horizon() {
    let series = test_universe(160);
    let mut config = test_config(&series);
    config.horizon = 0;
    assert!(config.validate().is_err());
  }
}
