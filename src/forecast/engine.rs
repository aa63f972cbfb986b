//! # Forecast Engine
//!
//! $$
//! \text{champion} = \arg\min_{m \in \{\mathrm{ARIMA}, \mathrm{LSTM}\}} \mathrm{RMSE}_m
//! $$
//!
//! Fits both model variants on the training segment of a chronological split
//! and scores them on the identical test segment. The champion is the model
//! with the lowest RMSE, ties broken by lowest MAPE.

use chrono::NaiveDate;
use tracing::info;

use crate::error::PipelineError;
use crate::error::Result;
use crate::forecast::arima::ArimaModel;
use crate::forecast::arima::ArimaSearchConfig;
use crate::forecast::lstm::LstmModel;
use crate::forecast::lstm::LstmTrainConfig;
use crate::forecast::metrics;
use crate::forecast::metrics::Aic;
use crate::forecast::ForecastResult;
use crate::forecast::ModelKind;
use crate::forecast::RecursiveForecaster;
use crate::market::PriceSeries;

/// Configuration for one engine run.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForecastEngineConfig {
  pub arima: ArimaSearchConfig,
  pub lstm: LstmTrainConfig,
}

/// Metrics for both models plus the champion tag.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelComparison {
  pub arima: ForecastResult,
  pub lstm: ForecastResult,
  /// Model consumers should use when a single best forecast is required.
  pub champion: ModelKind,
}

/// Trained models from one engine run, kept for trend projection.
pub struct TrainedModels {
  pub arima: ArimaModel,
  pub lstm: LstmModel,
}

impl TrainedModels {
  /// The champion model as a recursive forecaster.
  pub fn champion(&self, kind: ModelKind) -> &dyn RecursiveForecaster {
    match kind {
      ModelKind::LinearAutoregressive => &self.arima,
      ModelKind::RecurrentSequence => &self.lstm,
    }
  }
}

/// Fits and evaluates both forecast models for one asset.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForecastEngine {
  config: ForecastEngineConfig,
}

impl ForecastEngine {
  pub fn new(config: ForecastEngineConfig) -> Self {
    Self { config }
  }

  /// Train both models on bars dated `<= split` and evaluate them on the
  /// remainder of `prices`.
  pub fn run(
    &self,
    prices: &PriceSeries,
    split: NaiveDate,
  ) -> Result<(ModelComparison, TrainedModels)> {
    let (train, test) = prices.split_at(split);
    if test.len() < 2 {
      return Err(PipelineError::InsufficientData(format!(
        "test segment after {split} has {} observations, need at least 2",
        test.len()
      )));
    }

    let train_closes = train.adj_closes();
    let test_closes = test.adj_closes();
    let test_dates = test.dates();
    info!(
      symbol = prices.symbol(),
      train_len = train.len(),
      test_len = test.len(),
      "forecast engine split"
    );

    let arima = ArimaModel::fit_auto(&train_closes, &self.config.arima, &Aic)?;
    let arima_preds = arima.forecast_path(test_closes.len())?;
    let arima_metrics = metrics::evaluate(&test_closes, &arima_preds)?;
    info!(
      order = ?arima.order(),
      rmse = arima_metrics.rmse,
      mape = arima_metrics.mape,
      "ARIMA evaluated"
    );

    let mut lstm = LstmModel::new(self.config.lstm)?;
    lstm.fit(&train_closes)?;
    let lstm_preds = lstm.one_step_predictions(&test_closes)?;
    let lstm_metrics = metrics::evaluate(&test_closes, &lstm_preds)?;
    info!(
      rmse = lstm_metrics.rmse,
      mape = lstm_metrics.mape,
      "LSTM evaluated"
    );

    let arima_result = ForecastResult {
      kind: ModelKind::LinearAutoregressive,
      predictions: test_dates.iter().copied().zip(arima_preds).collect(),
      metrics: arima_metrics,
    };
    let lstm_result = ForecastResult {
      kind: ModelKind::RecurrentSequence,
      predictions: test_dates.into_iter().zip(lstm_preds).collect(),
      metrics: lstm_metrics,
    };

    let champion = select_champion(&arima_result, &lstm_result);
    info!(%champion, "champion model selected");

    let comparison = ModelComparison {
      arima: arima_result,
      lstm: lstm_result,
      champion,
    };
    Ok((comparison, TrainedModels { arima, lstm }))
  }
}

/// Lowest RMSE wins; ties break on lowest MAPE.
fn select_champion(arima: &ForecastResult, lstm: &ForecastResult) -> ModelKind {
  if lstm.metrics.rmse < arima.metrics.rmse {
    ModelKind::RecurrentSequence
  } else if lstm.metrics.rmse > arima.metrics.rmse {
    ModelKind::LinearAutoregressive
  } else if lstm.metrics.mape < arima.metrics.mape {
    ModelKind::RecurrentSequence
  } else {
    ModelKind::LinearAutoregressive
  }
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;
  use rand::rngs::StdRng;
  use rand::Rng;
  use rand::SeedableRng;

  use super::*;
  use crate::forecast::metrics::ErrorMetrics;
  use crate::market::series_from_closes;

  fn noisy_trend_series(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
      .map(|i| 100.0 + i as f64 * 0.2 + rng.gen_range(-1.0..1.0))
      .collect()
  }

  fn test_config() -> ForecastEngineConfig {
    ForecastEngineConfig {
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
    }
  }

  fn result_with(rmse: f64, mape: f64, kind: ModelKind) -> ForecastResult {
    ForecastResult {
      kind,
      predictions: Vec::new(),
      metrics: ErrorMetrics {
        mae: 0.0,
        rmse,
        mape,
      },
    }
  }

  #[test]
  fn champion_is_lowest_rmse() {
    let arima = result_with(5.0, 3.0, ModelKind::LinearAutoregressive);
    let lstm = result_with(4.0, 9.0, ModelKind::RecurrentSequence);
    assert_eq!(select_champion(&arima, &lstm), ModelKind::RecurrentSequence);
  }

  #[test]
  fn rmse_ties_break_on_mape() {
    let arima = result_with(5.0, 3.0, ModelKind::LinearAutoregressive);
    let lstm = result_with(5.0, 2.0, ModelKind::RecurrentSequence);
    assert_eq!(select_champion(&arima, &lstm), ModelKind::RecurrentSequence);

    let lstm_worse = result_with(5.0, 4.0, ModelKind::RecurrentSequence);
    assert_eq!(
      select_champion(&arima, &lstm_worse),
      ModelKind::LinearAutoregressive
    );
  }

  #[test]
  fn engine_scores_both_models_on_the_same_window() {
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let series = series_from_closes("TST", start, &noisy_trend_series(160, 17));
    let split = series.dates()[119];

    let engine = ForecastEngine::new(test_config());
    let (comparison, _models) = engine.run(&series, split).unwrap();

    assert_eq!(comparison.arima.predictions.len(), 40);
    assert_eq!(comparison.lstm.predictions.len(), 40);
    let arima_dates: Vec<_> = comparison.arima.predictions.iter().map(|(d, _)| *d).collect();
    let lstm_dates: Vec<_> = comparison.lstm.predictions.iter().map(|(d, _)| *d).collect();
    assert_eq!(arima_dates, lstm_dates);
  }

  #[test]
  fn identical_inputs_and_seeds_give_identical_metrics() {
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let series = series_from_closes("TST", start, &noisy_trend_series(150, 23));
    let split = series.dates()[109];
    let engine = ForecastEngine::new(test_config());

    let (first, _) = engine.run(&series, split).unwrap();
    let (second, _) = engine.run(&series, split).unwrap();

    assert_eq!(first.arima.metrics.rmse, second.arima.metrics.rmse);
    assert_eq!(first.lstm.metrics.rmse, second.lstm.metrics.rmse);
    assert_eq!(first.champion, second.champion);
  }

  #[test]
  fn empty_test_segment_is_rejected() {
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let series = series_from_closes("TST", start, &noisy_trend_series(120, 5));
    let split = *series.dates().last().unwrap();
    let engine = ForecastEngine::new(test_config());
    let err = engine.run(&series, split).err().unwrap();
    assert!(matches!(err, PipelineError::InsufficientData(_)));
  }
}
