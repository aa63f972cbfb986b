//! # Forecast
//!
//! $$
//! \hat P_{t+1} = f_\theta(P_{t-w+1}, \dots, P_t)
//! $$
//!
//! Two independent point-forecast models over one asset's price history: a
//! linear autoregressive model (ARIMA) and a recurrent sequence model (LSTM).
//! [`engine`] fits and scores both on a chronological split; [`projection`]
//! extends the winner recursively beyond the observed horizon.

pub mod arima;
pub mod engine;
pub mod lstm;
pub mod metrics;
pub mod projection;

use chrono::NaiveDate;

use crate::error::Result;
use crate::forecast::metrics::ErrorMetrics;

/// Identity of a forecast model variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ModelKind {
  /// Linear autoregressive model with differencing (ARIMA).
  LinearAutoregressive,
  /// Recurrent sequence model over a fixed sliding window (LSTM).
  RecurrentSequence,
}

impl std::fmt::Display for ModelKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ModelKind::LinearAutoregressive => write!(f, "ARIMA"),
      ModelKind::RecurrentSequence => write!(f, "LSTM"),
    }
  }
}

/// Test-window predictions and error metrics for one trained model.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ForecastResult {
  pub kind: ModelKind,
  /// Point predictions aligned with test-window dates.
  pub predictions: Vec<(NaiveDate, f64)>,
  pub metrics: ErrorMetrics,
}

/// Multi-step recursive forecasting: each predicted value becomes part of the
/// model input for the next step. No realized future data is consulted.
pub trait RecursiveForecaster {
  /// Whether the model is in the trained state.
  fn is_trained(&self) -> bool;

  /// Produce `steps` predictions beyond the end of the training data as an
  /// immutable ordered price path. Calling this repeatedly yields the same
  /// path; no hidden state survives between calls.
  fn forecast_path(&self, steps: usize) -> Result<Vec<f64>>;
}
