//! # Errors
//!
//! $$
//! \text{fail fast: precondition violation} \Rightarrow \text{typed error, never NaN output}
//! $$
//!
//! Typed error taxonomy shared by every pipeline stage. Each stage validates
//! its own preconditions and returns one of these variants instead of a
//! degraded numerical result.

use thiserror::Error;

/// Errors produced by the forecasting and allocation pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
  /// A training or evaluation segment is shorter than the minimum window.
  #[error("insufficient data: {0}")]
  InsufficientData(String),

  /// Order search or gradient optimization failed to produce a finite-loss
  /// model within the configured budget.
  #[error("model failed to converge: {0}")]
  NonConvergence(String),

  /// A forecast was requested from a model that has not been trained.
  #[error("model is not trained: {0}")]
  UntrainedModel(String),

  /// No weight vector satisfies the bound and budget constraints.
  #[error("infeasible portfolio constraints: {0}")]
  InfeasibleConstraints(String),

  /// The covariance matrix is not numerically positive semidefinite.
  #[error("ill-conditioned covariance matrix: {0}")]
  IllConditionedCovariance(String),

  /// Backtest window and weight vectors do not describe the same assets.
  #[error("backtest window mismatch: {0}")]
  WindowMismatch(String),

  /// Externally supplied configuration failed validation.
  #[error("invalid configuration: {0}")]
  InvalidConfiguration(String),
}

impl From<candle_core::Error> for PipelineError {
  fn from(err: candle_core::Error) -> Self {
    PipelineError::NonConvergence(format!("tensor backend failure: {err}"))
  }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
