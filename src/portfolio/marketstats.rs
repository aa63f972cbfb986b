//! # Market Statistics
//!
//! $$
//! \Sigma = 252 \cdot \widehat{\mathrm{Cov}}(r), \qquad
//! \mu_{\text{model}} = \left(\tfrac{P_H}{P_0}\right)^{252/H} - 1
//! $$
//!
//! Assembles the optimizer inputs: tail-aligned return series, an annualized
//! sample covariance matrix, and the expected-return vector. The modeled
//! asset's expectation comes from the trend projection, every other asset's
//! from its historical mean.

use crate::error::PipelineError;
use crate::error::Result;
use crate::forecast::projection::TrendProjection;
use crate::market::ReturnSeries;
use crate::market::TRADING_DAYS_PER_YEAR;

/// Symbols with their expected returns and covariance, in one index order.
#[derive(Clone, Debug)]
pub struct AssetUniverse {
  pub symbols: Vec<String>,
  /// Annualized expected returns, one per symbol.
  pub mu: Vec<f64>,
  /// Annualized covariance of daily returns, one row/column per symbol.
  pub cov: Vec<Vec<f64>>,
}

/// Trim all series to their common tail length so every column covers the
/// same trading days.
pub fn align_returns(series: &[ReturnSeries]) -> Result<Vec<Vec<f64>>> {
  let min_len = series.iter().map(|s| s.len()).min().unwrap_or(0);
  if min_len < 2 {
    return Err(PipelineError::InsufficientData(format!(
      "covariance estimation needs at least 2 common observations, got {min_len}"
    )));
  }
  Ok(
    series
      .iter()
      .map(|s| {
        let values = s.values();
        values[values.len() - min_len..].to_vec()
      })
      .collect(),
  )
}

fn sample_mean(xs: &[f64]) -> f64 {
  if xs.is_empty() {
    0.0
  } else {
    xs.iter().sum::<f64>() / xs.len() as f64
  }
}

/// Annualized sample covariance matrix over aligned daily return series.
pub fn covariance_matrix(aligned: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let n = aligned.len();
  let t = aligned.first().map(|r| r.len()).unwrap_or(0);
  let means: Vec<f64> = aligned.iter().map(|r| sample_mean(r)).collect();
  let mut cov = vec![vec![0.0; n]; n];

  if t < 2 {
    return cov;
  }

  for i in 0..n {
    for j in i..n {
      let mut acc = 0.0;
      for k in 0..t {
        acc += (aligned[i][k] - means[i]) * (aligned[j][k] - means[j]);
      }
      let value = acc / (t - 1) as f64 * TRADING_DAYS_PER_YEAR as f64;
      cov[i][j] = value;
      cov[j][i] = value;
    }
  }

  cov
}

/// Annualized historical mean returns over aligned daily return series.
pub fn mean_returns(aligned: &[Vec<f64>]) -> Vec<f64> {
  aligned
    .iter()
    .map(|r| sample_mean(r) * TRADING_DAYS_PER_YEAR as f64)
    .collect()
}

/// Diagonal shrinkage `Σ' = (1-λ)Σ + λ diag(Σ)`. Only applied when the caller
/// explicitly configures a shrinkage intensity.
pub fn shrink_covariance(cov: &[Vec<f64>], lambda: f64) -> Result<Vec<Vec<f64>>> {
  if !(0.0..=1.0).contains(&lambda) {
    return Err(PipelineError::InvalidConfiguration(format!(
      "shrinkage intensity must be in [0, 1], got {lambda}"
    )));
  }
  let n = cov.len();
  let mut out = vec![vec![0.0; n]; n];
  for i in 0..n {
    for j in 0..n {
      out[i][j] = if i == j {
        cov[i][j]
      } else {
        (1.0 - lambda) * cov[i][j]
      };
    }
  }
  Ok(out)
}

/// Annualized expected return implied by a trend projection: the total
/// projected growth compounded to a one-year rate.
pub fn projected_annual_return(last_price: f64, projection: &TrendProjection) -> Result<f64> {
  if last_price <= 0.0 || !last_price.is_finite() {
    return Err(PipelineError::InvalidConfiguration(format!(
      "last price must be positive and finite, got {last_price}"
    )));
  }
  let end = projection.last().ok_or_else(|| {
    PipelineError::InsufficientData("trend projection is empty".to_string())
  })?;
  if end.estimate <= 0.0 {
    return Err(PipelineError::NonConvergence(format!(
      "projected price {} is not positive, cannot annualize",
      end.estimate
    )));
  }

  let horizon = projection.len() as f64;
  let growth = end.estimate / last_price;
  Ok(growth.powf(TRADING_DAYS_PER_YEAR as f64 / horizon) - 1.0)
}

/// Build the optimizer universe. `modeled` replaces the historical mean of
/// that symbol with the projection-derived expectation.
pub fn build_universe(
  series: &[ReturnSeries],
  modeled: Option<(&str, f64)>,
) -> Result<AssetUniverse> {
  if series.is_empty() {
    return Err(PipelineError::InsufficientData(
      "asset universe requires at least one return series".to_string(),
    ));
  }

  let symbols: Vec<String> = series.iter().map(|s| s.symbol().to_string()).collect();
  let modeled_idx = match modeled {
    Some((modeled_symbol, modeled_return)) => {
      let idx = symbols.iter().position(|s| s == modeled_symbol).ok_or_else(|| {
        PipelineError::InvalidConfiguration(format!(
          "modeled symbol {modeled_symbol} is not part of the asset universe"
        ))
      })?;
      Some((idx, modeled_return))
    }
    None => None,
  };

  let aligned = align_returns(series)?;
  let cov = covariance_matrix(&aligned);
  let mut mu = mean_returns(&aligned);
  if let Some((idx, modeled_return)) = modeled_idx {
    mu[idx] = modeled_return;
  }

  Ok(AssetUniverse { symbols, mu, cov })
}

#[cfg(test)]
mod tests {
  use approx::assert_relative_eq;
  use chrono::NaiveDate;

  use super::*;
  use crate::market::series_from_closes;

  fn returns_of(symbol: &str, closes: &[f64]) -> ReturnSeries {
    let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    series_from_closes(symbol, start, closes).returns().unwrap()
  }

  #[test]
  fn alignment_trims_to_common_tail() {
    let a = returns_of("A", &[1.0, 1.1, 1.2, 1.3, 1.4]);
    let b = returns_of("B", &[2.0, 2.1, 2.2]);
    let aligned = align_returns(&[a, b]).unwrap();
    assert_eq!(aligned[0].len(), 2);
    assert_eq!(aligned[1].len(), 2);
  }

  #[test]
  fn covariance_is_symmetric_with_variance_diagonal() {
    let a = returns_of("A", &[100.0, 101.0, 99.5, 102.0, 101.0]);
    let b = returns_of("B", &[50.0, 50.2, 50.1, 50.4, 50.3]);
    let aligned = align_returns(&[a, b]).unwrap();
    let cov = covariance_matrix(&aligned);

    assert_relative_eq!(cov[0][1], cov[1][0], max_relative = 1e-12);
    assert!(cov[0][0] > 0.0);
    assert!(cov[1][1] > 0.0);
  }

  #[test]
  fn shrinkage_preserves_diagonal() {
    let cov = vec![vec![0.04, 0.01], vec![0.01, 0.09]];
    let shrunk = shrink_covariance(&cov, 0.5).unwrap();
    assert_relative_eq!(shrunk[0][0], 0.04);
    assert_relative_eq!(shrunk[1][1], 0.09);
    assert_relative_eq!(shrunk[0][1], 0.005);
  }

  #[test]
  fn invalid_shrinkage_is_rejected() {
    let cov = vec![vec![0.04]];
    assert!(shrink_covariance(&cov, 1.5).is_err());
  }

  #[test]
  fn modeled_symbol_overrides_historical_mean() {
    let a = returns_of("A", &[100.0, 101.0, 99.5, 102.0, 101.0]);
    let b = returns_of("B", &[50.0, 50.2, 50.1, 50.4, 50.3]);
    let universe = build_universe(&[a, b], Some(("A", 0.25))).unwrap();
    assert_relative_eq!(universe.mu[0], 0.25);
  }

  #[test]
  fn unknown_modeled_symbol_is_rejected() {
    let a = returns_of("A", &[100.0, 101.0, 99.5]);
    let err = build_universe(&[a], Some(("Z", 0.25))).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
  }
}
