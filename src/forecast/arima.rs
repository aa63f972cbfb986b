//! # Linear Autoregressive Model
//!
//! $$
//! \Delta^d y_t = c + \sum_{i=1}^p \phi_i \Delta^d y_{t-i}
//!   + \sum_{j=1}^q \theta_j \varepsilon_{t-j} + \varepsilon_t
//! $$
//!
//! ARIMA fitting with automatic order selection. The differencing order `d`
//! is chosen by repeated Augmented Dickey-Fuller tests; `(p, q)` by a bounded
//! grid search scored with a pluggable information criterion. ARMA candidates
//! are fitted with the two-stage Hannan-Rissanen regression, which keeps the
//! whole search inside ordinary least squares.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use crate::error::PipelineError;
use crate::error::Result;
use crate::forecast::metrics::OrderScorer;
use crate::forecast::RecursiveForecaster;

/// ARIMA order triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArimaOrder {
  pub p: usize,
  pub d: usize,
  pub q: usize,
}

/// Bounds for the automatic order search.
#[derive(Clone, Copy, Debug)]
pub struct ArimaSearchConfig {
  /// Largest AR order considered.
  pub max_p: usize,
  /// Largest MA order considered.
  pub max_q: usize,
  /// Largest differencing order before stationarity failure is an error.
  pub max_d: usize,
  /// Minimum training-segment length.
  pub min_train_len: usize,
  /// Significance level for the unit-root test.
  pub adf_alpha: f64,
}

impl Default for ArimaSearchConfig {
  fn default() -> Self {
    Self {
      max_p: 5,
      max_q: 5,
      max_d: 2,
      min_train_len: 80,
      adf_alpha: 0.05,
    }
  }
}

/// Fitted ARIMA model. Constructed only by [`ArimaModel::fit_auto`], so an
/// instance is always in the trained state.
#[derive(Clone, Debug)]
pub struct ArimaModel {
  order: ArimaOrder,
  intercept: f64,
  ar: Vec<f64>,
  ma: Vec<f64>,
  sigma: f64,
  /// Last `p` values of the differenced training series, newest last.
  z_tail: Vec<f64>,
  /// Last `q` in-sample residuals, newest last.
  e_tail: Vec<f64>,
  /// Last observed value at each integration level `0..d`, level 0 being the
  /// original series.
  integration_tail: Vec<f64>,
  nobs: usize,
}

impl ArimaModel {
  /// Fit with automatic `(p, d, q)` selection over the bounded grid, scoring
  /// each candidate with `scorer`. The lowest-scoring candidate wins.
  pub fn fit_auto(
    series: &[f64],
    config: &ArimaSearchConfig,
    scorer: &dyn OrderScorer,
  ) -> Result<Self> {
    if series.len() < config.min_train_len {
      return Err(PipelineError::InsufficientData(format!(
        "ARIMA training requires at least {} observations, got {}",
        config.min_train_len,
        series.len()
      )));
    }
    if series.iter().any(|v| !v.is_finite()) {
      return Err(PipelineError::InvalidConfiguration(
        "ARIMA training series contains non-finite values".to_string(),
      ));
    }

    let d = choose_differencing_order(series, config.max_d, config.adf_alpha)?;
    let mut z = series.to_vec();
    let mut integration_tail = Vec::with_capacity(d);
    for _ in 0..d {
      integration_tail.push(*z.last().unwrap_or(&0.0));
      z = difference(&z);
    }

    let mut best: Option<(f64, FittedCandidate)> = None;
    for p in 0..=config.max_p {
      for q in 0..=config.max_q {
        let candidate = match fit_candidate(&z, p, q) {
          Ok(c) => c,
          // Singular design or too-short effective sample disqualifies the
          // candidate, not the search.
          Err(_) => continue,
        };

        let score = scorer.score(candidate.sse, candidate.nobs, candidate.n_params());
        if !score.is_finite() {
          continue;
        }
        debug!(p, q, d, score, "scored ARIMA candidate");

        let better = match &best {
          Some((best_score, _)) => score < *best_score,
          None => true,
        };
        if better {
          best = Some((score, candidate));
        }
      }
    }

    let (score, fit) = best.ok_or_else(|| {
      PipelineError::NonConvergence(format!(
        "no ARIMA candidate up to ({}, {d}, {}) produced a finite score",
        config.max_p, config.max_q
      ))
    })?;
    debug!(
      p = fit.p,
      q = fit.q,
      d,
      score,
      "selected ARIMA order"
    );

    let sigma = (fit.sse / fit.nobs.max(1) as f64).sqrt();
    let z_tail = z[z.len() - fit.p..].to_vec();
    let e_tail = if fit.q == 0 {
      Vec::new()
    } else {
      let n = fit.residuals.len();
      fit.residuals[n.saturating_sub(fit.q)..].to_vec()
    };

    Ok(Self {
      order: ArimaOrder { p: fit.p, d, q: fit.q },
      intercept: fit.intercept,
      ar: fit.ar,
      ma: fit.ma,
      sigma,
      z_tail,
      e_tail,
      integration_tail,
      nobs: fit.nobs,
    })
  }

  pub fn order(&self) -> ArimaOrder {
    self.order
  }

  /// Residual standard deviation on the differenced scale.
  pub fn sigma(&self) -> f64 {
    self.sigma
  }

  pub fn nobs(&self) -> usize {
    self.nobs
  }
}

impl RecursiveForecaster for ArimaModel {
  fn is_trained(&self) -> bool {
    true
  }

  fn forecast_path(&self, steps: usize) -> Result<Vec<f64>> {
    let mut z_window = self.z_tail.clone();
    let mut e_window = self.e_tail.clone();
    let mut z_path = Vec::with_capacity(steps);

    for _ in 0..steps {
      let mut z_hat = self.intercept;
      for (i, phi) in self.ar.iter().enumerate() {
        z_hat += phi * z_window[z_window.len() - 1 - i];
      }
      for (j, theta) in self.ma.iter().enumerate() {
        if j < e_window.len() {
          z_hat += theta * e_window[e_window.len() - 1 - j];
        }
      }
      if !z_hat.is_finite() {
        return Err(PipelineError::NonConvergence(
          "ARIMA recursion produced a non-finite prediction".to_string(),
        ));
      }

      z_path.push(z_hat);
      if !self.ar.is_empty() {
        z_window.push(z_hat);
        z_window.remove(0);
      }
      // Future shocks are their expectation, zero.
      if !self.ma.is_empty() {
        e_window.push(0.0);
        if e_window.len() > self.ma.len() {
          e_window.remove(0);
        }
      }
    }

    // Undo differencing by cumulative summation, innermost level first.
    let mut path = z_path;
    for level in (0..self.order.d).rev() {
      let mut last = self.integration_tail[level];
      for value in path.iter_mut() {
        last += *value;
        *value = last;
      }
    }
    Ok(path)
  }
}

struct FittedCandidate {
  p: usize,
  q: usize,
  intercept: f64,
  ar: Vec<f64>,
  ma: Vec<f64>,
  residuals: Vec<f64>,
  sse: f64,
  nobs: usize,
}

impl FittedCandidate {
  fn n_params(&self) -> usize {
    1 + self.p + self.q
  }
}

/// Hannan-Rissanen two-stage fit of an ARMA(p, q) on a stationary series.
fn fit_candidate(z: &[f64], p: usize, q: usize) -> Result<FittedCandidate> {
  if q == 0 {
    return fit_ar_candidate(z, p);
  }

  // Stage one: a long AR approximates the innovations.
  let long_order = (p.max(q) + 4).min(z.len() / 4);
  if long_order == 0 || z.len() < long_order + p.max(q) + 5 {
    return Err(PipelineError::InsufficientData(
      "sample too short for Hannan-Rissanen stage one".to_string(),
    ));
  }
  let stage_one = fit_ar_candidate(z, long_order)?;

  // Residuals of the long AR start at index `long_order` of `z`.
  let mut eps = vec![0.0; long_order];
  eps.extend_from_slice(&stage_one.residuals);

  // Stage two: regress z_t on its own lags and lagged innovation proxies.
  let start = long_order.max(p).max(q);
  let nobs = z.len() - start;
  if nobs <= 1 + p + q {
    return Err(PipelineError::InsufficientData(
      "sample too short for Hannan-Rissanen stage two".to_string(),
    ));
  }

  let mut lhs = Vec::with_capacity(nobs);
  let mut rhs = Vec::with_capacity(nobs);
  for t in start..z.len() {
    lhs.push(z[t]);
    let mut row = Vec::with_capacity(1 + p + q);
    row.push(1.0);
    for i in 1..=p {
      row.push(z[t - i]);
    }
    for j in 1..=q {
      row.push(eps[t - j]);
    }
    rhs.push(row);
  }

  let fit = ols(&lhs, &rhs)?;
  Ok(FittedCandidate {
    p,
    q,
    intercept: fit.beta[0],
    ar: fit.beta[1..=p].to_vec(),
    ma: fit.beta[1 + p..].to_vec(),
    residuals: fit.residuals,
    sse: fit.sse,
    nobs,
  })
}

fn fit_ar_candidate(z: &[f64], p: usize) -> Result<FittedCandidate> {
  let nobs = z.len().saturating_sub(p);
  if nobs <= 1 + p {
    return Err(PipelineError::InsufficientData(
      "sample too short for AR regression".to_string(),
    ));
  }

  let mut lhs = Vec::with_capacity(nobs);
  let mut rhs = Vec::with_capacity(nobs);
  for t in p..z.len() {
    lhs.push(z[t]);
    let mut row = Vec::with_capacity(1 + p);
    row.push(1.0);
    for i in 1..=p {
      row.push(z[t - i]);
    }
    rhs.push(row);
  }

  let fit = ols(&lhs, &rhs)?;
  Ok(FittedCandidate {
    p,
    q: 0,
    intercept: fit.beta[0],
    ar: fit.beta[1..].to_vec(),
    ma: Vec::new(),
    residuals: fit.residuals,
    sse: fit.sse,
    nobs,
  })
}

struct OlsFit {
  beta: Vec<f64>,
  std_err: Vec<f64>,
  residuals: Vec<f64>,
  sse: f64,
  nobs: usize,
  k: usize,
}

fn ols(y: &[f64], x: &[Vec<f64>]) -> Result<OlsFit> {
  let n = y.len();
  let k = x.first().map(|row| row.len()).unwrap_or(0);
  if n == 0 || k == 0 || n <= k || x.len() != n {
    return Err(PipelineError::InsufficientData(format!(
      "OLS requires nobs > regressors, got nobs={n} k={k}"
    )));
  }

  let mut flat = Vec::with_capacity(n * k);
  for row in x {
    flat.extend_from_slice(row);
  }
  let x_mat = DMatrix::from_row_slice(n, k, &flat);
  let y_vec = DVector::from_row_slice(y);

  let xtx = x_mat.transpose() * &x_mat;
  let xtx_inv = xtx.try_inverse().ok_or_else(|| {
    PipelineError::NonConvergence("singular design matrix in OLS".to_string())
  })?;

  let beta = &xtx_inv * x_mat.transpose() * &y_vec;
  let fitted = &x_mat * &beta;
  let residuals_vec = y_vec - fitted;

  let residuals: Vec<f64> = residuals_vec.iter().copied().collect();
  let sse = residuals.iter().map(|u| u * u).sum::<f64>();
  let sigma2 = (sse / (n - k) as f64).max(0.0);

  let cov = xtx_inv * sigma2;
  let std_err = (0..k).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();

  Ok(OlsFit {
    beta: beta.iter().copied().collect(),
    std_err,
    residuals,
    sse,
    nobs: n,
    k,
  })
}

fn difference(y: &[f64]) -> Vec<f64> {
  y.windows(2).map(|w| w[1] - w[0]).collect()
}

fn schwert_max_lags(n: usize) -> usize {
  if n <= 1 {
    return 0;
  }
  (12.0 * (n as f64 / 100.0).powf(0.25)).floor() as usize
}

/// ADF critical values for the constant-only regression, asymptotic
/// MacKinnon-style benchmarks.
fn adf_critical_value(alpha: f64) -> f64 {
  if alpha <= 0.01 {
    -3.43
  } else if alpha <= 0.05 {
    -2.86
  } else {
    -2.57
  }
}

/// Augmented Dickey-Fuller regression with a constant term:
/// `Δy_t = c + γ y_{t-1} + Σ β_i Δy_{t-i} + u_t`. Returns the t-statistic of
/// `γ`.
fn adf_statistic(y: &[f64], lags: usize) -> Result<f64> {
  let dy = difference(y);
  if dy.len() <= lags + 3 {
    return Err(PipelineError::InsufficientData(
      "series too short for ADF regression".to_string(),
    ));
  }

  let mut lhs = Vec::with_capacity(dy.len() - lags);
  let mut rhs = Vec::with_capacity(dy.len() - lags);
  for t in lags..dy.len() {
    lhs.push(dy[t]);
    let mut row = Vec::with_capacity(2 + lags);
    row.push(1.0);
    row.push(y[t]);
    for i in 1..=lags {
      row.push(dy[t - i]);
    }
    rhs.push(row);
  }

  let fit = ols(&lhs, &rhs)?;
  let gamma = fit.beta[1];
  let se = fit.std_err[1];
  if se <= 0.0 {
    return Err(PipelineError::NonConvergence(
      "degenerate standard error in ADF regression".to_string(),
    ));
  }
  Ok(gamma / se)
}

/// Lag order for the ADF regression by AIC over the Schwert bound.
fn choose_adf_lag(y: &[f64]) -> usize {
  let max_lags = schwert_max_lags(y.len()).min(y.len().saturating_sub(10));
  let mut best_lag = 0;
  let mut best_aic = f64::INFINITY;

  for lag in 0..=max_lags {
    let dy = difference(y);
    if dy.len() <= lag + 3 {
      break;
    }
    let mut lhs = Vec::new();
    let mut rhs = Vec::new();
    for t in lag..dy.len() {
      lhs.push(dy[t]);
      let mut row = Vec::with_capacity(2 + lag);
      row.push(1.0);
      row.push(y[t]);
      for i in 1..=lag {
        row.push(dy[t - i]);
      }
      rhs.push(row);
    }
    let Ok(fit) = ols(&lhs, &rhs) else { continue };
    let n = fit.nobs as f64;
    let aic = n * (fit.sse / n).ln() + 2.0 * fit.k as f64;
    if aic < best_aic {
      best_aic = aic;
      best_lag = lag;
    }
  }

  best_lag
}

/// Smallest `d <= max_d` whose `d`-times-differenced series rejects the ADF
/// unit-root null at `alpha`. Exhausting `max_d` without reaching
/// stationarity is a hard error, not a silent retry.
fn choose_differencing_order(series: &[f64], max_d: usize, alpha: f64) -> Result<usize> {
  let critical = adf_critical_value(alpha);
  let mut z = series.to_vec();

  for d in 0..=max_d {
    let lag = choose_adf_lag(&z);
    let statistic = adf_statistic(&z, lag)?;
    debug!(d, lag, statistic, critical, "ADF unit-root test");
    if statistic < critical {
      return Ok(d);
    }
    z = difference(&z);
  }

  Err(PipelineError::NonConvergence(format!(
    "series is still non-stationary after {max_d} differences"
  )))
}
