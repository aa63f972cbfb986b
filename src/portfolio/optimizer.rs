//! # Portfolio Optimizer
//!
//! $$
//! \min_{\mathbf{w}} \ \mathbf{w}^\top \Sigma \mathbf{w}
//!   + \lambda (\mathbf{w}\cdot\mu - r^\*)^2
//! $$
//!
//! Efficient-frontier sweep over Nelder-Mead solves with reparameterized
//! weights. The budget constraint holds exactly by construction: long-only
//! weights come from a softmax over the search parameters, long-short weights
//! from `n - 1` free parameters with the last weight implied. Per-asset
//! bounds are enforced by penalty and verified on every returned solution.

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::solver::neldermead::NelderMead;
use tracing::debug;
use tracing::info;

use crate::error::PipelineError;
use crate::error::Result;
use crate::portfolio::marketstats::shrink_covariance;
use crate::portfolio::marketstats::AssetUniverse;
use crate::portfolio::FrontierPoint;
use crate::portfolio::OptimizationOutcome;
use crate::portfolio::PortfolioSolution;
use crate::portfolio::PortfolioWeights;
use crate::portfolio::RecommendationPolicy;
use crate::portfolio::WEIGHT_SUM_TOLERANCE;

/// Constraint and solver configuration for one optimization run.
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
  /// Annualized risk-free rate used in Sharpe computations.
  pub risk_free: f64,
  /// Permit negative weights.
  pub allow_short: bool,
  /// Optional per-asset `(lower, upper)` bounds in universe order.
  pub bounds: Option<Vec<(f64, f64)>>,
  /// Optional diagonal shrinkage intensity; near-singular covariance is an
  /// error unless the caller opts into regularization here.
  pub shrinkage: Option<f64>,
  /// Relative pivot tolerance for the positive-semidefiniteness check.
  pub psd_tolerance: f64,
  /// Number of target returns swept across the frontier.
  pub frontier_points: usize,
  /// Iteration budget per Nelder-Mead solve.
  pub max_iters: u64,
  pub policy: RecommendationPolicy,
}

impl Default for OptimizerConfig {
  fn default() -> Self {
    Self {
      risk_free: 0.0,
      allow_short: false,
      bounds: None,
      shrinkage: None,
      psd_tolerance: 1e-8,
      frontier_points: 50,
      max_iters: 5000,
      policy: RecommendationPolicy::MaxSharpe,
    }
  }
}

/// Mean-variance optimizer producing the named frontier solutions.
#[derive(Clone, Debug, Default)]
pub struct PortfolioOptimizer {
  config: OptimizerConfig,
}

impl PortfolioOptimizer {
  pub fn new(config: OptimizerConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &OptimizerConfig {
    &self.config
  }

  /// Compute the efficient frontier and the maximum-Sharpe and
  /// minimum-volatility portfolios for `universe`.
  pub fn optimize(&self, universe: &AssetUniverse) -> Result<OptimizationOutcome> {
    let n = universe.symbols.len();
    if n == 0 || universe.mu.len() != n || universe.cov.len() != n {
      return Err(PipelineError::InvalidConfiguration(format!(
        "universe dimensions disagree: {} symbols, {} returns, {} covariance rows",
        n,
        universe.mu.len(),
        universe.cov.len()
      )));
    }
    if universe.mu.iter().any(|m| !m.is_finite()) {
      return Err(PipelineError::InvalidConfiguration(
        "expected returns contain non-finite values".to_string(),
      ));
    }

    let cov = match self.config.shrinkage {
      Some(lambda) => shrink_covariance(&universe.cov, lambda)?,
      None => universe.cov.clone(),
    };
    validate_covariance(&cov, self.config.psd_tolerance)?;

    let bounds = self.effective_bounds(n)?;
    check_bound_feasibility(&bounds)?;

    let min_volatility = self.solve_and_summarize(universe, &cov, &bounds, None)?;

    let (frontier, best_sharpe) = self.sweep_frontier(universe, &cov, &bounds)?;
    let max_sharpe = match best_sharpe {
      Some(solution) => solution,
      // Degenerate frontier (all expected returns equal): the min-volatility
      // portfolio is also the best risk-adjusted one.
      None => min_volatility.clone(),
    };

    info!(
      max_sharpe = max_sharpe.sharpe,
      min_vol = min_volatility.volatility,
      points = frontier.len(),
      "portfolio optimization complete"
    );

    Ok(OptimizationOutcome {
      max_sharpe,
      min_volatility,
      frontier,
      policy: self.config.policy,
    })
  }

  fn effective_bounds(&self, n: usize) -> Result<Vec<(f64, f64)>> {
    match &self.config.bounds {
      Some(bounds) => {
        if bounds.len() != n {
          return Err(PipelineError::InvalidConfiguration(format!(
            "expected {n} bound pairs, got {}",
            bounds.len()
          )));
        }
        if !self.config.allow_short && bounds.iter().any(|(lo, _)| *lo < 0.0) {
          return Err(PipelineError::InvalidConfiguration(
            "negative lower bounds require allow_short".to_string(),
          ));
        }
        Ok(bounds.clone())
      }
      None if self.config.allow_short => Ok(vec![(-1.0, 1.0); n]),
      None => Ok(vec![(0.0, 1.0); n]),
    }
  }

  fn sweep_frontier(
    &self,
    universe: &AssetUniverse,
    cov: &[Vec<f64>],
    bounds: &[(f64, f64)],
  ) -> Result<(Vec<FrontierPoint>, Option<PortfolioSolution>)> {
    let lo = universe.mu.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = universe
      .mu
      .iter()
      .cloned()
      .fold(f64::NEG_INFINITY, f64::max);

    let targets: Vec<f64> = if hi - lo < 1e-12 {
      vec![lo]
    } else {
      let steps = self.config.frontier_points.max(2);
      (0..steps)
        .map(|i| lo + (hi - lo) * i as f64 / (steps - 1) as f64)
        .collect()
    };

    let mut frontier = Vec::with_capacity(targets.len());
    let mut best: Option<PortfolioSolution> = None;

    for target in targets {
      let solution = self.solve_and_summarize(universe, cov, bounds, Some(target))?;
      debug!(
        target,
        ret = solution.expected_return,
        vol = solution.volatility,
        sharpe = solution.sharpe,
        "frontier point"
      );
      frontier.push(FrontierPoint {
        target_return: target,
        expected_return: solution.expected_return,
        volatility: solution.volatility,
        sharpe: solution.sharpe,
      });

      let improves = match &best {
        Some(b) => solution.sharpe > b.sharpe,
        None => solution.volatility > 0.0,
      };
      if improves {
        best = Some(solution);
      }
    }

    Ok((frontier, best))
  }

  fn solve_and_summarize(
    &self,
    universe: &AssetUniverse,
    cov: &[Vec<f64>],
    bounds: &[(f64, f64)],
    target: Option<f64>,
  ) -> Result<PortfolioSolution> {
    let n = universe.symbols.len();
    let param = if self.config.allow_short {
      WeightParam::FreeLast
    } else {
      WeightParam::Softmax
    };

    let cost = AllocationCost {
      mu: universe.mu.clone(),
      cov: cov.to_vec(),
      bounds: bounds.to_vec(),
      target,
      return_penalty: 10.0,
      bound_penalty: 1e4,
      param,
    };

    let w = run_nelder_mead(cost, n, param, self.config.max_iters)?;
    self.verify_weights(&w, bounds)?;

    let expected_return = dot(&w, &universe.mu);
    let volatility = dot(&w, &mat_vec_mul(cov, &w)).max(0.0).sqrt();
    let sharpe = if volatility > 1e-15 {
      (expected_return - self.config.risk_free) / volatility
    } else {
      0.0
    };

    let entries = universe
      .symbols
      .iter()
      .cloned()
      .zip(w)
      .collect::<Vec<(String, f64)>>();
    Ok(PortfolioSolution {
      weights: PortfolioWeights::new(entries)?,
      expected_return,
      volatility,
      sharpe,
    })
  }

  /// A NaN or constraint-violating solver output must never leave the
  /// optimizer as a valid allocation.
  fn verify_weights(&self, w: &[f64], bounds: &[(f64, f64)]) -> Result<()> {
    if w.iter().any(|v| !v.is_finite()) {
      return Err(PipelineError::NonConvergence(
        "solver produced non-finite weights".to_string(),
      ));
    }

    let total: f64 = w.iter().sum();
    if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
      return Err(PipelineError::NonConvergence(format!(
        "solver weights sum to {total}, expected 1.0"
      )));
    }

    if !self.config.allow_short && w.iter().any(|v| *v < -1e-9) {
      return Err(PipelineError::NonConvergence(
        "solver produced a negative weight in a long-only run".to_string(),
      ));
    }

    for (i, (&weight, &(lo, hi))) in w.iter().zip(bounds.iter()).enumerate() {
      if weight < lo - WEIGHT_SUM_TOLERANCE || weight > hi + WEIGHT_SUM_TOLERANCE {
        return Err(PipelineError::NonConvergence(format!(
          "weight {weight} for asset {i} violates bounds [{lo}, {hi}]"
        )));
      }
    }
    Ok(())
  }
}

/// Check bounds admit at least one weight vector summing to one.
fn check_bound_feasibility(bounds: &[(f64, f64)]) -> Result<()> {
  let mut lo_sum = 0.0;
  let mut hi_sum = 0.0;
  for (i, &(lo, hi)) in bounds.iter().enumerate() {
    if lo > hi {
      return Err(PipelineError::InfeasibleConstraints(format!(
        "asset {i} has lower bound {lo} above upper bound {hi}"
      )));
    }
    lo_sum += lo;
    hi_sum += hi;
  }
  if lo_sum > 1.0 + WEIGHT_SUM_TOLERANCE || hi_sum < 1.0 - WEIGHT_SUM_TOLERANCE {
    return Err(PipelineError::InfeasibleConstraints(format!(
      "bounds admit total weight in [{lo_sum}, {hi_sum}], which excludes 1.0"
    )));
  }
  Ok(())
}

/// Symmetry plus a pivot-tolerance LDL factorization. Near-singular matrices
/// are reported, not silently regularized.
fn validate_covariance(cov: &[Vec<f64>], tolerance: f64) -> Result<()> {
  let n = cov.len();
  if cov.iter().any(|row| row.len() != n) {
    return Err(PipelineError::InvalidConfiguration(
      "covariance matrix must be square".to_string(),
    ));
  }

  let mut scale = 0.0_f64;
  for i in 0..n {
    scale = scale.max(cov[i][i].abs());
    for j in (i + 1)..n {
      let gap = (cov[i][j] - cov[j][i]).abs();
      let magnitude = cov[i][j].abs().max(cov[j][i].abs()).max(1.0);
      if gap > 1e-8 * magnitude {
        return Err(PipelineError::IllConditionedCovariance(format!(
          "covariance is asymmetric at ({i}, {j}): {} vs {}",
          cov[i][j], cov[j][i]
        )));
      }
    }
  }
  let scale = scale.max(1.0);

  let mut a: Vec<Vec<f64>> = cov.to_vec();
  for k in 0..n {
    let pivot = a[k][k];
    if !pivot.is_finite() || pivot < -tolerance * scale {
      return Err(PipelineError::IllConditionedCovariance(format!(
        "negative pivot {pivot} at index {k}; matrix is not positive semidefinite"
      )));
    }
    if pivot <= tolerance * scale {
      // Semidefinite zero pivot: the rest of its column must vanish too.
      for i in (k + 1)..n {
        if a[i][k].abs() > tolerance * scale * 10.0 {
          return Err(PipelineError::IllConditionedCovariance(format!(
            "zero pivot at index {k} with nonzero coupling; matrix is indefinite or singular"
          )));
        }
      }
      continue;
    }
    for i in (k + 1)..n {
      let factor = a[i][k] / pivot;
      for j in (k + 1)..n {
        a[i][j] -= factor * a[k][j];
      }
    }
  }
  Ok(())
}

#[derive(Clone, Copy, Debug)]
enum WeightParam {
  /// Softmax over `n` parameters; exact long-only simplex.
  Softmax,
  /// `n - 1` free weights, the last implied by the budget constraint.
  FreeLast,
}

fn to_weights(param: WeightParam, x: &[f64]) -> Vec<f64> {
  match param {
    WeightParam::Softmax => softmax(x),
    WeightParam::FreeLast => {
      let mut w = x.to_vec();
      w.push(1.0 - x.iter().sum::<f64>());
      w
    }
  }
}

fn softmax(x: &[f64]) -> Vec<f64> {
  if x.is_empty() {
    return Vec::new();
  }
  let max_x = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
  let exps: Vec<f64> = x.iter().map(|&v| (v - max_x).exp()).collect();
  let sum: f64 = exps.iter().sum();
  if sum < 1e-15 {
    vec![1.0 / x.len() as f64; x.len()]
  } else {
    exps.iter().map(|&e| e / sum).collect()
  }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
  a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn mat_vec_mul(mat: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
  mat
    .iter()
    .map(|row| row.iter().zip(v.iter()).map(|(a, b)| a * b).sum())
    .collect()
}

struct AllocationCost {
  mu: Vec<f64>,
  cov: Vec<Vec<f64>>,
  bounds: Vec<(f64, f64)>,
  target: Option<f64>,
  return_penalty: f64,
  bound_penalty: f64,
  param: WeightParam,
}

impl CostFunction for AllocationCost {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let w = to_weights(self.param, x);
    let variance = dot(&w, &mat_vec_mul(&self.cov, &w));

    let mut cost = variance;
    if let Some(target) = self.target {
      let port_ret = dot(&w, &self.mu);
      cost += self.return_penalty * (port_ret - target).powi(2);
    }
    for (&weight, &(lo, hi)) in w.iter().zip(self.bounds.iter()) {
      let below = (lo - weight).max(0.0);
      let above = (weight - hi).max(0.0);
      cost += self.bound_penalty * (below * below + above * above);
    }
    Ok(cost)
  }
}

fn run_nelder_mead(
  cost: AllocationCost,
  n_assets: usize,
  param: WeightParam,
  max_iters: u64,
) -> Result<Vec<f64>> {
  let dim = match param {
    WeightParam::Softmax => n_assets,
    WeightParam::FreeLast => n_assets - 1,
  };
  if dim == 0 {
    // Single asset: the budget constraint fully determines the weight.
    return Ok(vec![1.0]);
  }

  let x0 = match param {
    WeightParam::Softmax => vec![0.0; dim],
    WeightParam::FreeLast => vec![1.0 / n_assets as f64; dim],
  };
  let mut simplex = Vec::with_capacity(dim + 1);
  simplex.push(x0.clone());
  for i in 0..dim {
    let mut point = x0.clone();
    point[i] += match param {
      WeightParam::Softmax => 1.0,
      WeightParam::FreeLast => 0.1,
    };
    simplex.push(point);
  }

  let solver = NelderMead::new(simplex)
    .with_sd_tolerance(1e-10)
    .map_err(|e| PipelineError::NonConvergence(format!("solver setup failed: {e}")))?;
  let result = Executor::new(cost, solver)
    .configure(|state| state.max_iters(max_iters))
    .run()
    .map_err(|e| PipelineError::NonConvergence(format!("Nelder-Mead failed: {e}")))?;

  let best = result.state.best_param.ok_or_else(|| {
    PipelineError::NonConvergence("solver returned no parameter vector".to_string())
  })?;
  let param_vec = to_weights(param, &best);
  Ok(param_vec)
}

#[cfg(test)]
mod tests {
  use approx::assert_relative_eq;

  use super::*;

  fn universe(symbols: &[&str], mu: Vec<f64>, cov: Vec<Vec<f64>>) -> AssetUniverse {
    AssetUniverse {
      symbols: symbols.iter().map(|s| s.to_string()).collect(),
      mu,
      cov,
    }
  }

  #[test]
  fn weights_sum_to_one_and_are_long_only() {
    let u = universe(
      &["A", "B", "C"],
      vec![0.08, 0.12, 0.05],
      vec![
        vec![0.04, 0.01, 0.0],
        vec![0.01, 0.09, 0.02],
        vec![0.0, 0.02, 0.16],
      ],
    );
    let outcome = PortfolioOptimizer::new(OptimizerConfig::default())
      .optimize(&u)
      .unwrap();

    for solution in [&outcome.max_sharpe, &outcome.min_volatility] {
      let sum: f64 = solution.weights.entries().iter().map(|(_, w)| w).sum();
      assert!((sum - 1.0).abs() <= 1e-6);
      assert!(solution.weights.entries().iter().all(|(_, w)| *w >= -1e-9));
    }
  }

  #[test]
  fn identity_covariance_equal_returns_gives_equal_min_vol_weights() {
    let u = universe(
      &["A", "B", "C"],
      vec![0.1, 0.1, 0.1],
      vec![
        vec![1.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![0.0, 0.0, 1.0],
      ],
    );
    let outcome = PortfolioOptimizer::new(OptimizerConfig::default())
      .optimize(&u)
      .unwrap();

    for (_, w) in outcome.min_volatility.weights.entries() {
      assert_relative_eq!(*w, 1.0 / 3.0, epsilon = 0.02);
    }
  }

  #[test]
  fn max_sharpe_beats_frontier_average() {
    let u = universe(
      &["A", "B"],
      vec![0.05, 0.15],
      vec![vec![0.02, 0.0], vec![0.0, 0.08]],
    );
    let config = OptimizerConfig {
      risk_free: 0.01,
      ..OptimizerConfig::default()
    };
    let outcome = PortfolioOptimizer::new(config).optimize(&u).unwrap();

    let mean_sharpe: f64 = outcome.frontier.iter().map(|p| p.sharpe).sum::<f64>()
      / outcome.frontier.len() as f64;
    assert!(outcome.max_sharpe.sharpe >= mean_sharpe);
  }

  #[test]
  fn indefinite_covariance_is_rejected() {
    let u = universe(
      &["A", "B"],
      vec![0.1, 0.1],
      vec![vec![1.0, 2.0], vec![2.0, 1.0]],
    );
    let err = PortfolioOptimizer::new(OptimizerConfig::default())
      .optimize(&u)
      .unwrap_err();
    assert!(matches!(err, PipelineError::IllConditionedCovariance(_)));
  }

  #[test]
  fn asymmetric_covariance_is_rejected() {
    let u = universe(
      &["A", "B"],
      vec![0.1, 0.1],
      vec![vec![1.0, 0.5], vec![0.1, 1.0]],
    );
    let err = PortfolioOptimizer::new(OptimizerConfig::default())
      .optimize(&u)
      .unwrap_err();
    assert!(matches!(err, PipelineError::IllConditionedCovariance(_)));
  }

  #[test]
  fn conflicting_caps_are_infeasible() {
    let u = universe(
      &["A", "B", "C"],
      vec![0.1, 0.1, 0.1],
      vec![
        vec![0.04, 0.0, 0.0],
        vec![0.0, 0.04, 0.0],
        vec![0.0, 0.0, 0.04],
      ],
    );
    let config = OptimizerConfig {
      bounds: Some(vec![(0.0, 0.3); 3]),
      ..OptimizerConfig::default()
    };
    let err = PortfolioOptimizer::new(config).optimize(&u).unwrap_err();
    assert!(matches!(err, PipelineError::InfeasibleConstraints(_)));
  }

  #[test]
  fn shrinkage_rescues_singular_covariance_when_requested() {
    // Two perfectly correlated assets: singular without regularization.
    let cov = vec![vec![0.04, 0.04], vec![0.04, 0.04]];
    let u = universe(&["A", "B"], vec![0.08, 0.1], cov);

    let strict = PortfolioOptimizer::new(OptimizerConfig::default()).optimize(&u);
    let shrunk = PortfolioOptimizer::new(OptimizerConfig {
      shrinkage: Some(0.2),
      ..OptimizerConfig::default()
    })
    .optimize(&u);

    // The strict run may pass the semidefinite check (the matrix is PSD) but
    // the regularized one must succeed outright.
    assert!(shrunk.is_ok());
    if let Err(err) = strict {
      assert!(matches!(err, PipelineError::IllConditionedCovariance(_)));
    }
  }

  #[test]
  fn single_asset_gets_full_weight() {
    let u = universe(&["A"], vec![0.1], vec![vec![0.04]]);
    let outcome = PortfolioOptimizer::new(OptimizerConfig::default())
      .optimize(&u)
      .unwrap();
    assert_relative_eq!(outcome.max_sharpe.weights.weight("A"), 1.0);
  }

  #[test]
  fn long_short_weights_still_sum_to_one() {
    let u = universe(
      &["A", "B", "C"],
      vec![-0.05, 0.12, 0.08],
      vec![
        vec![0.04, 0.01, 0.0],
        vec![0.01, 0.09, 0.02],
        vec![0.0, 0.02, 0.16],
      ],
    );
    let config = OptimizerConfig {
      allow_short: true,
      ..OptimizerConfig::default()
    };
    let outcome = PortfolioOptimizer::new(config).optimize(&u).unwrap();
    let sum: f64 = outcome
      .max_sharpe
      .weights
      .entries()
      .iter()
      .map(|(_, w)| w)
      .sum();
    assert!((sum - 1.0).abs() <= 1e-6);
  }
}
