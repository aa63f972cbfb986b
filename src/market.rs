//! # Market Data
//!
//! $$
//! r_t = \frac{P_t - P_{t-1}}{P_{t-1}}
//! $$
//!
//! Price and return series containers. A [`PriceSeries`] is produced by the
//! ingestion collaborator and is read-only here; everything downstream works
//! on simple daily returns derived from adjusted closes.

use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Weekday;

use crate::error::PipelineError;
use crate::error::Result;

/// Single OHLCV observation for one asset.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PriceBar {
  pub date: NaiveDate,
  pub open: f64,
  pub high: f64,
  pub low: f64,
  pub close: f64,
  /// Close adjusted for splits and dividends; all modeling uses this field.
  pub adj_close: f64,
  pub volume: f64,
}

impl PriceBar {
  /// Bar with every price field set to `adj_close`, for sources that only
  /// deliver adjusted closes.
  pub fn from_adj_close(date: NaiveDate, adj_close: f64) -> Self {
    Self {
      date,
      open: adj_close,
      high: adj_close,
      low: adj_close,
      close: adj_close,
      adj_close,
      volume: 0.0,
    }
  }
}

/// Ordered price history for one asset symbol.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PriceSeries {
  symbol: String,
  bars: Vec<PriceBar>,
}

impl PriceSeries {
  /// Validate and wrap a bar sequence. Dates must be strictly increasing and
  /// every price must be finite and positive.
  pub fn new(symbol: impl Into<String>, bars: Vec<PriceBar>) -> Result<Self> {
    let symbol = symbol.into();
    if symbol.is_empty() {
      return Err(PipelineError::InvalidConfiguration(
        "price series symbol must not be empty".to_string(),
      ));
    }

    for pair in bars.windows(2) {
      if pair[1].date <= pair[0].date {
        return Err(PipelineError::InvalidConfiguration(format!(
          "price series {symbol} has non-increasing dates at {}",
          pair[1].date
        )));
      }
    }

    for bar in &bars {
      if !bar.adj_close.is_finite() || bar.adj_close <= 0.0 {
        return Err(PipelineError::InvalidConfiguration(format!(
          "price series {symbol} has invalid adjusted close {} at {}",
          bar.adj_close, bar.date
        )));
      }
    }

    Ok(Self { symbol, bars })
  }

  pub fn symbol(&self) -> &str {
    &self.symbol
  }

  pub fn bars(&self) -> &[PriceBar] {
    &self.bars
  }

  pub fn len(&self) -> usize {
    self.bars.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bars.is_empty()
  }

  pub fn dates(&self) -> Vec<NaiveDate> {
    self.bars.iter().map(|b| b.date).collect()
  }

  pub fn adj_closes(&self) -> Vec<f64> {
    self.bars.iter().map(|b| b.adj_close).collect()
  }

  pub fn last_bar(&self) -> Option<&PriceBar> {
    self.bars.last()
  }

  /// Chronological split: bars dated `<= split` form the training segment,
  /// later bars the test segment.
  pub fn split_at(&self, split: NaiveDate) -> (PriceSeries, PriceSeries) {
    let cut = self.bars.partition_point(|b| b.date <= split);
    let train = Self {
      symbol: self.symbol.clone(),
      bars: self.bars[..cut].to_vec(),
    };
    let test = Self {
      symbol: self.symbol.clone(),
      bars: self.bars[cut..].to_vec(),
    };
    (train, test)
  }

  /// Bars within `[start, end]` inclusive.
  pub fn window(&self, start: NaiveDate, end: NaiveDate) -> PriceSeries {
    let bars = self
      .bars
      .iter()
      .filter(|b| b.date >= start && b.date <= end)
      .copied()
      .collect();
    Self {
      symbol: self.symbol.clone(),
      bars,
    }
  }

  /// Simple daily returns. Length is always `len() - 1`.
  pub fn returns(&self) -> Result<ReturnSeries> {
    ReturnSeries::from_prices(self)
  }
}

/// Ordered simple-return series derived from a [`PriceSeries`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReturnSeries {
  symbol: String,
  points: Vec<(NaiveDate, f64)>,
}

impl ReturnSeries {
  pub fn from_prices(prices: &PriceSeries) -> Result<Self> {
    if prices.len() < 2 {
      return Err(PipelineError::InsufficientData(format!(
        "need at least 2 prices to derive returns for {}, got {}",
        prices.symbol(),
        prices.len()
      )));
    }

    let points = prices
      .bars()
      .windows(2)
      .map(|w| (w[1].date, (w[1].adj_close - w[0].adj_close) / w[0].adj_close))
      .collect();

    Ok(Self {
      symbol: prices.symbol().to_string(),
      points,
    })
  }

  pub fn symbol(&self) -> &str {
    &self.symbol
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  pub fn points(&self) -> &[(NaiveDate, f64)] {
    &self.points
  }

  pub fn values(&self) -> Vec<f64> {
    self.points.iter().map(|(_, r)| *r).collect()
  }

  pub fn mean(&self) -> f64 {
    if self.points.is_empty() {
      0.0
    } else {
      self.points.iter().map(|(_, r)| r).sum::<f64>() / self.points.len() as f64
    }
  }

  /// Sample standard deviation of daily returns.
  pub fn daily_volatility(&self) -> f64 {
    if self.points.len() < 2 {
      return 0.0;
    }
    let mean = self.mean();
    let var = self
      .points
      .iter()
      .map(|(_, r)| {
        let d = r - mean;
        d * d
      })
      .sum::<f64>()
      / (self.points.len() - 1) as f64;
    var.sqrt()
  }
}

/// Number of trading days assumed per year.
pub const TRADING_DAYS_PER_YEAR: usize = 252;

/// Next `n` weekdays strictly after `last`. Stands in for an exchange
/// calendar when the ingestion collaborator supplies none; holidays are not
/// modeled.
pub fn future_trading_days(last: NaiveDate, n: usize) -> Vec<NaiveDate> {
  let mut out = Vec::with_capacity(n);
  let mut day = last;
  while out.len() < n {
    day = match day.succ_opt() {
      Some(d) => d,
      None => break,
    };
    if day.weekday() != Weekday::Sat && day.weekday() != Weekday::Sun {
      out.push(day);
    }
  }
  out
}

/// Build a weekday-dated series from raw closes, for tests.
#[cfg(test)]
pub(crate) fn series_from_closes(symbol: &str, start: NaiveDate, closes: &[f64]) -> PriceSeries {
  let dates = {
    let mut dates = vec![start];
    while dates.len() < closes.len() {
      let next = future_trading_days(*dates.last().unwrap(), 1)[0];
      dates.push(next);
    }
    dates
  };
  let bars = dates
    .into_iter()
    .zip(closes.iter())
    .map(|(d, &c)| PriceBar::from_adj_close(d, c))
    .collect();
  PriceSeries::new(symbol, bars).unwrap()
}
