//! # Trendfolio
//!
//! $$
//! \text{prices} \to \text{forecast} \to \text{projection} \to
//! \arg\max_{\mathbf{w}} \frac{\mathbf{w}\cdot\mu - r_f}{\sqrt{\mathbf{w}^\top \Sigma \mathbf{w}}}
//! \to \text{backtest}
//! $$
//!
//! Forecast-driven portfolio allocation. The crate fits a linear
//! autoregressive model and a recurrent sequence model on one asset's price
//! history, scores both on a held-out window, projects the champion forward
//! with widening confidence bounds, derives the asset's expected return from
//! the projection and solves a constrained mean-variance allocation that is
//! then backtested against a fixed benchmark.
//!
//! [`pipeline::Pipeline`] runs the whole sequence; the individual stages in
//! [`forecast`], [`portfolio`] and [`backtest`] are usable on their own.
//! [`report`] holds the serializable payload shapes for downstream query
//! consumers.

pub mod backtest;
pub mod error;
pub mod forecast;
pub mod market;
pub mod pipeline;
pub mod portfolio;
pub mod report;

pub use error::PipelineError;
pub use error::Result;
pub use market::PriceBar;
pub use market::PriceSeries;
pub use market::ReturnSeries;
pub use pipeline::Pipeline;
pub use pipeline::PipelineConfig;
pub use pipeline::PipelineReport;
