//! # Recurrent Sequence Model
//!
//! $$
//! \hat x_{t+1} = g\!\left(\mathrm{LSTM}(x_{t-w+1}, \dots, x_t)\right)
//! $$
//!
//! LSTM price forecaster over a fixed-length sliding window of min-max
//! normalized prices. Training minimizes mean-squared error with AdamW over a
//! fixed epoch budget and is deterministic for a fixed random seed.

use candle_core::DType;
use candle_core::Device;
use candle_core::Tensor;
use candle_nn::linear;
use candle_nn::rnn::lstm;
use candle_nn::rnn::LSTMConfig;
use candle_nn::rnn::LSTM;
use candle_nn::AdamW;
use candle_nn::Linear;
use candle_nn::Module;
use candle_nn::Optimizer;
use candle_nn::ParamsAdamW;
use candle_nn::VarBuilder;
use candle_nn::VarMap;
use candle_nn::RNN;
use ndarray::Array2;
use ndarray::Axis;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand::SeedableRng;
use tracing::debug;

use crate::error::PipelineError;
use crate::error::Result;
use crate::forecast::RecursiveForecaster;

/// Hyperparameters for the recurrent sequence model.
#[derive(Clone, Copy, Debug)]
pub struct LstmTrainConfig {
  /// Sliding-window length in trading days.
  pub window: usize,
  /// LSTM hidden units.
  pub hidden: usize,
  /// Width of the dense layer between the LSTM and the scalar head.
  pub dense: usize,
  pub epochs: usize,
  pub batch_size: usize,
  pub learning_rate: f64,
  pub seed: u64,
}

impl Default for LstmTrainConfig {
  fn default() -> Self {
    Self {
      window: 60,
      hidden: 50,
      dense: 25,
      epochs: 50,
      batch_size: 32,
      learning_rate: 1e-3,
      seed: 42,
    }
  }
}

/// Min-max normalization to `[0, 1]`, fitted on the training segment only.
#[derive(Clone, Copy, Debug)]
struct MinMaxScaler {
  min: f64,
  max: f64,
}

impl MinMaxScaler {
  fn fit(values: &[f64]) -> Result<Self> {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() || !max.is_finite() || max - min < f64::EPSILON {
      return Err(PipelineError::InsufficientData(
        "cannot min-max normalize a constant or empty series".to_string(),
      ));
    }
    Ok(Self { min, max })
  }

  fn transform(&self, value: f64) -> f32 {
    ((value - self.min) / (self.max - self.min)) as f32
  }

  fn inverse(&self, value: f32) -> f64 {
    self.min + value as f64 * (self.max - self.min)
  }
}

struct SequenceNet {
  lstm: LSTM,
  dense: Linear,
  head: Linear,
}

impl SequenceNet {
  fn new(vs: VarBuilder, hidden: usize, dense_dim: usize) -> Result<Self> {
    let lstm = lstm(1, hidden, LSTMConfig::default(), vs.pp("lstm"))?;
    let dense = linear(hidden, dense_dim, vs.pp("dense"))?;
    let head = linear(dense_dim, 1, vs.pp("head"))?;
    Ok(Self { lstm, dense, head })
  }

  /// Forward pass over `(batch, window, 1)` inputs; returns `(batch, 1)`.
  fn forward(&self, xs: &Tensor) -> Result<Tensor> {
    let states = self.lstm.seq(xs)?;
    let last = states.last().ok_or_else(|| {
      PipelineError::NonConvergence("LSTM produced no states for an empty sequence".to_string())
    })?;
    let x = self.dense.forward(last.h())?.relu()?;
    Ok(self.head.forward(&x)?)
  }
}

/// LSTM forecaster. Untrained until [`LstmModel::fit`] succeeds; prediction
/// entry points report [`PipelineError::UntrainedModel`] before that.
pub struct LstmModel {
  config: LstmTrainConfig,
  device: Device,
  varmap: VarMap,
  net: SequenceNet,
  scaler: Option<MinMaxScaler>,
  /// Last `window` scaled training prices, newest last.
  train_tail: Vec<f32>,
}

impl LstmModel {
  pub fn new(config: LstmTrainConfig) -> Result<Self> {
    if config.window == 0 || config.hidden == 0 || config.dense == 0 || config.batch_size == 0 {
      return Err(PipelineError::InvalidConfiguration(
        "LSTM window, hidden, dense and batch_size must all be positive".to_string(),
      ));
    }

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let net = SequenceNet::new(vs, config.hidden, config.dense)?;
    seed_parameters(&varmap, &device, config.seed)?;

    Ok(Self {
      config,
      device,
      varmap,
      net,
      scaler: None,
      train_tail: Vec::new(),
    })
  }

  pub fn config(&self) -> &LstmTrainConfig {
    &self.config
  }

  /// Train on a raw price series. Requires at least `window + 2` observations
  /// so at least two supervised sequences exist.
  pub fn fit(&mut self, train: &[f64]) -> Result<()> {
    let window = self.config.window;
    if train.len() < window + 2 {
      return Err(PipelineError::InsufficientData(format!(
        "LSTM training requires at least {} observations, got {}",
        window + 2,
        train.len()
      )));
    }

    let scaler = MinMaxScaler::fit(train)?;
    let scaled: Vec<f32> = train.iter().map(|&v| scaler.transform(v)).collect();

    let n_sequences = scaled.len() - window;
    let mut x_data = Array2::<f32>::zeros((n_sequences, window));
    let mut y_data = Vec::with_capacity(n_sequences);
    for i in 0..n_sequences {
      for j in 0..window {
        x_data[[i, j]] = scaled[i + j];
      }
      y_data.push(scaled[i + window]);
    }

    let optimizer_params = ParamsAdamW {
      lr: self.config.learning_rate,
      ..ParamsAdamW::default()
    };
    let mut opt = AdamW::new(self.varmap.all_vars(), optimizer_params)?;

    let mut order: Vec<usize> = (0..n_sequences).collect();
    let mut rng = StdRng::seed_from_u64(self.config.seed);
    let mut last_loss = f32::NAN;

    for epoch in 1..=self.config.epochs {
      order.shuffle(&mut rng);

      let mut epoch_loss = 0.0_f32;
      let mut batches = 0usize;
      for start in (0..n_sequences).step_by(self.config.batch_size) {
        let end = (start + self.config.batch_size).min(n_sequences);
        let batch_idx = &order[start..end];

        let xb = x_data.select(Axis(0), batch_idx);
        let yb: Vec<f32> = batch_idx.iter().map(|&i| y_data[i]).collect();
        let xb = sequences_to_tensor(&xb, &self.device)?;
        let yb = Tensor::from_slice(&yb, (batch_idx.len(), 1), &self.device)?;

        let pred = self.net.forward(&xb)?;
        let loss = candle_nn::loss::mse(&pred, &yb)?;
        opt.backward_step(&loss)?;

        epoch_loss += loss.to_scalar::<f32>()?;
        batches += 1;
      }

      last_loss = epoch_loss / batches.max(1) as f32;
      debug!(epoch, loss = last_loss, "LSTM training epoch");
    }

    if !last_loss.is_finite() {
      return Err(PipelineError::NonConvergence(format!(
        "LSTM training loss diverged to {last_loss} after {} epochs",
        self.config.epochs
      )));
    }

    self.train_tail = scaled[scaled.len() - window..].to_vec();
    self.scaler = Some(scaler);
    Ok(())
  }

  fn trained_scaler(&self) -> Result<&MinMaxScaler> {
    self.scaler.as_ref().ok_or_else(|| {
      PipelineError::UntrainedModel("LSTM has not been fitted (missing scaler)".to_string())
    })
  }

  fn predict_scaled(&self, window: &[f32]) -> Result<f32> {
    let xs = Tensor::from_slice(window, (1, window.len(), 1), &self.device)?;
    let pred = self.net.forward(&xs)?;
    Ok(pred.flatten_all()?.to_vec1::<f32>()?[0])
  }

  /// One-step-ahead predictions for each value of `test`, conditioning on the
  /// realized history (training tail plus observed test values).
  pub fn one_step_predictions(&self, test: &[f64]) -> Result<Vec<f64>> {
    let scaler = self.trained_scaler()?;
    let window = self.config.window;

    let mut history = self.train_tail.clone();
    history.extend(test.iter().map(|&v| scaler.transform(v)));

    let mut out = Vec::with_capacity(test.len());
    for i in 0..test.len() {
      let slice = &history[i..i + window];
      let pred = self.predict_scaled(slice)?;
      out.push(scaler.inverse(pred));
    }
    Ok(out)
  }
}

impl RecursiveForecaster for LstmModel {
  fn is_trained(&self) -> bool {
    self.scaler.is_some()
  }

  fn forecast_path(&self, steps: usize) -> Result<Vec<f64>> {
    let scaler = self.trained_scaler()?;

    let mut window = self.train_tail.clone();
    let mut path = Vec::with_capacity(steps);
    for _ in 0..steps {
      let pred = self.predict_scaled(&window)?;
      if !pred.is_finite() {
        return Err(PipelineError::NonConvergence(
          "LSTM recursion produced a non-finite prediction".to_string(),
        ));
      }
      path.push(scaler.inverse(pred));
      window.push(pred);
      window.remove(0);
    }
    Ok(path)
  }
}

/// Reinitialize every network parameter from a seeded generator, uniform in
/// `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`. Variables are visited in name order
/// so a fixed seed yields identical weights on every construction.
fn seed_parameters(varmap: &VarMap, device: &Device, seed: u64) -> Result<()> {
  let vars = varmap.data().lock().map_err(|_| {
    PipelineError::NonConvergence("variable store lock poisoned".to_string())
  })?;
  let mut names: Vec<&String> = vars.keys().collect();
  names.sort();

  let mut rng = StdRng::seed_from_u64(seed);
  for name in names {
    let var = &vars[name];
    let shape = var.shape().clone();
    let fan_in = shape.dims().last().copied().unwrap_or(1).max(1);
    let limit = (1.0 / fan_in as f64).sqrt() as f32;
    let values: Vec<f32> = (0..shape.elem_count())
      .map(|_| rng.gen_range(-limit..limit))
      .collect();
    let init = Tensor::from_vec(values, shape, device)?;
    var.set(&init)?;
  }
  Ok(())
}

fn sequences_to_tensor(batch: &Array2<f32>, device: &Device) -> Result<Tensor> {
  let slice = batch.as_slice().ok_or_else(|| {
    PipelineError::NonConvergence("sequence batch must be contiguous".to_string())
  })?;
  Ok(Tensor::from_slice(
    slice,
    (batch.nrows(), batch.ncols(), 1),
    device,
  )?)
}
