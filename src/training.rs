//! Epoch orchestration around an externally implemented model and optimizer.
//!
//! The model owns its parameters, gradients and optimizer state; this module only decides
//! the learning rate for each step, applies dynamic loss scaling for mixed precision, keeps
//! smoothed metrics and aborts on a non-finite loss.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    time::{Duration, Instant},
};

use tracing::instrument;

use crate::{Error, Result};

/// Named loss terms of one step.
pub type LossDict = BTreeMap<String, f32>;

pub trait TrainableModel {
    type Batch;

    /// Forward pass in training mode.
    fn losses(&mut self, batch: &Self::Batch) -> Result<LossDict>;

    /// Backpropagates the summed loss multiplied by `loss_scale`.
    fn backward(&mut self, loss_scale: f32) -> Result<()>;

    /// Whether every accumulated gradient is finite.
    fn gradients_finite(&self) -> bool;

    /// Applies the optimizer with gradients divided by `loss_scale`, then clears them.
    fn step(&mut self, learning_rate: f64, loss_scale: f32) -> Result<()>;

    /// Clears gradients without updating parameters.
    fn zero_grad(&mut self);
}

/// Tracks a series of values and gives access to smoothed values over a window or the
/// global series average.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: usize,
    precision: usize,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(20, 4)
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize, precision: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
            precision,
        }
    }

    pub fn update(&mut self, value: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += 1;
        self.total += value;
    }

    pub fn median(&self) -> f64 {
        let mut sorted = self.window.iter().copied().collect::<Vec<_>>();
        sorted.sort_by(f64::total_cmp);
        // lower median, matching torch.median
        sorted
            .get(sorted.len().saturating_sub(1) / 2)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.window_size == 1 {
            write!(f, "{:.*}", self.precision, self.value())
        } else {
            write!(
                f,
                "{:.*} ({:.*})",
                self.precision,
                self.median(),
                self.precision,
                self.global_avg()
            )
        }
    }
}

/// Named [`SmoothedValue`]s logged together every `print_freq` steps.
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    delimiter: String,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            meters: BTreeMap::new(),
            delimiter: delimiter.into(),
        }
    }

    pub fn add_meter(&mut self, name: impl Into<String>, meter: SmoothedValue) {
        self.meters.insert(name.into(), meter);
    }

    pub fn update(&mut self, name: &str, value: f64) {
        if let Some(meter) = self.meters.get_mut(name) {
            meter.update(value);
        } else {
            let mut meter = SmoothedValue::default();
            meter.update(value);
            self.meters.insert(name.to_string(), meter);
        }
    }

    pub fn update_all<'a>(&mut self, values: impl IntoIterator<Item = (&'a String, &'a f32)>) {
        for (name, value) in values {
            self.update(name, *value as f64);
        }
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    /// Logs `header [i/total] eta: .. meters.. time: ..` when `i` is a multiple of
    /// `print_freq` or the last step.
    pub fn log_progress(
        &self,
        header: &str,
        i: usize,
        total: usize,
        print_freq: usize,
        iter_time: &SmoothedValue,
    ) {
        if i % print_freq.max(1) != 0 && i + 1 != total {
            return;
        }
        let remaining = total.saturating_sub(i + 1) as f64;
        let eta = Duration::from_secs_f64((iter_time.global_avg() * remaining).max(0.0));
        log::info!(
            "{header} [{i}/{total}]{d}eta: {}{d}{}{d}time: {iter_time}",
            format_duration(eta),
            self,
            d = self.delimiter
        );
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .meters
            .iter()
            .map(|(name, meter)| format!("{name}: {meter}"))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join(&self.delimiter))
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// Linear learning-rate warmup from `factor` to 1 over `iters` steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupSchedule {
    pub iters: usize,
    pub factor: f64,
}

impl WarmupSchedule {
    /// Warmup used for the first epoch: factor 1/1000 over at most 1000 steps.
    pub fn for_epoch(steps_per_epoch: usize) -> Self {
        Self {
            iters: 1000.min(steps_per_epoch.saturating_sub(1)),
            factor: 1.0 / 1000.0,
        }
    }

    /// Multiplier applied to the base learning rate at `step`.
    pub fn multiplier(&self, step: usize) -> f64 {
        if step >= self.iters {
            return 1.0;
        }
        let alpha = step as f64 / self.iters as f64;
        self.factor * (1.0 - alpha) + alpha
    }
}

/// Dynamic loss scaling for mixed-precision steps.
#[derive(Debug, Clone, PartialEq)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    growth_tracker: usize,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }
}

impl GradScaler {
    pub fn with_growth_interval(mut self, interval: usize) -> Self {
        self.growth_interval = interval.max(1);
        self
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Adjusts the scale after a step; returns whether the optimizer step may be applied.
    pub fn update(&mut self, gradients_finite: bool) -> bool {
        if gradients_finite {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        } else {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            log::debug!(
                "Non-finite gradients, skipping step and lowering loss scale to {}",
                self.scale
            );
        }
        gradients_finite
    }
}

#[derive(Debug, Clone)]
pub struct EpochOptions {
    pub learning_rate: f64,
    pub print_freq: usize,
    pub warmup: bool,
}

impl Default for EpochOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            print_freq: 50,
            warmup: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub mean_loss: f64,
    pub learning_rate: f64,
    pub steps: usize,
    pub skipped_steps: usize,
}

/// Runs one epoch. A non-finite loss stops training with [`Error::NonFiniteLoss`]; the caller
/// is expected to exit with a non-zero status on it.
#[instrument(skip(model, batches, scaler))]
pub fn train_one_epoch<M: TrainableModel>(
    model: &mut M,
    batches: &[M::Batch],
    epoch: usize,
    options: &EpochOptions,
    mut scaler: Option<&mut GradScaler>,
) -> Result<EpochSummary> {
    let header = format!("Epoch: [{epoch}]");
    let mut logger = MetricLogger::default();
    logger.add_meter("lr", SmoothedValue::new(1, 6));
    let mut iter_time = SmoothedValue::default();

    let warmup = (epoch == 0 && options.warmup).then(|| WarmupSchedule::for_epoch(batches.len()));
    let learning_rate_at = |step: usize| {
        options.learning_rate * warmup.map(|it| it.multiplier(step)).unwrap_or(1.0)
    };

    let mut mean_loss = 0.0;
    let mut learning_rate = learning_rate_at(0);
    let mut skipped_steps = 0;
    for (i, batch) in batches.iter().enumerate() {
        let start = Instant::now();
        let losses = model.losses(batch)?;
        let loss = losses.values().sum::<f32>();
        mean_loss = (mean_loss * i as f64 + loss as f64) / (i + 1) as f64;

        if !loss.is_finite() {
            log::error!("Loss is {loss}, stopping training");
            log::error!("{losses:?}");
            return Err(Error::NonFiniteLoss { loss, losses });
        }

        match scaler.as_deref_mut() {
            Some(scaler) => {
                let scale = scaler.scale();
                model.backward(scale)?;
                if scaler.update(model.gradients_finite()) {
                    model.step(learning_rate, scale)?;
                } else {
                    model.zero_grad();
                    skipped_steps += 1;
                }
            }
            None => {
                model.backward(1.0)?;
                model.step(learning_rate, 1.0)?;
            }
        }

        if warmup.is_some() {
            learning_rate = learning_rate_at(i + 1);
        }

        logger.update("loss", loss as f64);
        logger.update_all(&losses);
        logger.update("lr", learning_rate);
        iter_time.update(start.elapsed().as_secs_f64());
        logger.log_progress(&header, i, batches.len(), options.print_freq, &iter_time);
    }

    Ok(EpochSummary {
        mean_loss,
        learning_rate,
        steps: batches.len(),
        skipped_steps,
    })
}
