//! The classifier seam.
//!
//! The service only ever talks to a `dyn Classifier`. The TensorFlow
//! SavedModel backend lives in [`saved_model`]; tests plug in their own
//! implementations.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::preprocess::ImageTensor;

#[cfg(feature = "tensorflow")]
pub mod saved_model;

#[cfg(feature = "tensorflow")]
pub use saved_model::SavedModelClassifier;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("model runtime error: {0}")]
    Runtime(String),

    #[error("model returned no output")]
    EmptyOutput,

    #[error("training deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("model I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "tensorflow")]
impl From<tensorflow::Status> for ModelError {
    fn from(status: tensorflow::Status) -> Self {
        ModelError::Runtime(status.to_string())
    }
}

/// A preprocessed image with a binary training target.
#[derive(Clone, Debug, PartialEq)]
pub struct LabeledImage {
    pub image: ImageTensor,
    /// 0 or 1.
    pub label: u8,
}

impl LabeledImage {
    pub fn target(&self) -> f32 {
        f32::from(self.label.min(1))
    }
}

#[derive(Clone, Debug)]
pub struct FitParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Checked between mini-batches; `None` means no watchdog.
    pub deadline: Option<Instant>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FitReport {
    pub epochs: usize,
    pub steps: usize,
    pub train_loss: Option<f32>,
    pub validation_loss: Option<f32>,
}

pub trait Classifier: Send + Sync {
    /// Probability in `[0, 1]` that the image shows oak wilt.
    fn predict(&self, image: &ImageTensor) -> Result<f32, ModelError>;

    /// Runs one optimizer step on a mini-batch and returns its loss.
    fn train_step(&mut self, batch: &[LabeledImage], learning_rate: f32) -> Result<f32, ModelError>;

    /// Mean loss over a batch without touching the weights.
    fn evaluate(&self, batch: &[LabeledImage]) -> Result<f32, ModelError>;

    /// Writes the current weights to `path` as exactly one file.
    ///
    /// Prefix-style checkpoint sets (`.index` plus `.data-*` shards) break
    /// the rename in [`persist_weights`].
    fn save(&self, path: &Path) -> Result<(), ModelError>;

    /// Replaces the current weights with the ones stored at `path`.
    fn restore(&mut self, path: &Path) -> Result<(), ModelError>;

    /// Fine-tunes the model in place over mini-batches of `train`.
    ///
    /// An empty training set is a no-op. Validation loss is computed at the
    /// end of every epoch when `validation` is non-empty.
    fn fit(
        &mut self,
        train: &[LabeledImage],
        validation: &[LabeledImage],
        params: &FitParams,
    ) -> Result<FitReport, ModelError> {
        let mut report = FitReport::default();
        if train.is_empty() {
            return Ok(report);
        }
        let started = Instant::now();
        let batch_size = params.batch_size.max(1);

        for epoch in 1..=params.epochs {
            let mut weighted_loss = 0.0;
            for batch in train.chunks(batch_size) {
                if params.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Err(ModelError::DeadlineExceeded(started.elapsed()));
                }
                let loss = self.train_step(batch, params.learning_rate)?;
                weighted_loss += loss * batch.len() as f32;
                report.steps += 1;
                debug!(epoch, step = report.steps, loss, "training step");
            }
            report.epochs = epoch;
            report.train_loss = Some(weighted_loss / train.len() as f32);
            report.validation_loss = if validation.is_empty() {
                None
            } else {
                Some(evaluate_batched(&*self, validation, batch_size)?)
            };
            info!(
                epoch,
                epochs = params.epochs,
                train_loss = ?report.train_loss,
                validation_loss = ?report.validation_loss,
                "epoch finished"
            );
        }

        Ok(report)
    }
}

fn evaluate_batched<C: Classifier + ?Sized>(
    model: &C,
    samples: &[LabeledImage],
    batch_size: usize,
) -> Result<f32, ModelError> {
    let mut total = 0.0;
    for batch in samples.chunks(batch_size) {
        total += model.evaluate(batch)? * batch.len() as f32;
    }
    Ok(total / samples.len() as f32)
}

/// Saves the model next to `path` and renames it into place.
///
/// A failed save leaves whatever was at `path` untouched.
pub fn persist_weights(model: &dyn Classifier, path: &Path) -> Result<(), ModelError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let staged = with_suffix(path, "tmp");
    if let Err(err) = model.save(&staged) {
        let _ = fs::remove_file(&staged);
        return Err(err);
    }
    if !staged.is_file() {
        return Err(ModelError::Runtime(format!(
            "save produced no single weights file at {}",
            staged.display()
        )));
    }
    fs::rename(&staged, path)?;
    info!(path = %path.display(), "model weights persisted");
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("weights")
        .to_string();
    name.push('.');
    name.push_str(suffix);
    path.with_file_name(name)
}
