//! Feedback-driven fine-tuning.
//!
//! A single background worker owns every retraining cycle. The feedback
//! handler only sends it a signal; the worker checks the accumulator, and once
//! the threshold is met it blends the drained feedback with a slice of the
//! original training data, fine-tunes under the model's write lock, and swaps
//! the new weights file into place.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    feedback::{FeedbackAccumulator, FeedbackSample},
    model::{persist_weights, Classifier, FitParams, FitReport, LabeledImage, ModelError},
    preprocess::{preprocess_file, ImageTensor, PreprocessError},
};

/// The one model instance shared by inference and retraining.
pub type SharedModel = Arc<RwLock<Box<dyn Classifier>>>;

#[derive(Debug, Error)]
pub enum RetrainError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("failed to load original training data: {0}")]
    OriginalData(String),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error("retraining worker crashed: {0}")]
    Worker(String),
}

#[derive(Clone, Debug)]
pub struct RetrainConfig {
    /// Feedback samples needed before a cycle runs.
    pub threshold: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Original training samples blended into every cycle.
    pub original_samples: usize,
    pub validation_split: f32,
    pub seed: u64,
    pub timeout: Duration,
    pub weights_path: PathBuf,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            epochs: 3,
            batch_size: 4,
            learning_rate: 1e-5,
            original_samples: 50,
            validation_split: 0.2,
            seed: 42,
            timeout: Duration::from_secs(600),
            weights_path: PathBuf::from("./model/oak_wilt.weights"),
        }
    }
}

/// Where the non-feedback half of a retraining batch comes from.
pub trait OriginalDataSource: Send + Sync {
    fn sample(&self, size: usize, rng: &mut StdRng) -> Result<Vec<LabeledImage>, RetrainError>;
}

/// Uniform-noise images with random labels.
///
/// Stands in for the original training set when none is deployed.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntheticDataSource;

impl OriginalDataSource for SyntheticDataSource {
    fn sample(&self, size: usize, rng: &mut StdRng) -> Result<Vec<LabeledImage>, RetrainError> {
        Ok((0..size)
            .map(|_| LabeledImage {
                image: ImageTensor::from_fn(|| rng.gen::<f32>()),
                label: rng.gen_range(0..=1),
            })
            .collect())
    }
}

/// Held-out images on disk, split into `healthy/` (label 0) and
/// `oak_wilt/` (label 1).
#[derive(Clone, Debug)]
pub struct DirectoryDataSource {
    samples: Vec<(PathBuf, u8)>,
}

const DATA_CLASSES: [(&str, u8); 2] = [("healthy", 0), ("oak_wilt", 1)];

impl DirectoryDataSource {
    pub fn from_directory(data_dir: &Path) -> Result<Self, RetrainError> {
        let mut samples = Vec::new();
        for (class_name, label) in DATA_CLASSES {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                continue;
            }
            let entries = fs::read_dir(&class_dir)
                .map_err(|err| RetrainError::OriginalData(format!("{}: {err}", class_dir.display())))?;
            for entry in entries {
                let path = entry
                    .map_err(|err| RetrainError::OriginalData(err.to_string()))?
                    .path();
                if path.is_file() && crate::utils::allowed_file(&path.to_string_lossy()) {
                    samples.push((path, label));
                }
            }
        }

        if samples.is_empty() {
            return Err(RetrainError::OriginalData(format!(
                "no training images under {}",
                data_dir.display()
            )));
        }
        samples.sort();
        info!(dir = %data_dir.display(), count = samples.len(), "indexed original training data");
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl OriginalDataSource for DirectoryDataSource {
    fn sample(&self, size: usize, rng: &mut StdRng) -> Result<Vec<LabeledImage>, RetrainError> {
        self.samples
            .choose_multiple(rng, size)
            .map(|(path, label)| -> Result<LabeledImage, RetrainError> {
                Ok(LabeledImage {
                    image: preprocess_file(path)?,
                    label: *label,
                })
            })
            .collect()
    }
}

/// Shuffles with a fixed seed and splits off the validation share.
///
/// The validation size is rounded up, so any non-zero ratio on a non-empty
/// set yields at least one validation sample.
pub fn train_validation_split(
    mut samples: Vec<LabeledImage>,
    validation_ratio: f32,
    seed: u64,
) -> (Vec<LabeledImage>, Vec<LabeledImage>) {
    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);

    let ratio = validation_ratio.clamp(0.0, 1.0);
    let validation_len = ((samples.len() as f32) * ratio).ceil() as usize;
    let validation = samples.split_off(samples.len() - validation_len.min(samples.len()));
    (samples, validation)
}

/// Runs one retraining cycle against an already locked model.
///
/// `cycle` perturbs the sampling seed so consecutive cycles draw different
/// original data while a restart replays the same sequence.
pub fn run_cycle(
    model: &mut dyn Classifier,
    feedback: &[FeedbackSample],
    source: &dyn OriginalDataSource,
    config: &RetrainConfig,
    cycle: u64,
) -> Result<FitReport, RetrainError> {
    let started = Instant::now();
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(cycle));

    let mut samples = feedback.to_vec();
    samples.extend(source.sample(config.original_samples, &mut rng)?);
    let total = samples.len();
    let (train, validation) = train_validation_split(samples, config.validation_split, config.seed);
    info!(
        cycle,
        feedback = feedback.len(),
        total,
        train = train.len(),
        validation = validation.len(),
        "retraining started"
    );

    let params = FitParams {
        epochs: config.epochs,
        batch_size: config.batch_size,
        learning_rate: config.learning_rate,
        deadline: Some(started + config.timeout),
    };
    let report = model.fit(&train, &validation, &params)?;

    // No quality gate: the new weights are promoted whatever the validation loss.
    persist_weights(model, &config.weights_path)?;
    info!(
        cycle,
        elapsed = ?started.elapsed(),
        train_loss = ?report.train_loss,
        validation_loss = ?report.validation_loss,
        "retraining finished"
    );
    Ok(report)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrainState {
    Idle,
    Retraining,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetrainStats {
    pub state: RetrainState,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub last_error: Option<String>,
}

/// Observable progress of the retraining worker.
#[derive(Debug, Default)]
pub struct RetrainStatus {
    retraining: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
    finished: Notify,
}

impl RetrainStatus {
    pub fn state(&self) -> RetrainState {
        if self.retraining.load(Ordering::SeqCst) {
            RetrainState::Retraining
        } else {
            RetrainState::Idle
        }
    }

    pub fn stats(&self) -> RetrainStats {
        RetrainStats {
            state: self.state(),
            cycles_completed: self.completed.load(Ordering::SeqCst),
            cycles_failed: self.failed.load(Ordering::SeqCst),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn cycles_finished(&self) -> u64 {
        self.completed.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
    }

    /// Waits until at least `cycles` cycles have finished, successfully or not.
    pub async fn wait_for_cycles(&self, cycles: u64) {
        loop {
            let finished = self.finished.notified();
            if self.cycles_finished() >= cycles {
                return;
            }
            finished.await;
        }
    }

    fn begin(&self) {
        self.retraining.store(true, Ordering::SeqCst);
    }

    fn end(&self, outcome: &Result<FitReport, RetrainError>) {
        match outcome {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
            }
        }
        self.retraining.store(false, Ordering::SeqCst);
        self.finished.notify_waiters();
    }
}

/// Sends retraining signals to the worker.
#[derive(Clone, Debug)]
pub struct RetrainHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl RetrainHandle {
    /// Asks the worker to check the accumulator. Never blocks.
    pub fn trigger(&self) {
        if self.tx.send(()).is_err() {
            warn!("retraining worker is gone, feedback will stay queued");
        }
    }
}

#[derive(Clone)]
pub struct RetrainWorker {
    model: SharedModel,
    accumulator: Arc<FeedbackAccumulator>,
    source: Arc<dyn OriginalDataSource>,
    config: Arc<RetrainConfig>,
    status: Arc<RetrainStatus>,
}

impl RetrainWorker {
    pub fn new(
        model: SharedModel,
        accumulator: Arc<FeedbackAccumulator>,
        source: Arc<dyn OriginalDataSource>,
        config: RetrainConfig,
        status: Arc<RetrainStatus>,
    ) -> Self {
        Self {
            model,
            accumulator,
            source,
            config: Arc::new(config),
            status,
        }
    }

    /// Starts the worker loop on the current tokio runtime.
    pub fn spawn(self) -> RetrainHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        RetrainHandle { tx }
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<()>) {
        info!(threshold = self.config.threshold, "retraining worker started");
        while rx.recv().await.is_some() {
            self.try_cycle().await;
        }
        info!("retraining worker stopped");
    }

    /// Runs a cycle if the accumulator has reached the threshold.
    ///
    /// Returns `None` when there was not enough feedback yet.
    pub async fn try_cycle(&self) -> Option<Result<FitReport, RetrainError>> {
        let Some(batch) = self.accumulator.drain_if_threshold_met(self.config.threshold) else {
            debug!(
                queued = self.accumulator.len(),
                threshold = self.config.threshold,
                "not enough feedback to retrain yet"
            );
            return None;
        };

        self.status.begin();
        let cycle = self.status.cycles_finished();
        let model = Arc::clone(&self.model);
        let source = Arc::clone(&self.source);
        let config = Arc::clone(&self.config);

        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = model.blocking_write();
            let outcome = run_cycle(guard.as_mut(), &batch, source.as_ref(), &config, cycle);
            if outcome.is_err() {
                roll_back(guard.as_mut(), &config.weights_path);
            }
            (outcome, batch)
        })
        .await;

        let outcome = match joined {
            Ok((Ok(report), _)) => Ok(report),
            Ok((Err(err), batch)) => {
                error!(error = %err, queued_back = batch.len(), "retraining failed");
                self.accumulator.requeue(batch);
                Err(err)
            }
            Err(err) => {
                error!(error = %err, "retraining task panicked, feedback batch lost");
                Err(RetrainError::Worker(err.to_string()))
            }
        };
        self.status.end(&outcome);
        Some(outcome)
    }
}

/// Reloads the last persisted weights after a failed cycle.
fn roll_back(model: &mut dyn Classifier, weights_path: &Path) {
    if !weights_path.exists() {
        warn!(
            path = %weights_path.display(),
            "no persisted weights to roll back to, in-memory model may hold partial updates"
        );
        return;
    }
    match model.restore(weights_path) {
        Ok(()) => info!(path = %weights_path.display(), "rolled back to persisted weights"),
        Err(err) => error!(error = %err, "failed to roll back to persisted weights"),
    }
}
