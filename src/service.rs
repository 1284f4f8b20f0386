//! The service object tying the model, the feedback queue and the retraining
//! worker together.
//!
//! Inference takes the model's read lock; a retraining cycle holds the write
//! lock for its whole duration, so classification requests that arrive
//! mid-cycle wait for it to finish instead of seeing half-trained weights.
//! That wait is bounded by the inference timeout; a cycle stuck inside a
//! single training step turns into `ModelBusy` errors, not hung requests.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    feedback::{feedback_sample, FeedbackAccumulator},
    gps::gps_coordinates,
    model::{Classifier, ModelError},
    preprocess::{preprocess, preprocess_file, ImageTensor, PreprocessError},
    results::{write_result_files, PredictionResult, ResultFiles, TierMap},
    retrain::{
        OriginalDataSource, RetrainHandle, RetrainStats, RetrainStatus, RetrainWorker, SharedModel,
    },
    utils::secure_filename,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("could not read image {filename}: {source}")]
    UnreadableImage {
        filename: String,
        source: PreprocessError,
    },

    #[error("could not load image {filename} for feedback: {source}")]
    FeedbackImage {
        filename: String,
        source: PreprocessError,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model still busy retraining after {0:?}")]
    ModelBusy(Duration),

    #[error("failed to store {path}: {source}")]
    Storage {
        path: String,
        source: std::io::Error,
    },
}

/// An accepted upload with an already sanitized filename.
#[derive(Clone, Debug)]
pub struct UploadedImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct OakWiltService {
    model: SharedModel,
    accumulator: Arc<FeedbackAccumulator>,
    status: Arc<RetrainStatus>,
    retrain: RetrainHandle,
    images_dir: PathBuf,
    results_dir: PathBuf,
    inference_timeout: Duration,
}

impl OakWiltService {
    /// Creates the storage directories and spawns the retraining worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        model: Box<dyn Classifier>,
        source: Arc<dyn OriginalDataSource>,
        config: &Config,
    ) -> Result<Self, ServiceError> {
        for dir in [&config.images_dir, &config.results_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ServiceError::Storage {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let model: SharedModel = Arc::new(RwLock::new(model));
        let accumulator = Arc::new(FeedbackAccumulator::new());
        let status = Arc::new(RetrainStatus::default());
        let retrain = RetrainWorker::new(
            Arc::clone(&model),
            Arc::clone(&accumulator),
            source,
            config.retrain.clone(),
            Arc::clone(&status),
        )
        .spawn();

        Ok(Self {
            model,
            accumulator,
            status,
            retrain,
            images_dir: config.images_dir.clone(),
            results_dir: config.results_dir.clone(),
            inference_timeout: config.inference_timeout,
        })
    }

    pub async fn classify(&self, image: &ImageTensor) -> Result<f32, ServiceError> {
        let model = tokio::time::timeout(self.inference_timeout, self.model.read())
            .await
            .map_err(|_| {
                warn!(timeout = ?self.inference_timeout, "model lock not released in time");
                ServiceError::ModelBusy(self.inference_timeout)
            })?;
        Ok(model.predict(image)?)
    }

    /// Preprocesses, classifies and geotags one uploaded image.
    pub async fn classify_upload(&self, upload: &UploadedImage) -> Result<PredictionResult, ServiceError> {
        let tensor = preprocess(&upload.bytes).map_err(|source| ServiceError::UnreadableImage {
            filename: upload.filename.clone(),
            source,
        })?;
        let probability = self.classify(&tensor).await?;
        let coordinates = gps_coordinates(&upload.bytes);
        Ok(PredictionResult::new(&upload.filename, probability, coordinates))
    }

    /// Classifies a batch, stores every image for later feedback, and
    /// regenerates the result files.
    pub async fn process_uploads(&self, uploads: Vec<UploadedImage>) -> Result<TierMap, ServiceError> {
        let mut results = TierMap::new();
        for upload in uploads {
            let result = self.classify_upload(&upload).await?;
            self.store_image(&upload).await?;
            info!(
                filename = %result.filename,
                prediction = %result.prediction_label(),
                classification = %result.classification,
                "classified upload"
            );
            results.push(result);
        }
        self.export_results(&results);
        Ok(results)
    }

    async fn store_image(&self, upload: &UploadedImage) -> Result<PathBuf, ServiceError> {
        let path = self.images_dir.join(&upload.filename);
        tokio::fs::write(&path, &upload.bytes)
            .await
            .map_err(|source| ServiceError::Storage {
                path: path.display().to_string(),
                source,
            })?;
        Ok(path)
    }

    /// Writes the result files. Failures are logged and otherwise ignored.
    pub fn export_results(&self, results: &TierMap) -> Option<ResultFiles> {
        match write_result_files(&self.results_dir, results) {
            Ok(files) => {
                info!(
                    csv = %files.csv.display(),
                    geojson = %files.geojson.display(),
                    "result files written"
                );
                Some(files)
            }
            Err(err) => {
                error!(error = %err, "failed to write result files");
                None
            }
        }
    }

    /// Queues a correction for a previously uploaded image and wakes the
    /// retraining worker. Returns the queue length.
    ///
    /// The outcome of any retraining this triggers is not reported here.
    pub async fn submit_feedback(&self, filename: &str, is_correct: bool) -> Result<usize, ServiceError> {
        let path = self.image_path(filename);
        let tensor = tokio::task::spawn_blocking({
            let path = path.clone();
            move || preprocess_file(&path)
        })
        .await
        .map_err(|err| ServiceError::Storage {
            path: path.display().to_string(),
            source: std::io::Error::other(err.to_string()),
        })?
        .map_err(|source| {
            warn!(filename, "could not load image for feedback processing");
            ServiceError::FeedbackImage {
                filename: filename.to_string(),
                source,
            }
        })?;

        let queued = self.accumulator.add(feedback_sample(tensor, is_correct));
        info!(filename, is_correct, queued, "feedback added to retraining batch");
        self.retrain.trigger();
        Ok(queued)
    }

    /// Location of a stored image. The name is sanitized first.
    pub fn image_path(&self, filename: &str) -> PathBuf {
        self.images_dir.join(secure_filename(filename))
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn feedback_queued(&self) -> usize {
        self.accumulator.len()
    }

    pub fn retrain_stats(&self) -> RetrainStats {
        self.status.stats()
    }

    pub fn retrain_status(&self) -> Arc<RetrainStatus> {
        Arc::clone(&self.status)
    }
}
