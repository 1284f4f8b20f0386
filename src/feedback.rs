use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{model::LabeledImage, preprocess::ImageTensor};

/// A preprocessed image with a user-corrected label.
///
/// Label 0 means the user confirmed the prediction, 1 means they marked it
/// wrong.
pub type FeedbackSample = LabeledImage;

pub fn feedback_sample(image: ImageTensor, is_correct: bool) -> FeedbackSample {
    LabeledImage {
        image,
        label: if is_correct { 0 } else { 1 },
    }
}

/// Feedback waiting for the next retraining cycle.
///
/// Lives in memory only. Every submission is its own sample, even when the
/// same file is reported twice.
#[derive(Debug, Default)]
pub struct FeedbackAccumulator {
    samples: Mutex<Vec<FeedbackSample>>,
}

impl FeedbackAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FeedbackSample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a sample and returns the new queue length.
    pub fn add(&self, sample: FeedbackSample) -> usize {
        let mut samples = self.lock();
        samples.push(sample);
        samples.len()
    }

    /// Takes the whole queue once it holds at least `threshold` samples.
    ///
    /// Below the threshold nothing is returned and the queue is left as is.
    pub fn drain_if_threshold_met(&self, threshold: usize) -> Option<Vec<FeedbackSample>> {
        let mut samples = self.lock();
        if samples.is_empty() || samples.len() < threshold {
            return None;
        }
        Some(std::mem::take(&mut *samples))
    }

    /// Puts a drained batch back in front of anything queued since.
    pub fn requeue(&self, mut batch: Vec<FeedbackSample>) {
        let mut samples = self.lock();
        batch.append(&mut samples);
        *samples = batch;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
