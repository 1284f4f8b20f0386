use std::path::Path;

use tensorflow::{
    Graph, Operation, SavedModelBundle, SessionOptions, SessionRunArgs, Tensor,
    DEFAULT_SERVING_SIGNATURE_DEF_KEY,
};
use tracing::info;

use super::{Classifier, LabeledImage, ModelError};
use crate::preprocess::{ImageTensor, CHANNELS, IMAGE_LEN, IMAGE_SIZE};

const SERVE_TAG: &str = "serve";

const TRAIN_SIGNATURE: &str = "train";
const EVALUATE_SIGNATURE: &str = "evaluate";
const SAVE_SIGNATURE: &str = "save";
const RESTORE_SIGNATURE: &str = "restore";

const IMAGES_KEY: &str = "x";
const LABELS_KEY: &str = "y";
const LEARNING_RATE_KEY: &str = "learning_rate";
const CHECKPOINT_KEY: &str = "checkpoint_path";
const PROBABILITY_KEY: &str = "probability";
const LOSS_KEY: &str = "loss";

/// Binary oak wilt classifier exported as a TensorFlow SavedModel.
///
/// Besides `serving_default` the export carries `train`, `evaluate`, `save`
/// and `restore` signatures, so fine-tuning runs entirely inside the graph.
/// `save`/`restore` read and write a single-file checkpoint: the export
/// must write one file at exactly `checkpoint_path` (for example through
/// `tf.io.write_file` of serialized variables), not a `tf.train.Checkpoint`
/// prefix set, because the weights are swapped in with a single rename.
pub struct SavedModelClassifier {
    bundle: SavedModelBundle,
    graph: Graph,
}

impl SavedModelClassifier {
    /// Loads the SavedModel at `model_dir`, then overlays the weights at
    /// `weights_path` when that file exists.
    pub fn load(model_dir: &Path, weights_path: &Path) -> Result<Self, ModelError> {
        let mut graph = Graph::new();
        let bundle =
            SavedModelBundle::load(&SessionOptions::new(), [SERVE_TAG], &mut graph, model_dir)
                .map_err(|err| ModelError::Load(format!("{}: {err}", model_dir.display())))?;

        let mut model = SavedModelClassifier { bundle, graph };
        if weights_path.exists() {
            model.restore(weights_path)?;
            info!(path = %weights_path.display(), "restored fine-tuned weights");
        } else {
            info!(path = %weights_path.display(), "no fine-tuned weights yet, using exported ones");
        }
        Ok(model)
    }

    fn endpoint(&self, signature: &str, key: &str, input: bool) -> Result<(Operation, i32), ModelError> {
        let signature = self.bundle.meta_graph_def().get_signature(signature)?;
        let info = if input {
            signature.get_input(key)?
        } else {
            signature.get_output(key)?
        };
        let operation = self.graph.operation_by_name_required(&info.name().name)?;
        Ok((operation, info.name().index))
    }

    fn batch_tensors(batch: &[LabeledImage]) -> (Tensor<f32>, Tensor<f32>) {
        let mut images = Tensor::new(&[
            batch.len() as u64,
            IMAGE_SIZE as u64,
            IMAGE_SIZE as u64,
            CHANNELS as u64,
        ]);
        for (slot, sample) in images.chunks_mut(IMAGE_LEN).zip(batch) {
            slot.copy_from_slice(sample.image.as_slice());
        }

        let mut labels = Tensor::new(&[batch.len() as u64]);
        for (slot, sample) in labels.iter_mut().zip(batch) {
            *slot = sample.target();
        }
        (images, labels)
    }

    fn run_loss(
        &self,
        signature: &str,
        batch: &[LabeledImage],
        learning_rate: Option<f32>,
    ) -> Result<f32, ModelError> {
        let (images, labels) = Self::batch_tensors(batch);
        let (images_op, images_idx) = self.endpoint(signature, IMAGES_KEY, true)?;
        let (labels_op, labels_idx) = self.endpoint(signature, LABELS_KEY, true)?;
        let (loss_op, loss_idx) = self.endpoint(signature, LOSS_KEY, false)?;

        let lr_tensor = learning_rate.map(Tensor::<f32>::from);
        let lr_endpoint = match lr_tensor {
            Some(_) => Some(self.endpoint(signature, LEARNING_RATE_KEY, true)?),
            None => None,
        };

        let mut args = SessionRunArgs::new();
        args.add_feed(&images_op, images_idx, &images);
        args.add_feed(&labels_op, labels_idx, &labels);
        if let (Some((lr_op, lr_idx)), Some(lr)) = (&lr_endpoint, &lr_tensor) {
            args.add_feed(lr_op, *lr_idx, lr);
        }
        let loss_token = args.request_fetch(&loss_op, loss_idx);
        self.bundle.session.run(&mut args)?;

        let loss: Tensor<f32> = args.fetch(loss_token)?;
        loss.first().copied().ok_or(ModelError::EmptyOutput)
    }

    fn run_checkpoint(&self, signature: &str, path: &Path) -> Result<(), ModelError> {
        let path_tensor = Tensor::<String>::from(path.to_string_lossy().into_owned());
        let (path_op, path_idx) = self.endpoint(signature, CHECKPOINT_KEY, true)?;
        let (done_op, done_idx) = self.endpoint(signature, CHECKPOINT_KEY, false)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&path_op, path_idx, &path_tensor);
        let done = args.request_fetch(&done_op, done_idx);
        self.bundle.session.run(&mut args)?;
        let _: Tensor<String> = args.fetch(done)?;
        Ok(())
    }
}

impl Classifier for SavedModelClassifier {
    fn predict(&self, image: &ImageTensor) -> Result<f32, ModelError> {
        let mut input = Tensor::new(&[1, IMAGE_SIZE as u64, IMAGE_SIZE as u64, CHANNELS as u64]);
        input.copy_from_slice(image.as_slice());

        let (input_op, input_idx) = self.endpoint(DEFAULT_SERVING_SIGNATURE_DEF_KEY, IMAGES_KEY, true)?;
        let (output_op, output_idx) =
            self.endpoint(DEFAULT_SERVING_SIGNATURE_DEF_KEY, PROBABILITY_KEY, false)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_op, input_idx, &input);
        let output_token = args.request_fetch(&output_op, output_idx);
        self.bundle.session.run(&mut args)?;

        let output: Tensor<f32> = args.fetch(output_token)?;
        let probability = output.first().copied().ok_or(ModelError::EmptyOutput)?;
        Ok(probability.clamp(0.0, 1.0))
    }

    fn train_step(&mut self, batch: &[LabeledImage], learning_rate: f32) -> Result<f32, ModelError> {
        self.run_loss(TRAIN_SIGNATURE, batch, Some(learning_rate))
    }

    fn evaluate(&self, batch: &[LabeledImage]) -> Result<f32, ModelError> {
        self.run_loss(EVALUATE_SIGNATURE, batch, None)
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        self.run_checkpoint(SAVE_SIGNATURE, path)
    }

    fn restore(&mut self, path: &Path) -> Result<(), ModelError> {
        self.run_checkpoint(RESTORE_SIGNATURE, path)
    }
}
