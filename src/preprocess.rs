use std::path::Path;

use image::{imageops::FilterType, DynamicImage};
use thiserror::Error;

/// Side length the model expects, in pixels.
pub const IMAGE_SIZE: u32 = 256;
pub const CHANNELS: usize = 3;
/// Number of `f32` values in one preprocessed image.
pub const IMAGE_LEN: usize = (IMAGE_SIZE as usize) * (IMAGE_SIZE as usize) * CHANNELS;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("failed to read image {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

/// A single normalized image in NHWC layout without the batch dimension.
///
/// Values are in `[0, 1]`, channels are stored in BGR order, which is the
/// pixel layout the oak wilt model was trained on.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageTensor(Vec<f32>);

impl ImageTensor {
    /// Wraps raw values, rejecting buffers of the wrong length.
    pub fn from_vec(data: Vec<f32>) -> Option<Self> {
        (data.len() == IMAGE_LEN).then_some(Self(data))
    }

    /// Fills every value from `next`, in layout order.
    pub(crate) fn from_fn(mut next: impl FnMut() -> f32) -> Self {
        Self((0..IMAGE_LEN).map(|_| next()).collect())
    }

    pub fn filled(value: f32) -> Self {
        Self(vec![value; IMAGE_LEN])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Decodes image bytes and turns them into a model input tensor.
///
/// This is the only preprocessing path: uploads and feedback samples both go
/// through it so training sees exactly what inference sees.
pub fn preprocess(image_data: &[u8]) -> Result<ImageTensor, PreprocessError> {
    let img = image::load_from_memory(image_data)?;
    Ok(preprocess_image(&img))
}

pub fn preprocess_file(path: &Path) -> Result<ImageTensor, PreprocessError> {
    let bytes = std::fs::read(path).map_err(|source| PreprocessError::Read {
        path: path.display().to_string(),
        source,
    })?;
    preprocess(&bytes)
}

pub fn preprocess_image(img: &DynamicImage) -> ImageTensor {
    let resized = img
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle)
        .to_rgb8();

    let mut flat_img = Vec::with_capacity(IMAGE_LEN);
    for pixel in resized.pixels() {
        flat_img.push(pixel[2] as f32 / 255.0);
        flat_img.push(pixel[1] as f32 / 255.0);
        flat_img.push(pixel[0] as f32 / 255.0);
    }

    ImageTensor(flat_img)
}
