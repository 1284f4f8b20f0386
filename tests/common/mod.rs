#![allow(dead_code)]

use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use oak_wilt_service::{
    preprocess::ImageTensor, retrain::SyntheticDataSource, Classifier, Config, LabeledImage,
    ModelError, OakWiltService,
};

/// Says "oak wilt" (99.8%) for bright images and 50% for everything else.
#[derive(Default)]
pub struct BrightnessClassifier {
    pub saves: Arc<AtomicUsize>,
    pub restores: Arc<AtomicUsize>,
    pub fail_training: bool,
}

fn mean(image: &ImageTensor) -> f64 {
    let values = image.as_slice();
    values.iter().map(|v| f64::from(*v)).sum::<f64>() / values.len() as f64
}

impl Classifier for BrightnessClassifier {
    fn predict(&self, image: &ImageTensor) -> Result<f32, ModelError> {
        Ok(if mean(image) > 0.75 { 0.998 } else { 0.5 })
    }

    fn train_step(&mut self, _batch: &[LabeledImage], _lr: f32) -> Result<f32, ModelError> {
        if self.fail_training {
            return Err(ModelError::Runtime("NaN loss".into()));
        }
        Ok(0.3)
    }

    fn evaluate(&self, _batch: &[LabeledImage]) -> Result<f32, ModelError> {
        Ok(0.4)
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        fs::write(path, format!("weights v{n}"))?;
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<(), ModelError> {
        fs::read(path)?;
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn encode(color: [u8; 3], format: ImageOutputFormat) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb(color)));
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, format).unwrap();
    cursor.into_inner()
}

pub fn png(color: [u8; 3]) -> Vec<u8> {
    encode(color, ImageOutputFormat::Png)
}

/// Little-endian TIFF block holding only a GPS IFD.
pub fn gps_tiff(lat_ref: u8, lat: [(u32, u32); 3], lon_ref: u8, lon: [(u32, u32); 3]) -> Vec<u8> {
    const GPS_IFD: u32 = 26;
    const LAT_DATA: u32 = 80;
    const LON_DATA: u32 = 104;

    let mut tiff = Vec::new();
    tiff.extend_from_slice(b"II");
    tiff.extend_from_slice(&42u16.to_le_bytes());
    tiff.extend_from_slice(&8u32.to_le_bytes());

    let entry = |tiff: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: [u8; 4]| {
        tiff.extend_from_slice(&tag.to_le_bytes());
        tiff.extend_from_slice(&kind.to_le_bytes());
        tiff.extend_from_slice(&count.to_le_bytes());
        tiff.extend_from_slice(&value);
    };

    // IFD0: just the GPS pointer.
    tiff.extend_from_slice(&1u16.to_le_bytes());
    entry(&mut tiff, 0x8825, 4, 1, GPS_IFD.to_le_bytes());
    tiff.extend_from_slice(&0u32.to_le_bytes());
    assert_eq!(tiff.len() as u32, GPS_IFD);

    tiff.extend_from_slice(&4u16.to_le_bytes());
    entry(&mut tiff, 0x0001, 2, 2, [lat_ref, 0, 0, 0]);
    entry(&mut tiff, 0x0002, 5, 3, LAT_DATA.to_le_bytes());
    entry(&mut tiff, 0x0003, 2, 2, [lon_ref, 0, 0, 0]);
    entry(&mut tiff, 0x0004, 5, 3, LON_DATA.to_le_bytes());
    tiff.extend_from_slice(&0u32.to_le_bytes());
    assert_eq!(tiff.len() as u32, LAT_DATA);

    for (num, denom) in lat.into_iter().chain(lon) {
        tiff.extend_from_slice(&num.to_le_bytes());
        tiff.extend_from_slice(&denom.to_le_bytes());
    }
    tiff
}

/// A JPEG with an EXIF APP1 segment inserted right after SOI.
pub fn jpeg_with_exif(color: [u8; 3], tiff: &[u8]) -> Vec<u8> {
    let jpeg = encode(color, ImageOutputFormat::Jpeg(90));
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let mut payload = b"Exif\0\0".to_vec();
    payload.extend_from_slice(tiff);

    let mut out = vec![0xFF, 0xD8, 0xFF, 0xE1];
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&jpeg[2..]);
    out
}

/// 30°15'50.4" N, 97°44'34.8" W
pub fn austin_jpeg(color: [u8; 3]) -> Vec<u8> {
    let tiff = gps_tiff(
        b'N',
        [(30, 1), (15, 1), (504, 10)],
        b'W',
        [(97, 1), (44, 1), (348, 10)],
    );
    jpeg_with_exif(color, &tiff)
}

pub fn test_config(root: &Path) -> Config {
    let mut config = Config {
        images_dir: root.join("images"),
        results_dir: root.join("results"),
        model_dir: root.join("model"),
        ..Config::default()
    };
    config.retrain.weights_path = root.join("model").join("oak_wilt.weights");
    config.retrain.original_samples = 2;
    config.retrain.epochs = 1;
    config.retrain.timeout = Duration::from_secs(30);
    config
}

pub fn start_service(model: Box<dyn Classifier>, config: &Config) -> Arc<OakWiltService> {
    Arc::new(OakWiltService::start(model, Arc::new(SyntheticDataSource), config).unwrap())
}

/// Drops a stored image into the images directory, as an earlier upload would.
pub fn store_image(config: &Config, name: &str, bytes: &[u8]) -> PathBuf {
    fs::create_dir_all(&config.images_dir).unwrap();
    let path = config.images_dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}
