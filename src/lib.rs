//! Oak wilt leaf classification service.
//!
//! Uploaded leaf photos are classified by a pretrained model, bucketed into
//! severity tiers, geotagged from EXIF data and exported as CSV / GeoJSON.
//! User corrections are queued and periodically folded back into the model by
//! a background retraining worker.

pub mod config;
pub mod error;
pub mod feedback;
pub mod gps;
pub mod model;
pub mod preprocess;
pub mod results;
pub mod retrain;
pub mod routes;
pub mod service;
pub mod utils;

pub use config::Config;
pub use model::{Classifier, LabeledImage, ModelError};
pub use routes::create_router;
pub use service::OakWiltService;
