//! Process configuration from environment variables.

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::retrain::RetrainConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
    /// Uploaded images, also the source for feedback samples.
    pub images_dir: PathBuf,
    pub results_dir: PathBuf,
    /// SavedModel export with the serving and training signatures.
    pub model_dir: PathBuf,
    /// Optional bootstrap source for the weights file.
    pub weights_url: Option<String>,
    /// Held-out training images blended into retraining; synthetic data when unset.
    pub original_data_dir: Option<PathBuf>,
    /// How long a classification waits for the model while a retraining
    /// cycle holds it.
    pub inference_timeout: Duration,
    pub retrain: RetrainConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            body_limit_bytes: 16 * 1024 * 1024,
            images_dir: PathBuf::from("./sample_images"),
            results_dir: PathBuf::from("./results"),
            model_dir: PathBuf::from("./model/oak_wilt"),
            weights_url: None,
            original_data_dir: None,
            inference_timeout: Duration::from_secs(30),
            retrain: RetrainConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let retrain = RetrainConfig {
            threshold: parse(&lookup, "FEEDBACK_BATCH_SIZE", defaults.retrain.threshold)?,
            epochs: parse(&lookup, "RETRAIN_EPOCHS", defaults.retrain.epochs)?,
            batch_size: parse(&lookup, "RETRAIN_BATCH_SIZE", defaults.retrain.batch_size)?,
            learning_rate: parse(&lookup, "RETRAIN_LEARNING_RATE", defaults.retrain.learning_rate)?,
            original_samples: parse(&lookup, "RETRAIN_ORIGINAL_SAMPLES", defaults.retrain.original_samples)?,
            validation_split: parse(&lookup, "RETRAIN_VALIDATION_SPLIT", defaults.retrain.validation_split)?,
            seed: parse(&lookup, "RETRAIN_SEED", defaults.retrain.seed)?,
            timeout: Duration::from_secs(parse(
                &lookup,
                "RETRAIN_TIMEOUT_SECS",
                defaults.retrain.timeout.as_secs(),
            )?),
            weights_path: get("MODEL_WEIGHTS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.retrain.weights_path),
        };

        if retrain.threshold == 0 {
            return Err(invalid("FEEDBACK_BATCH_SIZE", "0"));
        }
        if retrain.batch_size == 0 {
            return Err(invalid("RETRAIN_BATCH_SIZE", "0"));
        }
        if !(0.0..1.0).contains(&retrain.validation_split) {
            return Err(invalid("RETRAIN_VALIDATION_SPLIT", retrain.validation_split.to_string()));
        }

        let inference_timeout_secs: u64 = parse(
            &lookup,
            "INFERENCE_TIMEOUT_SECS",
            defaults.inference_timeout.as_secs(),
        )?;
        if inference_timeout_secs == 0 {
            return Err(invalid("INFERENCE_TIMEOUT_SECS", "0"));
        }

        let body_limit_mb: usize = parse(&lookup, "BODY_LIMIT_MB", defaults.body_limit_bytes / (1024 * 1024))?;

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT", defaults.port)?,
            body_limit_bytes: body_limit_mb * 1024 * 1024,
            images_dir: get("IMAGES_DIR").map(PathBuf::from).unwrap_or(defaults.images_dir),
            results_dir: get("RESULTS_DIR").map(PathBuf::from).unwrap_or(defaults.results_dir),
            model_dir: get("MODEL_DIR").map(PathBuf::from).unwrap_or(defaults.model_dir),
            weights_url: get("MODEL_WEIGHTS_URL"),
            original_data_dir: get("ORIGINAL_DATA_DIR").map(PathBuf::from),
            inference_timeout: Duration::from_secs(inference_timeout_secs),
            retrain,
        })
    }

    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        let address = format!("{}:{}", self.host, self.port);
        address
            .parse()
            .map_err(|_| ConfigError::Invalid { key: "HOST", value: address })
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| invalid(key, raw)),
        _ => Ok(default),
    }
}

fn invalid(key: &'static str, value: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn unset_keys_use_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.retrain.threshold, 10);
        assert_eq!(config.retrain.epochs, 3);
        assert_eq!(config.retrain.batch_size, 4);
        assert_eq!(config.retrain.original_samples, 50);
        assert_eq!(config.retrain.seed, 42);
        assert_eq!(config.inference_timeout, Duration::from_secs(30));
        assert!((config.retrain.learning_rate - 1e-5).abs() < f32::EPSILON);
        assert!(config.weights_url.is_none());
        assert!(config.original_data_dir.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("BODY_LIMIT_MB", "2"),
            ("FEEDBACK_BATCH_SIZE", "3"),
            ("RETRAIN_TIMEOUT_SECS", "5"),
            ("INFERENCE_TIMEOUT_SECS", "7"),
            ("MODEL_WEIGHTS_PATH", "/data/w.ckpt"),
            ("ORIGINAL_DATA_DIR", "/data/train"),
            ("MODEL_WEIGHTS_URL", ""),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.body_limit_bytes, 2 * 1024 * 1024);
        assert_eq!(config.retrain.threshold, 3);
        assert_eq!(config.retrain.timeout, Duration::from_secs(5));
        assert_eq!(config.inference_timeout, Duration::from_secs(7));
        assert_eq!(config.retrain.weights_path, PathBuf::from("/data/w.ckpt"));
        assert_eq!(config.original_data_dir, Some(PathBuf::from("/data/train")));
        assert!(config.weights_url.is_none());
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            config_from(&[("PORT", "seventy")]),
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));
        assert!(config_from(&[("FEEDBACK_BATCH_SIZE", "0")]).is_err());
        assert!(config_from(&[("RETRAIN_VALIDATION_SPLIT", "1.5")]).is_err());
        assert!(config_from(&[("INFERENCE_TIMEOUT_SECS", "0")]).is_err());
    }

    #[test]
    fn bind_address_combines_host_and_port() {
        let config = config_from(&[("HOST", "127.0.0.1"), ("PORT", "9000")]).unwrap();
        assert_eq!(config.bind_address().unwrap().to_string(), "127.0.0.1:9000");
    }
}
