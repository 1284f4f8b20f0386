use std::{env, path::Path};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use thiserror::Error;
use tracing::info;

pub const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("SavedModel directory {0} does not exist")]
    MissingModel(String),

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("invalid GITHUB_TOKEN: {0}")]
    InvalidToken(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

pub fn allowed_file(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reduces a client-supplied name to a safe single path component.
///
/// Directory parts are dropped, whitespace becomes `_`, anything outside
/// `[A-Za-z0-9._-]` is removed and leading dots are stripped. May return an
/// empty string.
pub fn secure_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    cleaned.trim_start_matches(['.', '_']).to_string()
}

async fn download_file(url: &str, path: &Path) -> Result<(), BootstrapError> {
    info!(url, path = %path.display(), "downloading model weights");

    let download_err = |reason: String| BootstrapError::Download {
        url: url.to_string(),
        reason,
    };

    let mut header_map = HeaderMap::new();
    if let Ok(token) = env::var("GITHUB_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|err| BootstrapError::InvalidToken(err.to_string()))?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(|err| download_err(err.to_string()))?;

    if !response.status().is_success() {
        return Err(download_err(format!("HTTP {}", response.status())));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|err| download_err(err.to_string()))?;

    let write_err = |source| BootstrapError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp = path.with_extension("download");
    tokio::fs::write(&tmp, &bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)?;
    Ok(())
}

/// Makes sure the model can be loaded before the server starts.
///
/// The SavedModel directory must already exist. Fine-tuned weights are
/// optional; when missing they are fetched from `weights_url` if one is set.
pub async fn ensure_files_exist(
    model_dir: &Path,
    weights_path: &Path,
    weights_url: Option<&str>,
) -> Result<(), BootstrapError> {
    info!("Checking model...");
    if !model_dir.is_dir() {
        return Err(BootstrapError::MissingModel(model_dir.display().to_string()));
    }

    if !weights_path.exists() {
        if let Some(url) = weights_url {
            download_file(url, weights_path).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_extensions_are_case_insensitive() {
        assert!(allowed_file("leaf.JPG"));
        assert!(allowed_file("leaf.tar.png"));
        assert!(allowed_file("a.gif"));
        assert!(!allowed_file("leaf.bmp"));
        assert!(!allowed_file("jpg"));
        assert!(!allowed_file(""));
    }

    #[test]
    fn secure_filename_strips_paths_and_odd_characters() {
        assert_eq!(secure_filename("../../etc/passwd"), "passwd");
        assert_eq!(secure_filename("C:\\photos\\my leaf.jpg"), "my_leaf.jpg");
        assert_eq!(secure_filename("oak (1).jpg"), "oak_1.jpg");
        assert_eq!(secure_filename(".hidden.png"), "hidden.png");
        assert_eq!(secure_filename("..."), "");
    }

    #[tokio::test]
    async fn missing_model_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_files_exist(&dir.path().join("nope"), &dir.path().join("w"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::MissingModel(_)));
    }

    #[tokio::test]
    async fn weights_are_optional_without_url() {
        let dir = tempfile::tempdir().unwrap();
        ensure_files_exist(dir.path(), &dir.path().join("weights"), None)
            .await
            .unwrap();
    }
}
