use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use oak_wilt_service::{
    create_router,
    retrain::{DirectoryDataSource, OriginalDataSource, SyntheticDataSource},
    utils::ensure_files_exist,
    Classifier, Config, OakWiltService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    ensure_files_exist(
        &config.model_dir,
        &config.retrain.weights_path,
        config.weights_url.as_deref(),
    )
    .await
    .context("model files unavailable")?;

    let model = load_model(&config)?;
    let source = original_data_source(&config)?;
    let service = Arc::new(OakWiltService::start(model, source, &config)?);

    let app = create_router(service, config.body_limit_bytes);
    let addr = config.bind_address()?;

    info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("oak_wilt_service=info,info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

#[cfg(feature = "tensorflow")]
fn load_model(config: &Config) -> anyhow::Result<Box<dyn Classifier>> {
    let model = oak_wilt_service::model::SavedModelClassifier::load(
        &config.model_dir,
        &config.retrain.weights_path,
    )
    .context("Failed to load model")?;
    info!(dir = %config.model_dir.display(), "model loaded");
    Ok(Box::new(model))
}

#[cfg(not(feature = "tensorflow"))]
fn load_model(_config: &Config) -> anyhow::Result<Box<dyn Classifier>> {
    anyhow::bail!("built without the `tensorflow` feature, no model backend available")
}

fn original_data_source(config: &Config) -> anyhow::Result<Arc<dyn OriginalDataSource>> {
    match &config.original_data_dir {
        Some(dir) => Ok(Arc::new(
            DirectoryDataSource::from_directory(dir).context("invalid ORIGINAL_DATA_DIR")?,
        )),
        None => {
            warn!("ORIGINAL_DATA_DIR not set, retraining will blend in synthetic samples");
            Ok(Arc::new(SyntheticDataSource))
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
