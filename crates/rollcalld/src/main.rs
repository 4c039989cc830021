use anyhow::{Context, Result};
use clap::Parser;
use rollcall_core::{Annotator, FrameRecognizer};
use rollcall_hw::{Camera, CameraSlot};
use rollcall_store::{Config, EmbeddingStore, SessionController, Store};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod routes;
mod stream;

#[derive(Parser)]
#[command(name = "rollcalld", about = "Rollcall attendance daemon", version)]
struct Args {
    /// TOML configuration file (overrides $ROLLCALL_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    tracing::info!(bind = %config.bind_addr, db = %config.db_path.display(), "rollcalld starting");

    let store = Store::open(&config.db_path)?;

    // Opened once; streams take turns through the slot.
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)
        .with_context(|| format!("opening camera {}", config.camera_device))?;
    let camera = CameraSlot::new(camera);

    let engine = config.load_engine().context("loading face models")?;
    let annotator = match &config.label_font {
        Some(path) => Annotator::with_font_file(path),
        None => Annotator::default(),
    };

    let state = routes::AppState {
        stream: stream::StreamContext {
            engine: Arc::new(Mutex::new(engine)),
            recognizer: Arc::new(FrameRecognizer::new(config.recognition.clone(), annotator)),
            embeddings: EmbeddingStore::new(config.encodings_dir(), config.recognition.model_name.clone()),
            controller: SessionController::new(store),
            jpeg_quality: config.jpeg_quality,
        },
        camera,
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "rollcalld ready");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "cannot listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("rollcalld shutting down");
    Ok(())
}
