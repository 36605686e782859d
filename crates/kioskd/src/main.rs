use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiosk_core::{CatalogueSynchronizer, LocalStore, PeriodicTask, RecognitionClient, Store};
use kiosk_hw::Camera;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod remote;

use capture::CaptureLoop;
use config::Config;
use remote::HttpRecognitionClient;

#[derive(Parser)]
#[command(name = "kioskd", about = "Kiosk face recognition agent", version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Camera device path or index
    #[arg(long, global = true)]
    device: Option<String>,
    /// Recognition service base URL
    #[arg(long, global = true)]
    endpoint: Option<String>,
    /// Remote face collection ID
    #[arg(long, global = true)]
    collection_id: Option<String>,
    /// Directory holding catalogue/ and guests/
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture loop and periodic catalogue sync (default)
    Run,
    /// Run a single catalogue sync pass and print the report
    Sync,
    /// List reference faces in the local catalogue
    Catalogue,
    /// List faces in the remote index
    Index,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(device) = &self.device {
            config.camera_device = device.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(collection_id) = &self.collection_id {
            config.collection_id = collection_id.clone();
        }
        if let Some(base_dir) = &self.base_dir {
            config.base_dir = base_dir.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;

    let store = Arc::new(LocalStore::new(&config.base_dir));
    if let Some(Commands::Catalogue) = cli.command {
        for entry in store.scan().await? {
            println!("{}\t{}", entry.key, entry.path.display());
        }
        return Ok(());
    }

    config.validate()?;
    let client = Arc::new(HttpRecognitionClient::new(config.client_config())?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, store, client).await,
        Commands::Sync => {
            store.setup().await?;
            let mut sync = CatalogueSynchronizer::new(store, client, config.sync_config());
            let report = sync.sync().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Index => {
            for face in client.list_indexed(&config.collection_id).await? {
                println!(
                    "{}\t{}",
                    face.face_id,
                    face.external_id.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Commands::Catalogue => Ok(()),
    }
}

async fn run(
    config: Config,
    store: Arc<LocalStore>,
    client: Arc<HttpRecognitionClient>,
) -> Result<()> {
    tracing::info!(
        base_dir = %config.base_dir.display(),
        collection = %config.collection_id,
        endpoint = %config.endpoint,
        "kioskd starting"
    );

    store
        .setup()
        .await
        .with_context(|| format!("preparing {}", config.base_dir.display()))?;

    let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("opening camera {}", config.camera_device))?;
    tracing::info!(
        device = %camera.device_path,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );
    camera.discard(config.warmup_frames);

    let shutdown = CancellationToken::new();

    let sync_config = config.sync_config();
    let sync_task = PeriodicTask::spawn(
        "catalogue-sync",
        sync_config.interval,
        shutdown.child_token(),
        CatalogueSynchronizer::new(store.clone(), client.clone(), sync_config),
    );

    let capture = CaptureLoop::new(camera, client, store, config.capture_config());
    let capture_task = tokio::spawn(capture.run(shutdown.child_token()));

    tracing::info!("kioskd ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("kioskd shutting down");

    shutdown.cancel();
    sync_task.stop().await;
    if let Err(e) = capture_task.await {
        tracing::error!(error = %e, "capture loop panicked");
    }

    Ok(())
}
