use std::{
    future::Future,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use birdwatch_capture::HttpImageSource;
use birdwatch_ops::init_tracing;
use birdwatch_orchestrator::{PipelineController, PipelineRunner, SnapshotPreview};
use birdwatch_types::{
    config::{BirdwatchConfig, ENV_CONFIG_PATH},
    BirdwatchError,
};
use birdwatch_vision::build_detector;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

mod analyze;

#[derive(Debug, Parser)]
#[command(name = "birdwatch", version, about = "Camera capture, filter and archive loop")]
struct Cli {
    /// TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = ENV_CONFIG_PATH,
        default_value = "configs/birdwatch.toml"
    )]
    config: PathBuf,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the capture loop (default).
    Run {
        /// Stop after this many cycles.
        #[arg(long)]
        max_cycles: Option<u64>,
        /// Override the camera endpoint.
        #[arg(long)]
        url: Option<String>,
    },
    /// Report sharpness and subject verdicts for local image files.
    Analyze {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Override the sharpness threshold.
        #[arg(long)]
        threshold: Option<f64>,
        /// One JSON object per image instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("birdwatch: {err:#}");
            match err.downcast_ref::<BirdwatchError>() {
                Some(inner) if inner.is_fatal() => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        None => run(&cli.config, cli.verbose, None, None).await,
        Some(Command::Run {
            max_cycles,
            ref url,
        }) => run(&cli.config, cli.verbose, max_cycles, url.clone()).await,
        Some(Command::Analyze {
            ref images,
            threshold,
            json,
        }) => {
            let mut config = load_config(&cli.config, cli.verbose)?;
            if let Some(threshold) = threshold {
                config.quality.sharpness_threshold = threshold;
                config.validate()?;
            }
            init_tracing(&config.ops)?;
            analyze::run(&config, images, json).await
        }
    }
}

async fn run(
    config_path: &Path,
    verbose: bool,
    max_cycles: Option<u64>,
    url: Option<String>,
) -> Result<()> {
    let mut config = load_config(config_path, verbose)?;
    if max_cycles.is_some() || url.is_some() {
        if let Some(max_cycles) = max_cycles {
            config.schedule.max_cycles = Some(max_cycles);
        }
        if let Some(url) = url {
            config.camera.url = url;
        }
        config.validate()?;
    }
    init_tracing(&config.ops)?;

    let source = HttpImageSource::new(&config.camera)?;
    let detector = build_detector(&config.detector, config.storage.jpeg_quality)?;
    let mut controller = PipelineController::new(&config, source, detector)?;
    if let Some(path) = &config.ops.preview_path {
        controller = controller.with_preview(Box::new(SnapshotPreview::new(
            path,
            config.storage.jpeg_quality,
        )));
    }
    controller.boot(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if relay_interrupts(tokio::signal::ctrl_c, shutdown_tx).await {
            std::process::exit(130);
        }
    });

    info!(
        camera = %config.camera.url,
        max_cycles = ?config.schedule.max_cycles,
        "Starting capture loop"
    );
    controller.run(shutdown_rx).await?;
    Ok(())
}

/// First interrupt asks the loop to stop after the current cycle. Returns
/// `true` on a second interrupt, when the caller should exit right away.
async fn relay_interrupts<F, Fut>(mut interrupted: F, shutdown: watch::Sender<bool>) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = interrupted().await {
        warn!("Cannot listen for Ctrl-C: {err}");
        return false;
    }
    info!("Interrupt received; finishing current cycle (press Ctrl-C again to abort)");
    let _ = shutdown.send(true);
    match interrupted().await {
        Ok(()) => {
            warn!("Second interrupt received; exiting immediately");
            true
        }
        Err(err) => {
            warn!("Cannot listen for Ctrl-C: {err}");
            false
        }
    }
}

/// File, then environment, then flags. Any failure here aborts startup.
fn load_config(path: &Path, verbose: bool) -> Result<BirdwatchConfig> {
    let mut config = BirdwatchConfig::from_file(path)?;
    config.apply_env_overrides(std::env::vars())?;
    if verbose {
        config.ops.verbose = true;
    }
    config
        .validate()
        .map_err(anyhow::Error::from)
        .with_context(|| format!("invalid config in '{}'", path.display()))?;
    Ok(config)
}
