//! Tiler: live video mosaic server

use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use tiler::{Config, Pipeline, PipelineState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Tiler launching...");

    // Config file from argv[1] or TILER_CONFIG, then TILER__* overrides
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TILER_CONFIG").ok())
        .map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    info!(
        "Mosaic: {}x{} grid, {} sources, {}x{} @ {}fps, codec {:?}",
        config.grid.cols,
        config.grid.rows,
        config.grid.num_sources,
        config.canvas.width,
        config.canvas.height,
        config.canvas.fps,
        config.output.codec
    );

    let mut pipeline = Pipeline::build(config)?;
    pipeline.start().await?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, draining");
        }
        _ = pipeline.wait_for_state(|s| s == PipelineState::Faulted) => {
            error!("Pipeline faulted, shutting down");
        }
    }

    pipeline.stop().await?;
    info!("Final stats: {:?}", pipeline.stats());

    if pipeline.state() == PipelineState::Faulted {
        return Err(eyre!("pipeline faulted"));
    }
    info!("Tiler shutting down");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tiler=info"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(tracing_subscriber::fmt::time::uptime()),
            )
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}
