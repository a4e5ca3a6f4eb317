use anyhow::{Context, Result};
use ingestion::{ingest_once, IngestionService, TracingReporter};
use scingest_core::IngestorConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn load_config(path: &Path) -> Result<IngestorConfig> {
    let config = IngestorConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))?;
    config.validate()?;
    Ok(config)
}

/// Resolves on Ctrl-C, on SIGTERM (unix) or after `runtime` elapsed.
async fn shutdown_signal(runtime: Option<Duration>) -> Result<()> {
    let runtime = async {
        match runtime {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
            _ = terminate.recv() => info!("Received SIGTERM"),
            _ = runtime => info!("Runtime limit reached"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
            _ = runtime => info!("Runtime limit reached"),
        }
    }

    Ok(())
}

pub async fn handle_watch(config_path: &Path, runtime: Option<u64>) -> Result<()> {
    let config = load_config(config_path)?;
    info!(
        "Watching {} beamtime directories, update strategy {}",
        config.beamtime_dirs.len(),
        config.update_strategy
    );

    let mut service = IngestionService::new(config, Arc::new(TracingReporter))?;
    service.start()?;

    let waited = shutdown_signal(runtime.map(Duration::from_secs)).await;
    info!("Shutting down, letting running submissions finish");
    service.stop().await;
    waited
}

pub async fn handle_ingest(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let summary = ingest_once(&config, Arc::new(TracingReporter)).await?;

    println!("Ingestion finished:");
    println!("  created:    {}", summary.created);
    println!("  patched:    {}", summary.patched);
    println!("  confirmed:  {}", summary.confirmed);
    println!("  datablocks: {}", summary.datablocks);
    println!("  skipped:    {}", summary.skipped);
    println!("  invalid:    {}", summary.invalid);
    println!("  failed:     {}", summary.failed);
    println!("  conflicts:  {}", summary.conflicts);
    if summary.deferred > 0 {
        println!("  deferred:   {}", summary.deferred);
    }
    Ok(())
}
