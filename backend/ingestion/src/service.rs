use crate::beamtime_watcher::{discover_beamtimes, BeamtimeWatcher};
use crate::catalog::CatalogClient;
use crate::context::WatcherContext;
use crate::credentials::{CredentialProvider, LoginCredentialProvider};
use crate::ingestor::{BeamtimeIngestor, PassSummary};
use crate::lifecycle::Lifecycle;
use crate::notifier::Notifier;
use crate::report::{IngestReport, ReportKind, Reporter};
use crate::scanner::Scanner;
use anyhow::{Context, Result};
use glob::Pattern;
use scingest_core::IngestorConfig;
use std::sync::Arc;
use storage::IngestionStateStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Long-running ingestion: one notifier, one beamtime watcher and the
/// dataset watchers it spawns.
pub struct IngestionService {
    ctx: WatcherContext,
    beamtimes: BeamtimeWatcher,
}

impl IngestionService {
    /// Builds the service with catalog logins from the configured
    /// credential file.
    pub fn new(config: IngestorConfig, reporter: Arc<dyn Reporter>) -> Result<Self> {
        let credentials =
            LoginCredentialProvider::new(&config).context("Failed to set up catalog login")?;
        Self::with_credentials(config, Arc::new(credentials), reporter)
    }

    pub fn with_credentials(
        config: IngestorConfig,
        credentials: Arc<dyn CredentialProvider>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        config.validate().context("Invalid ingestor configuration")?;
        let catalog =
            CatalogClient::new(&config, credentials).context("Failed to create catalog client")?;
        let notifier =
            Notifier::start(config.notifier_timeout()).context("Failed to start notifier")?;

        let ctx = WatcherContext {
            config: Arc::new(config),
            notifier: Arc::new(notifier),
            catalog: Arc::new(catalog),
            reporter,
        };
        let beamtimes = BeamtimeWatcher::new(ctx.clone());
        Ok(Self { ctx, beamtimes })
    }

    pub fn config(&self) -> &IngestorConfig {
        &self.ctx.config
    }

    pub fn beamtimes(&self) -> &BeamtimeWatcher {
        &self.beamtimes
    }

    pub fn beamtimes_mut(&mut self) -> &mut BeamtimeWatcher {
        &mut self.beamtimes
    }

    pub fn start(&mut self) -> Result<()> {
        self.beamtimes
            .start()
            .context("Failed to start beamtime watcher")?;
        info!(
            "Ingestion service started against {}",
            self.ctx.config.scicat_url
        );
        Ok(())
    }

    /// Stops every watcher, then the notifier. The service cannot be
    /// restarted afterwards.
    pub async fn stop(&mut self) {
        self.beamtimes.stop().await;
        if self.ctx.notifier.running() {
            self.ctx.notifier.stop();
            info!("Ingestion service stopped");
        }
    }

    pub fn running(&self) -> bool {
        self.beamtimes.running()
    }
}

/// One pass over every beamtime in the base directories without any
/// watcher. Modified datasets are always resubmitted.
pub async fn ingest_once(
    config: &IngestorConfig,
    reporter: Arc<dyn Reporter>,
) -> Result<PassSummary> {
    let credentials =
        LoginCredentialProvider::new(config).context("Failed to set up catalog login")?;
    ingest_once_with(config, Arc::new(credentials), reporter, &CancellationToken::new()).await
}

pub async fn ingest_once_with(
    config: &IngestorConfig,
    credentials: Arc<dyn CredentialProvider>,
    reporter: Arc<dyn Reporter>,
    cancel: &CancellationToken,
) -> Result<PassSummary> {
    config.validate().context("Invalid ingestor configuration")?;
    let catalog = Arc::new(
        CatalogClient::new(config, credentials).context("Failed to create catalog client")?,
    );
    let scanner = Scanner::new(config).context("Invalid dataset file pattern")?;
    let pattern =
        Pattern::new(&config.beamtime_file_pattern).context("Invalid beamtime file pattern")?;

    let (beamtimes, errors) = discover_beamtimes(&config.beamtime_dirs, &pattern);
    let mut summary = PassSummary::default();
    for error in errors {
        reporter.report(IngestReport::new(ReportKind::ScanError, error.to_string()));
        summary.invalid += 1;
    }

    for (id, beamtime) in beamtimes {
        if cancel.is_cancelled() {
            break;
        }
        let state_dir = config.state_dir_for(&beamtime.directory);
        let store = match IngestionStateStore::load(&state_dir, &id) {
            Ok(store) => store,
            Err(e) => {
                warn!("Skipping beamtime {}: {}", id, e);
                reporter.report(
                    IngestReport::new(ReportKind::StateStoreError, e.to_string()).beamtime(&id),
                );
                continue;
            }
        };

        let outcome = scanner.scan(&beamtime);
        let mut ingestor = BeamtimeIngestor::new(
            beamtime,
            store,
            Arc::clone(&catalog),
            Arc::clone(&reporter),
            config,
        );
        ingestor.set_reingest_modified(true);
        for error in &outcome.errors {
            ingestor.report_scan_error(error);
        }
        summary.invalid += outcome.errors.len();

        let pass = ingestor
            .ingest_pass(&outcome.candidates, cancel)
            .await
            .with_context(|| format!("State store of beamtime {} failed", id))?;
        info!(
            "Beamtime {}: {} submitted, {} skipped, {} failed",
            id,
            pass.submitted(),
            pass.skipped,
            pass.failed + pass.conflicts
        );
        summary.absorb(pass);
    }
    Ok(summary)
}
