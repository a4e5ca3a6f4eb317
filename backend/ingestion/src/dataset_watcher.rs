//! Per-beamtime watcher: scans the beamtime tree, ingests what it finds and
//! rescans on every relevant notification and on a fixed interval.

use crate::context::WatcherContext;
use crate::ingestor::BeamtimeIngestor;
use crate::lifecycle::{Lifecycle, TaskHandle, WatcherKind};
use crate::notifier::{ChangeEvent, ChangeKind, WatchHandle, WatchMode};
use crate::report::{IngestReport, ReportKind};
use crate::scan_dir_watcher::{FileCallback, ScanDirWatcher};
use crate::scanner::Scanner;
use async_trait::async_trait;
use glob::Pattern;
use scingest_core::{BeamtimeDescriptor, DatasetCandidate, DatasetId, WatchError};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use storage::IngestionStateStore;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetPhase {
    Idle,
    Scanning,
    Ingesting,
    Stopped,
}

pub struct DatasetWatcher {
    beamtime: BeamtimeDescriptor,
    ctx: WatcherContext,
    phase: watch::Receiver<DatasetPhase>,
    task: Option<TaskHandle>,
}

impl DatasetWatcher {
    pub fn new(beamtime: BeamtimeDescriptor, ctx: WatcherContext) -> Self {
        let (_, phase) = watch::channel(DatasetPhase::Stopped);
        Self {
            beamtime,
            ctx,
            phase,
            task: None,
        }
    }

    pub fn beamtime(&self) -> &BeamtimeDescriptor {
        &self.beamtime
    }

    pub fn phase(&self) -> DatasetPhase {
        *self.phase.borrow()
    }

    /// Resolves once the watcher reaches `phase`, or its task is gone.
    pub async fn wait_for_phase(&mut self, phase: DatasetPhase) {
        let _ = self.phase.wait_for(|p| *p == phase).await;
    }
}

#[async_trait]
impl Lifecycle for DatasetWatcher {
    fn kind(&self) -> WatcherKind {
        WatcherKind::Dataset
    }

    fn start(&mut self) -> Result<(), WatchError> {
        if self.running() {
            return Ok(());
        }
        let (phase_tx, phase_rx) = watch::channel(DatasetPhase::Scanning);
        self.phase = phase_rx;

        let mut dataset_loop = DatasetLoop {
            beamtime: self.beamtime.clone(),
            ctx: self.ctx.clone(),
            phase: phase_tx,
            watch: None,
            watch_error_reported: false,
            scan_dirs: HashMap::new(),
            candidates: Vec::new(),
        };
        // Register right away so changes made while the first scan runs are seen.
        dataset_loop.ensure_watch();

        self.task = Some(TaskHandle::spawn(move |cancel| async move {
            dataset_loop.run(cancel).await;
        }));
        info!(
            "Started dataset watcher for beamtime {} in {:?}",
            self.beamtime.beamtime_id, self.beamtime.directory
        );
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.stop().await;
            info!(
                "Stopped dataset watcher for beamtime {}",
                self.beamtime.beamtime_id
            );
        }
    }

    fn running(&self) -> bool {
        self.task.as_ref().is_some_and(TaskHandle::is_running)
    }
}

/// Why the loop woke up.
enum Wake {
    Timer,
    Changed,
    /// New files in the scan directory of an ingested dataset
    ScanDir(DatasetId),
    Cancelled,
}

struct DatasetLoop {
    beamtime: BeamtimeDescriptor,
    ctx: WatcherContext,
    phase: watch::Sender<DatasetPhase>,
    watch: Option<WatchHandle>,
    watch_error_reported: bool,
    scan_dirs: HashMap<DatasetId, ScanDirWatcher>,
    /// Candidates of the latest pass
    candidates: Vec<DatasetCandidate>,
}

fn is_relevant(scanner: &Scanner, event: &ChangeEvent) -> bool {
    match event.kind {
        ChangeKind::Rescan => true,
        ChangeKind::Created | ChangeKind::Renamed | ChangeKind::Removed if event.is_dir => true,
        _ => scanner.is_relevant(&event.path),
    }
}

impl DatasetLoop {
    fn set_phase(&self, phase: DatasetPhase) {
        let _ = self.phase.send(phase);
    }

    fn report(&self, kind: ReportKind, message: String) {
        self.ctx
            .reporter
            .report(IngestReport::new(kind, message).beamtime(&self.beamtime.beamtime_id));
    }

    /// (Re)registers the beamtime directory. Without a watch the loop
    /// still rescans on its timer.
    fn ensure_watch(&mut self) {
        if self.watch.as_ref().is_some_and(|w| !w.is_closed()) {
            return;
        }
        self.watch = None;
        match self
            .ctx
            .notifier
            .add_watch(&self.beamtime.directory, WatchMode::Recursive)
        {
            Ok(handle) => {
                if self.watch_error_reported {
                    info!(
                        "Watch on {:?} restored",
                        self.beamtime.directory
                    );
                }
                self.watch = Some(handle);
                self.watch_error_reported = false;
            }
            Err(e) => {
                if !self.watch_error_reported {
                    self.report(
                        ReportKind::WatchError,
                        format!("{}; falling back to periodic rescans", e),
                    );
                    self.watch_error_reported = true;
                }
            }
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let bt = self.beamtime.beamtime_id.clone();
        let config = Arc::clone(&self.ctx.config);

        let state_dir = config.state_dir_for(&self.beamtime.directory);
        let store = match IngestionStateStore::load(&state_dir, &bt) {
            Ok(store) => store,
            Err(e) => {
                error!("Beamtime {}: cannot load ingestion state: {}", bt, e);
                self.report(ReportKind::StateStoreError, e.to_string());
                self.set_phase(DatasetPhase::Stopped);
                return;
            }
        };
        let (scanner, scan_pattern) = match (
            Scanner::new(&config),
            Pattern::new(&config.scan_file_pattern),
        ) {
            (Ok(scanner), Ok(pattern)) => (scanner, pattern),
            (Err(e), _) | (_, Err(e)) => {
                self.report(ReportKind::ScanError, format!("invalid pattern: {}", e));
                self.set_phase(DatasetPhase::Stopped);
                return;
            }
        };

        let mut ingestor = BeamtimeIngestor::new(
            self.beamtime.clone(),
            store,
            Arc::clone(&self.ctx.catalog),
            Arc::clone(&self.ctx.reporter),
            &config,
        );
        let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel::<DatasetId>();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.ensure_watch();

            self.set_phase(DatasetPhase::Scanning);
            let outcome = scanner.scan(&self.beamtime);
            for error in &outcome.errors {
                ingestor.report_scan_error(error);
            }
            self.candidates = outcome.candidates;

            self.set_phase(DatasetPhase::Ingesting);
            if let Err(e) = ingestor.ingest_pass(&self.candidates, &cancel).await {
                error!("Beamtime {}: stopping, state store failed: {}", bt, e);
                self.report(ReportKind::StateStoreError, e.to_string());
                break;
            }

            if config.watch_scan_dirs {
                self.sync_scan_dirs(&ingestor, &scan_pattern, &refresh_tx)
                    .await;
            }
            self.set_phase(DatasetPhase::Idle);

            match self.wait(&scanner, &mut refresh_rx, &cancel).await {
                Wake::Cancelled => break,
                Wake::Timer => debug!("Beamtime {}: periodic rescan", bt),
                Wake::Changed => debug!("Beamtime {}: change detected", bt),
                Wake::ScanDir(first) => {
                    let mut ids = HashSet::from([first]);
                    while let Ok(id) = refresh_rx.try_recv() {
                        ids.insert(id);
                    }
                    let touched: Vec<DatasetCandidate> = self
                        .candidates
                        .iter()
                        .filter(|c| ids.contains(&c.id))
                        .cloned()
                        .collect();
                    let mut failed = None;
                    for candidate in &touched {
                        if let Err(e) = ingestor.refresh(candidate, &cancel).await {
                            failed = Some(e);
                            break;
                        }
                    }
                    if let Some(e) = failed {
                        error!("Beamtime {}: stopping, state store failed: {}", bt, e);
                        self.report(ReportKind::StateStoreError, e.to_string());
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        for (_, mut watcher) in self.scan_dirs.drain() {
            watcher.stop().await;
        }
        self.watch = None;
        self.set_phase(DatasetPhase::Stopped);
    }

    /// Sleeps until the recheck interval passes, a relevant change shows up
    /// or a scan directory reports new files.
    async fn wait(
        &mut self,
        scanner: &Scanner,
        refresh_rx: &mut mpsc::UnboundedReceiver<DatasetId>,
        cancel: &CancellationToken,
    ) -> Wake {
        let config = Arc::clone(&self.ctx.config);
        let timer = tokio::time::sleep(config.recheck_interval());
        tokio::pin!(timer);

        let wake = loop {
            let event = async {
                match self.watch.as_mut() {
                    Some(handle) => handle.recv().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return Wake::Cancelled,
                _ = &mut timer => break Wake::Timer,
                Some(id) = refresh_rx.recv() => break Wake::ScanDir(id),
                event = event => match event {
                    Some(event) if is_relevant(scanner, &event) => break Wake::Changed,
                    Some(_) => continue,
                    // watch lost; rescan now and re-register
                    None => break Wake::Changed,
                },
            }
        };

        // Let writers finish and fold a burst of events into one pass.
        let delay = config.ingestion_delay();
        if !delay.is_zero() && !matches!(wake, Wake::Timer) {
            tokio::select! {
                _ = cancel.cancelled() => return Wake::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if let Some(handle) = self.watch.as_mut() {
            handle.drain();
        }
        wake
    }

    /// Keeps one scan directory watcher per ingested dataset with a scan
    /// directory.
    async fn sync_scan_dirs(
        &mut self,
        ingestor: &BeamtimeIngestor,
        pattern: &Pattern,
        refresh_tx: &mpsc::UnboundedSender<DatasetId>,
    ) {
        let wanted: HashMap<DatasetId, PathBuf> = self
            .candidates
            .iter()
            .filter(|c| ingestor.store().is_ingested(&c.id))
            .filter_map(|c| c.scan_dir.clone().map(|dir| (c.id.clone(), dir)))
            .collect();

        let stale: Vec<DatasetId> = self
            .scan_dirs
            .iter()
            .filter(|(id, watcher)| !wanted.contains_key(*id) || !watcher.running())
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(mut watcher) = self.scan_dirs.remove(&id) {
                watcher.stop().await;
            }
        }

        for (id, dir) in wanted {
            if self.scan_dirs.contains_key(&id) {
                continue;
            }
            let tx = refresh_tx.clone();
            let dataset = id.clone();
            let callback: FileCallback = Arc::new(move |path: PathBuf| {
                debug!("New file {:?} in scan directory of {}", path, dataset);
                let _ = tx.send(dataset.clone());
            });
            let mut watcher =
                ScanDirWatcher::new(Arc::clone(&self.ctx.notifier), dir, pattern.clone(), callback);
            match watcher.start() {
                Ok(()) => {
                    self.scan_dirs.insert(id, watcher);
                }
                Err(e) => warn!("Cannot watch scan directory of {}: {}", id, e),
            }
        }
    }
}
