//! Top-level watcher: finds beamtime descriptors in the configured base
//! directories and keeps one [`DatasetWatcher`] per active beamtime.

use crate::context::WatcherContext;
use crate::dataset_watcher::DatasetWatcher;
use crate::lifecycle::{Lifecycle, TaskHandle, WatcherKind};
use crate::notifier::{ChangeEvent, ChangeKind, WatchHandle, WatchMode};
use crate::payload;
use crate::report::{IngestReport, ReportKind};
use crate::scanner::find_beamtime_files;
use async_trait::async_trait;
use futures::future::{self, FutureExt};
use glob::Pattern;
use scingest_core::{BeamtimeDescriptor, ScanError, WatchError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use storage::IngestionStateStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reads and validates every descriptor in `base_dirs`. The first
/// descriptor of a beamtime id wins; invalid ones come back as errors.
pub fn discover_beamtimes(
    base_dirs: &[PathBuf],
    pattern: &Pattern,
) -> (BTreeMap<String, BeamtimeDescriptor>, Vec<ScanError>) {
    let mut found: BTreeMap<String, BeamtimeDescriptor> = BTreeMap::new();
    let mut errors = Vec::new();

    for base in base_dirs {
        let files = match find_beamtime_files(base, pattern) {
            Ok(files) => files,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Base directory {:?} does not exist yet", base);
                continue;
            }
            Err(source) => {
                errors.push(ScanError::Io {
                    path: base.clone(),
                    source,
                });
                continue;
            }
        };

        for path in files {
            let descriptor = std::fs::read_to_string(&path)
                .map_err(|source| ScanError::Io {
                    path: path.clone(),
                    source,
                })
                .and_then(|raw| BeamtimeDescriptor::from_json(&path, &raw));
            match descriptor {
                Ok(descriptor) => match found.get(&descriptor.beamtime_id) {
                    Some(first) => warn!(
                        "Beamtime {} described twice: {:?} and {:?}; keeping the first",
                        descriptor.beamtime_id, first.descriptor_path, path
                    ),
                    None => {
                        found.insert(descriptor.beamtime_id.clone(), descriptor);
                    }
                },
                Err(e) => errors.push(e),
            }
        }
    }
    (found, errors)
}

pub struct BeamtimeWatcher {
    ctx: WatcherContext,
    tracked: watch::Receiver<Vec<String>>,
    task: Option<TaskHandle>,
}

impl BeamtimeWatcher {
    pub fn new(ctx: WatcherContext) -> Self {
        let (_, tracked) = watch::channel(Vec::new());
        Self {
            ctx,
            tracked,
            task: None,
        }
    }

    /// Ids of the beamtimes with a dataset watcher, sorted.
    pub fn tracked(&self) -> Vec<String> {
        self.tracked.borrow().clone()
    }

    /// Resolves once `condition` holds for the tracked ids, or the watcher
    /// task is gone.
    pub async fn wait_for_tracked(&mut self, condition: impl FnMut(&Vec<String>) -> bool) {
        let _ = self.tracked.wait_for(condition).await;
    }
}

#[async_trait]
impl Lifecycle for BeamtimeWatcher {
    fn kind(&self) -> WatcherKind {
        WatcherKind::Beamtime
    }

    fn start(&mut self) -> Result<(), WatchError> {
        if self.running() {
            return Ok(());
        }
        if !self.ctx.notifier.running() {
            return Err(WatchError::Stopped);
        }
        let pattern = Pattern::new(&self.ctx.config.beamtime_file_pattern).map_err(|e| {
            WatchError::Backend {
                path: PathBuf::new(),
                message: format!("invalid beamtime file pattern: {}", e),
            }
        })?;
        let (tracked_tx, tracked_rx) = watch::channel(Vec::new());
        self.tracked = tracked_rx;

        let mut beamtime_loop = BeamtimeLoop {
            ctx: self.ctx.clone(),
            pattern,
            base_watches: HashMap::new(),
            unwatchable: HashSet::new(),
            beamtimes: BTreeMap::new(),
            ended: HashSet::new(),
            reported_invalid: HashSet::new(),
            tracked: tracked_tx,
        };
        beamtime_loop.ensure_watches();

        self.task = Some(TaskHandle::spawn(move |cancel| async move {
            beamtime_loop.run(cancel).await;
        }));
        info!(
            "Started beamtime watcher on {} base directories",
            self.ctx.config.beamtime_dirs.len()
        );
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.stop().await;
            info!("Stopped beamtime watcher");
        }
    }

    fn running(&self) -> bool {
        self.task.as_ref().is_some_and(TaskHandle::is_running)
    }
}

struct Tracked {
    descriptor_path: PathBuf,
    watcher: DatasetWatcher,
}

struct BeamtimeLoop {
    ctx: WatcherContext,
    pattern: Pattern,
    base_watches: HashMap<PathBuf, WatchHandle>,
    /// Base directories whose watch failed for a reason other than absence
    unwatchable: HashSet<PathBuf>,
    beamtimes: BTreeMap<String, Tracked>,
    /// Closed beamtimes already handled
    ended: HashSet<String>,
    reported_invalid: HashSet<(PathBuf, Option<i64>)>,
    tracked: watch::Sender<Vec<String>>,
}

impl BeamtimeLoop {
    fn is_relevant(&self, event: &ChangeEvent) -> bool {
        match event.kind {
            ChangeKind::Rescan => true,
            ChangeKind::Other => false,
            _ => event
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| self.pattern.matches(name)),
        }
    }

    /// Registers base directories that are not watched yet. Missing ones
    /// are picked up again on the next pass.
    fn ensure_watches(&mut self) {
        self.base_watches.retain(|_, handle| !handle.is_closed());
        for base in &self.ctx.config.beamtime_dirs {
            if self.base_watches.contains_key(base) {
                continue;
            }
            match self.ctx.notifier.add_watch(base, WatchMode::NonRecursive) {
                Ok(handle) => {
                    debug!("Watching base directory {:?}", base);
                    self.unwatchable.remove(base);
                    self.base_watches.insert(base.clone(), handle);
                }
                Err(WatchError::NotFound(_)) => {
                    debug!("Base directory {:?} missing, will retry", base);
                }
                Err(e) => {
                    if self.unwatchable.insert(base.clone()) {
                        self.ctx.reporter.report(IngestReport::new(
                            ReportKind::WatchError,
                            format!("{}; falling back to periodic rescans", e),
                        ));
                    }
                }
            }
        }
    }

    fn report_invalid(&mut self, error: &ScanError) {
        let path = error.path().clone();
        let key = (path.clone(), payload::modified_secs(&path));
        if self.reported_invalid.insert(key) {
            self.ctx
                .reporter
                .report(IngestReport::new(ReportKind::ScanError, error.to_string()));
        } else {
            debug!("Still invalid: {:?}", path);
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let recheck = self.ctx.config.recheck_interval();
        loop {
            self.ensure_watches();
            self.pass().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(recheck) => debug!("Periodic beamtime rescan"),
                _ = self.next_change() => debug!("Beamtime descriptors changed"),
            }
            for handle in self.base_watches.values_mut() {
                handle.drain();
            }
        }

        for (id, mut tracked) in std::mem::take(&mut self.beamtimes) {
            debug!("Stopping dataset watcher of {}", id);
            tracked.watcher.stop().await;
        }
        self.base_watches.clear();
        let _ = self.tracked.send(Vec::new());
    }

    /// Resolves on the first relevant event of any base directory watch.
    async fn next_change(&mut self) {
        loop {
            if self.base_watches.is_empty() {
                future::pending::<()>().await;
            }
            let receivers = self
                .base_watches
                .values_mut()
                .map(|handle| handle.recv().boxed());
            let (event, _, _) = future::select_all(receivers).await;
            match event {
                Some(event) if !self.is_relevant(&event) => continue,
                // a closed handle means the base directory went away
                _ => return,
            }
        }
    }

    async fn pass(&mut self) {
        let (found, errors) = discover_beamtimes(&self.ctx.config.beamtime_dirs, &self.pattern);
        for error in &errors {
            self.report_invalid(error);
        }

        // An exited watcher is dropped here and started again below.
        let finished: Vec<(String, Retirement)> = self
            .beamtimes
            .iter()
            .filter_map(|(id, tracked)| match found.get(id) {
                None => Some((id.clone(), Retirement::Gone)),
                Some(descriptor) if descriptor.is_ended() => {
                    Some((id.clone(), Retirement::Ended))
                }
                Some(_) if !tracked.watcher.running() => Some((id.clone(), Retirement::Exited)),
                Some(_) => None,
            })
            .collect();
        for (id, why) in finished {
            if let Some(tracked) = self.beamtimes.remove(&id) {
                retire(&id, tracked, why).await;
            }
        }

        for (id, descriptor) in found {
            if self.beamtimes.contains_key(&id) {
                continue;
            }
            if descriptor.is_ended() {
                if self.ended.insert(id.clone()) {
                    info!("Beamtime {} is closed, not watching it", id);
                    if self.ctx.config.clear_closed_beamtimes {
                        clear_if_settled(&self.ctx.config.state_dir_for(&descriptor.directory), &id);
                    }
                }
                continue;
            }
            self.ended.remove(&id);

            let descriptor_path = descriptor.descriptor_path.clone();
            let mut watcher = DatasetWatcher::new(descriptor, self.ctx.clone());
            match watcher.start() {
                Ok(()) => {
                    info!("Tracking beamtime {} from {:?}", id, descriptor_path);
                    self.beamtimes.insert(
                        id,
                        Tracked {
                            descriptor_path,
                            watcher,
                        },
                    );
                }
                Err(e) => self.ctx.reporter.report(
                    IngestReport::new(ReportKind::WatchError, e.to_string()).beamtime(&id),
                ),
            }
        }

        let ids: Vec<String> = self.beamtimes.keys().cloned().collect();
        self.tracked.send_if_modified(|current| {
            if *current == ids {
                false
            } else {
                *current = ids;
                true
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retirement {
    Gone,
    Ended,
    /// The dataset watcher stopped on its own, e.g. on a state store error
    Exited,
}

async fn retire(id: &str, mut tracked: Tracked, why: Retirement) {
    match why {
        Retirement::Ended => info!("Beamtime {} ended, stopping its dataset watcher", id),
        Retirement::Gone => info!(
            "Descriptor {:?} of beamtime {} is gone, stopping its dataset watcher",
            tracked.descriptor_path, id
        ),
        Retirement::Exited => warn!(
            "Dataset watcher of beamtime {} exited, restarting it",
            id
        ),
    }
    tracked.watcher.stop().await;
}

/// Removes the recovery file of an ended beamtime once nothing is pending.
fn clear_if_settled(state_dir: &Path, beamtime_id: &str) {
    match IngestionStateStore::load(state_dir, beamtime_id) {
        Ok(store) if store.is_settled() => {
            match IngestionStateStore::clear(state_dir, beamtime_id) {
                Ok(()) => info!("Cleared ingestion state of beamtime {}", beamtime_id),
                Err(e) => warn!("Cannot clear state of beamtime {}: {}", beamtime_id, e),
            }
        }
        Ok(_) => info!(
            "Keeping ingestion state of beamtime {}: datasets still pending",
            beamtime_id
        ),
        Err(e) => warn!("Cannot read state of beamtime {}: {}", beamtime_id, e),
    }
}
