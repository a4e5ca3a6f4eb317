//! Per-beamtime ingestion: decides what to send for each candidate, sends
//! it and records the result.

use crate::catalog::{Attempted, CatalogClient};
use crate::payload::{self, DatasetPayload};
use crate::report::{IngestReport, ReportKind, Reporter};
use scingest_core::{
    BeamtimeDescriptor, DatasetCandidate, DatasetId, Fingerprint, IngestorConfig, RecordStatus,
    ScanError, StateStoreError, SubmissionError, UpdateStrategy,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use storage::IngestionStateStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with a candidate once its remote state is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Create { patch_if_exists: bool },
    Patch,
    /// The remote dataset is ours from an earlier run; just record it
    Confirm,
    Conflict(&'static str),
    Skip,
}

/// `leftover` is true when an earlier submission of the dataset may have
/// reached the catalog without its answer being recorded.
pub(crate) fn decide(strategy: UpdateStrategy, exists: bool, leftover: bool) -> Decision {
    match (strategy, exists) {
        (UpdateStrategy::No, _) if !leftover => Decision::Skip,
        (UpdateStrategy::No, true) => Decision::Confirm,
        (UpdateStrategy::No, false) => Decision::Create {
            patch_if_exists: false,
        },
        (UpdateStrategy::Create, false) => Decision::Create {
            patch_if_exists: false,
        },
        (UpdateStrategy::Create, true) if leftover => Decision::Confirm,
        (UpdateStrategy::Create, true) => Decision::Conflict("dataset already exists"),
        (UpdateStrategy::Patch, true) => Decision::Patch,
        (UpdateStrategy::Patch, false) => Decision::Conflict("dataset not found"),
        (UpdateStrategy::Mixed, false) => Decision::Create {
            patch_if_exists: true,
        },
        (UpdateStrategy::Mixed, true) => Decision::Patch,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Patched,
    Confirmed,
    DatablockOnly,
    Skipped,
    Invalid,
    Failed,
    Conflict,
    /// Credentials are unavailable; the rest of the pass is postponed
    Deferred,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub created: usize,
    pub patched: usize,
    pub confirmed: usize,
    pub datablocks: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Candidates left for a later pass (auth failure or stop)
    pub deferred: usize,
}

impl PassSummary {
    pub fn submitted(&self) -> usize {
        self.created + self.patched + self.confirmed
    }

    pub fn absorb(&mut self, other: PassSummary) {
        self.created += other.created;
        self.patched += other.patched;
        self.confirmed += other.confirmed;
        self.datablocks += other.datablocks;
        self.skipped += other.skipped;
        self.invalid += other.invalid;
        self.failed += other.failed;
        self.conflicts += other.conflicts;
        self.deferred += other.deferred;
    }
}

pub struct BeamtimeIngestor {
    beamtime: BeamtimeDescriptor,
    store: IngestionStateStore,
    catalog: Arc<CatalogClient>,
    reporter: Arc<dyn Reporter>,
    strategy: UpdateStrategy,
    reingest_modified: bool,
    doi_prefix: String,
    /// Given up in this run; retried only when the files change
    failed_this_run: HashMap<DatasetId, Fingerprint>,
    datablock_failures: HashMap<DatasetId, Option<i64>>,
    reported_scan_errors: HashSet<(PathBuf, Option<i64>)>,
}

impl BeamtimeIngestor {
    pub fn new(
        beamtime: BeamtimeDescriptor,
        store: IngestionStateStore,
        catalog: Arc<CatalogClient>,
        reporter: Arc<dyn Reporter>,
        config: &IngestorConfig,
    ) -> Self {
        Self {
            beamtime,
            store,
            catalog,
            reporter,
            strategy: config.update_strategy,
            reingest_modified: config.reingest_modified,
            doi_prefix: config.doi_prefix.clone(),
            failed_this_run: HashMap::new(),
            datablock_failures: HashMap::new(),
            reported_scan_errors: HashSet::new(),
        }
    }

    pub fn beamtime(&self) -> &BeamtimeDescriptor {
        &self.beamtime
    }

    pub fn store(&self) -> &IngestionStateStore {
        &self.store
    }

    pub fn set_reingest_modified(&mut self, enabled: bool) {
        self.reingest_modified = enabled;
    }

    /// Reports a scan problem once per file version.
    pub fn report_scan_error(&mut self, error: &ScanError) {
        let path = error.path().clone();
        let key = (path.clone(), payload::modified_secs(&path));
        if self.reported_scan_errors.insert(key) {
            self.reporter.report(
                IngestReport::new(ReportKind::ScanError, error.to_string())
                    .beamtime(&self.beamtime.beamtime_id),
            );
        } else {
            debug!("Skipping {:?} again: {}", path, error);
        }
    }

    /// Processes `candidates` in order. Only a state store failure is
    /// returned; everything else is recorded and reported per dataset.
    pub async fn ingest_pass(
        &mut self,
        candidates: &[DatasetCandidate],
        cancel: &CancellationToken,
    ) -> Result<PassSummary, StateStoreError> {
        let mut summary = PassSummary::default();

        for (index, candidate) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.deferred += candidates.len() - index;
                break;
            }

            match self.process(candidate, cancel).await? {
                Outcome::Created => summary.created += 1,
                Outcome::Patched => summary.patched += 1,
                Outcome::Confirmed => summary.confirmed += 1,
                Outcome::DatablockOnly => summary.datablocks += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::Invalid => summary.invalid += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Conflict => summary.conflicts += 1,
                Outcome::Deferred | Outcome::Cancelled => {
                    summary.deferred += candidates.len() - index;
                    break;
                }
            }
        }

        if summary != PassSummary::default() && summary.skipped != candidates.len() {
            info!(
                "Beamtime {}: created {}, patched {}, confirmed {}, failed {}, conflicts {}, deferred {}",
                self.beamtime.beamtime_id,
                summary.created,
                summary.patched,
                summary.confirmed,
                summary.failed,
                summary.conflicts,
                summary.deferred
            );
        }
        Ok(summary)
    }

    async fn process(
        &mut self,
        candidate: &DatasetCandidate,
        cancel: &CancellationToken,
    ) -> Result<Outcome, StateStoreError> {
        let id = &candidate.id;
        let current = payload::fingerprint(candidate);
        let record = self.store.record(id).cloned();

        if self.failed_this_run.get(id) == Some(&current) {
            return Ok(Outcome::Skipped);
        }

        let leftover = match record.as_ref().map(|r| (r.status, r.fingerprint)) {
            Some((RecordStatus::Ingested, done)) => {
                let dataset_changed = done.metadata_modified != current.metadata_modified;
                let datablock_changed = current.datablock_modified.is_some()
                    && done.datablock_modified != current.datablock_modified;

                if dataset_changed && self.reingest_modified {
                    info!("Dataset {} changed since ingestion, resubmitting", id);
                    false
                } else if datablock_changed
                    && (done.datablock_modified.is_none() || self.reingest_modified)
                {
                    return self.submit_datablock_only(candidate, done, cancel).await;
                } else {
                    return Ok(Outcome::Skipped);
                }
            }
            // A refused dataset is not ours, whatever the catalog holds.
            Some((RecordStatus::Waiting | RecordStatus::Failed, _)) => {
                self.store.is_leftover(id)
            }
            None => false,
        };

        if self.strategy == UpdateStrategy::No && !leftover {
            debug!("Update strategy 'no': leaving {} alone", id);
            return Ok(Outcome::Skipped);
        }

        let payload = match payload::build(&self.beamtime, candidate, &self.doi_prefix) {
            Ok(payload) => payload,
            Err(e) => {
                self.report_scan_error(&e);
                return Ok(Outcome::Invalid);
            }
        };

        let exists = self.catalog.dataset_exists(id, cancel).await;
        let attempts = exists.attempts;
        let exists = match exists.result {
            Ok(exists) => exists,
            Err(e) => return self.handle_error(id, current, e, attempts),
        };

        let decision = decide(self.strategy, exists, leftover);
        debug!(
            "Dataset {}: exists={}, leftover={}, decision={:?}",
            id, exists, leftover, decision
        );

        let (outcome, attempted) = match decision {
            Decision::Skip => return Ok(Outcome::Skipped),
            Decision::Conflict(reason) => {
                return self.conflict(id, current, reason.to_string(), attempts)
            }
            Decision::Confirm => {
                info!("Dataset {} already in the catalog from an earlier run", id);
                (Outcome::Confirmed, Attempted { result: Ok(()), attempts: 0 })
            }
            Decision::Patch => {
                self.store.mark_waiting(id)?;
                let attempted = self.catalog.patch_dataset(id, &payload.dataset, cancel).await;
                (Outcome::Patched, attempted)
            }
            Decision::Create { patch_if_exists } => {
                self.store.mark_waiting(id)?;
                let created = self.catalog.create_dataset(id, &payload.dataset, cancel).await;
                match created.result {
                    Err(SubmissionError::AlreadyExists(_)) if patch_if_exists => {
                        info!("Dataset {} appeared concurrently, patching instead", id);
                        let mut patched =
                            self.catalog.patch_dataset(id, &payload.dataset, cancel).await;
                        patched.attempts += created.attempts;
                        (Outcome::Patched, patched)
                    }
                    result => (
                        Outcome::Created,
                        Attempted {
                            result,
                            attempts: created.attempts,
                        },
                    ),
                }
            }
        };

        let attempts = attempts + attempted.attempts;
        if let Err(e) = attempted.result {
            return self.handle_error(id, current, e, attempts);
        }

        let delivered = record
            .filter(|r| r.status == RecordStatus::Ingested)
            .and_then(|r| r.fingerprint.datablock_modified);
        let fingerprint = if delivered.is_some()
            && delivered == payload.fingerprint.datablock_modified
        {
            payload.fingerprint
        } else {
            self.deliver_datablock(id, &payload, cancel).await
        };
        self.store.mark_ingested(id, fingerprint, attempts)?;
        self.failed_this_run.remove(id);
        info!("Dataset {} ingested ({:?})", id, outcome);
        Ok(outcome)
    }

    /// Posts the datablock, if any. The returned fingerprint only covers
    /// the datablock when it was delivered.
    async fn deliver_datablock(
        &mut self,
        id: &DatasetId,
        payload: &DatasetPayload,
        cancel: &CancellationToken,
    ) -> Fingerprint {
        let mut fingerprint = payload.fingerprint;
        let Some(datablock) = payload.datablock.as_ref() else {
            fingerprint.datablock_modified = None;
            return fingerprint;
        };
        if self.datablock_failures.get(id) == Some(&fingerprint.datablock_modified) {
            fingerprint.datablock_modified = None;
            return fingerprint;
        }

        let attempted = self.catalog.create_datablock(id, datablock, cancel).await;
        match attempted.result {
            Ok(()) => {
                self.datablock_failures.remove(id);
            }
            Err(SubmissionError::Cancelled) => fingerprint.datablock_modified = None,
            Err(e) => {
                self.datablock_failures
                    .insert(id.clone(), fingerprint.datablock_modified);
                self.reporter.report(
                    IngestReport::new(
                        ReportKind::SubmissionFailed,
                        format!("datablock not delivered: {}", e),
                    )
                    .beamtime(&self.beamtime.beamtime_id)
                    .dataset(id)
                    .attempts(attempted.attempts),
                );
                fingerprint.datablock_modified = None;
            }
        }
        fingerprint
    }

    async fn submit_datablock_only(
        &mut self,
        candidate: &DatasetCandidate,
        done: Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<Outcome, StateStoreError> {
        let id = &candidate.id;
        let payload = match payload::build(&self.beamtime, candidate, &self.doi_prefix) {
            Ok(payload) => payload,
            Err(e) => {
                self.report_scan_error(&e);
                return Ok(Outcome::Invalid);
            }
        };

        let mut fingerprint = self.deliver_datablock(id, &payload, cancel).await;
        if fingerprint.datablock_modified.is_none() {
            return Ok(if cancel.is_cancelled() {
                Outcome::Cancelled
            } else {
                Outcome::Skipped
            });
        }
        // The dataset itself was not resubmitted.
        fingerprint.metadata_modified = done.metadata_modified;
        self.store.mark_ingested(id, fingerprint, 1)?;
        info!("Datablock of {} ingested", id);
        Ok(Outcome::DatablockOnly)
    }

    /// Resends an ingested dataset after new files appeared in its scan
    /// directory. Only the strategies that may update remote datasets do so.
    pub async fn refresh(
        &mut self,
        candidate: &DatasetCandidate,
        cancel: &CancellationToken,
    ) -> Result<bool, StateStoreError> {
        let id = &candidate.id;
        if !matches!(self.strategy, UpdateStrategy::Patch | UpdateStrategy::Mixed)
            || !self.store.is_ingested(id)
        {
            return Ok(false);
        }
        let payload = match payload::build(&self.beamtime, candidate, &self.doi_prefix) {
            Ok(payload) => payload,
            Err(e) => {
                self.report_scan_error(&e);
                return Ok(false);
            }
        };

        let attempted = self.catalog.patch_dataset(id, &payload.dataset, cancel).await;
        match attempted.result {
            Ok(()) => {
                let mut fingerprint = payload.fingerprint;
                if let Some(record) = self.store.record(id) {
                    fingerprint.datablock_modified = record.fingerprint.datablock_modified;
                }
                self.store
                    .mark_ingested(id, fingerprint, attempted.attempts)?;
                debug!("Refreshed {} after scan directory change", id);
                Ok(true)
            }
            Err(SubmissionError::Cancelled) => Ok(false),
            Err(e) => {
                self.store
                    .mark_failed(id, attempted.attempts, &e.to_string())?;
                self.reporter.report(
                    IngestReport::new(ReportKind::SubmissionFailed, format!("refresh: {}", e))
                        .beamtime(&self.beamtime.beamtime_id)
                        .dataset(id)
                        .attempts(attempted.attempts),
                );
                Ok(false)
            }
        }
    }

    fn conflict(
        &mut self,
        id: &DatasetId,
        current: Fingerprint,
        reason: String,
        attempts: u32,
    ) -> Result<Outcome, StateStoreError> {
        warn!("Dataset {}: {}", id, reason);
        self.store.mark_conflict(id, attempts, &reason)?;
        self.failed_this_run.insert(id.clone(), current);
        self.reporter.report(
            IngestReport::new(ReportKind::Conflict, reason)
                .beamtime(&self.beamtime.beamtime_id)
                .dataset(id)
                .attempts(attempts),
        );
        Ok(Outcome::Conflict)
    }

    fn handle_error(
        &mut self,
        id: &DatasetId,
        current: Fingerprint,
        error: SubmissionError,
        attempts: u32,
    ) -> Result<Outcome, StateStoreError> {
        match error {
            SubmissionError::Cancelled => Ok(Outcome::Cancelled),
            SubmissionError::Auth(e) => {
                self.reporter.report(
                    IngestReport::new(ReportKind::AuthError, e.to_string())
                        .beamtime(&self.beamtime.beamtime_id)
                        .dataset(id),
                );
                Ok(Outcome::Deferred)
            }
            SubmissionError::AlreadyExists(_)
            | SubmissionError::NotFound(_)
            | SubmissionError::Rejected { .. } => {
                self.conflict(id, current, error.to_string(), attempts)
            }
            SubmissionError::Transport(_)
            | SubmissionError::Server { .. }
            | SubmissionError::Unauthorized { .. } => {
                let message = error.to_string();
                self.store.mark_failed(id, attempts, &message)?;
                self.failed_this_run.insert(id.clone(), current);
                self.reporter.report(
                    IngestReport::new(ReportKind::SubmissionFailed, message)
                        .beamtime(&self.beamtime.beamtime_id)
                        .dataset(id)
                        .attempts(attempts),
                );
                Ok(Outcome::Failed)
            }
        }
    }
}
