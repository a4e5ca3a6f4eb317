use chrono::Utc;
use scingest_core::{
    DatasetId, Fingerprint, IngestionRecord, RecordStatus, StateStoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

const STATE_VERSION: u32 = 1;

/// On-disk layout of a recovery file. Unknown fields are ignored so older
/// and newer versions can read each other's files.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    beamtime_id: String,
    #[serde(default)]
    records: BTreeMap<DatasetId, IngestionRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StateFileRef<'a> {
    version: u32,
    beamtime_id: &'a str,
    records: &'a BTreeMap<DatasetId, IngestionRecord>,
}

/// Durable record of what has been submitted for one beamtime.
///
/// Every mutation rewrites the recovery file atomically before the
/// in-memory copy changes, so a failed write leaves both sides as they were.
pub struct IngestionStateStore {
    path: PathBuf,
    beamtime_id: String,
    records: BTreeMap<DatasetId, IngestionRecord>,
}

impl IngestionStateStore {
    pub fn file_name(beamtime_id: &str) -> String {
        format!("scicat-ingested-datasets-{}.json", beamtime_id)
    }

    pub fn file_path(dir: &Path, beamtime_id: &str) -> PathBuf {
        dir.join(Self::file_name(beamtime_id))
    }

    /// Reads the recovery file in `dir`. A missing file is an empty store.
    pub fn load(dir: &Path, beamtime_id: &str) -> Result<Self, StateStoreError> {
        let path = Self::file_path(dir, beamtime_id);

        let records = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let file: StateFile =
                    serde_json::from_str(&raw).map_err(|source| StateStoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                if file.beamtime_id != beamtime_id {
                    return Err(StateStoreError::Mismatch {
                        path,
                        expected: beamtime_id.to_string(),
                        found: file.beamtime_id,
                    });
                }
                file.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StateStoreError::Read { path, source }),
        };

        let store = Self {
            path,
            beamtime_id: beamtime_id.to_string(),
            records,
        };
        info!(
            "Loaded state for beamtime {}: {} ingested, {} waiting, {} failed",
            beamtime_id,
            store.ingested().count(),
            store.waiting().count(),
            store.failed().count()
        );
        Ok(store)
    }

    /// Removes the recovery file of a finished beamtime.
    pub fn clear(dir: &Path, beamtime_id: &str) -> Result<(), StateStoreError> {
        let path = Self::file_path(dir, beamtime_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Cleared state file {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateStoreError::Write { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn beamtime_id(&self) -> &str {
        &self.beamtime_id
    }

    pub fn record(&self, id: &DatasetId) -> Option<&IngestionRecord> {
        self.records.get(id)
    }

    pub fn is_ingested(&self, id: &DatasetId) -> bool {
        self.status(id) == Some(RecordStatus::Ingested)
    }

    pub fn status(&self, id: &DatasetId) -> Option<RecordStatus> {
        self.records.get(id).map(|r| r.status)
    }

    /// Marks `id` as submitted. Returns `false` without touching the file
    /// when the dataset is already ingested.
    pub fn mark_waiting(&mut self, id: &DatasetId) -> Result<bool, StateStoreError> {
        let mut record = match self.records.get(id) {
            Some(r) if r.status == RecordStatus::Ingested => return Ok(false),
            Some(r) => r.clone(),
            None => IngestionRecord::new(id.clone(), RecordStatus::Waiting),
        };
        record.status = RecordStatus::Waiting;
        record.last_attempt = Utc::now();
        record.conflict = false;

        self.commit(record)?;
        Ok(true)
    }

    /// Records a catalog acknowledgment together with the file versions it covers.
    pub fn mark_ingested(
        &mut self,
        id: &DatasetId,
        fingerprint: Fingerprint,
        attempts: u32,
    ) -> Result<(), StateStoreError> {
        let mut record = self
            .records
            .get(id)
            .cloned()
            .unwrap_or_else(|| IngestionRecord::new(id.clone(), RecordStatus::Ingested));
        record.status = RecordStatus::Ingested;
        record.last_attempt = Utc::now();
        record.attempts = record.attempts.saturating_add(attempts);
        record.fingerprint = fingerprint;
        record.last_error = None;
        record.conflict = false;

        self.commit(record)
    }

    /// Records a given-up submission. An already ingested dataset keeps its
    /// status and only remembers the error.
    pub fn mark_failed(
        &mut self,
        id: &DatasetId,
        attempts: u32,
        error: &str,
    ) -> Result<(), StateStoreError> {
        self.fail(id, attempts, error, false)
    }

    /// Like [`mark_failed`](Self::mark_failed), for a dataset the catalog
    /// refused under the update strategy.
    pub fn mark_conflict(
        &mut self,
        id: &DatasetId,
        attempts: u32,
        reason: &str,
    ) -> Result<(), StateStoreError> {
        self.fail(id, attempts, reason, true)
    }

    /// True when the last submission of `id` went out (or may have) without
    /// a recorded answer, so the remote dataset may be our own.
    pub fn is_leftover(&self, id: &DatasetId) -> bool {
        self.records.get(id).is_some_and(|r| match r.status {
            RecordStatus::Waiting => true,
            RecordStatus::Failed => !r.conflict,
            RecordStatus::Ingested => false,
        })
    }

    fn fail(
        &mut self,
        id: &DatasetId,
        attempts: u32,
        error: &str,
        conflict: bool,
    ) -> Result<(), StateStoreError> {
        let mut record = self
            .records
            .get(id)
            .cloned()
            .unwrap_or_else(|| IngestionRecord::new(id.clone(), RecordStatus::Failed));
        if record.status != RecordStatus::Ingested {
            record.status = RecordStatus::Failed;
            record.conflict = conflict;
        }
        record.last_attempt = Utc::now();
        record.attempts = record.attempts.saturating_add(attempts);
        record.last_error = Some(error.to_string());

        self.commit(record)
    }

    pub fn waiting(&self) -> impl Iterator<Item = &DatasetId> {
        self.with_status(RecordStatus::Waiting)
    }

    pub fn ingested(&self) -> impl Iterator<Item = &DatasetId> {
        self.with_status(RecordStatus::Ingested)
    }

    pub fn failed(&self) -> impl Iterator<Item = &DatasetId> {
        self.with_status(RecordStatus::Failed)
    }

    /// True when nothing is pending or failed.
    pub fn is_settled(&self) -> bool {
        self.records
            .values()
            .all(|r| r.status == RecordStatus::Ingested)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn with_status(&self, status: RecordStatus) -> impl Iterator<Item = &DatasetId> {
        self.records
            .values()
            .filter(move |r| r.status == status)
            .map(|r| &r.id)
    }

    fn commit(&mut self, record: IngestionRecord) -> Result<(), StateStoreError> {
        let mut next = self.records.clone();
        debug!("State {}: {} -> {:?}", self.beamtime_id, record.id, record.status);
        next.insert(record.id.clone(), record);

        self.write(&next)?;
        self.records = next;
        Ok(())
    }

    fn write(&self, records: &BTreeMap<DatasetId, IngestionRecord>) -> Result<(), StateStoreError> {
        let write_err = |source: std::io::Error| StateStoreError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let body = serde_json::to_string_pretty(&StateFileRef {
            version: STATE_VERSION,
            beamtime_id: &self.beamtime_id,
            records,
        })
        .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(body.as_bytes()).map_err(write_err)?;
        tmp.write_all(b"\n").map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}
