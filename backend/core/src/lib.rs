use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub mod config;
pub mod error;

pub use config::IngestorConfig;
pub use error::{AuthError, ConfigError, ScanError, StateStoreError, SubmissionError, WatchError};

/// Catalog identifier of a dataset: `<beamtimeId>/<scanName>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn new(beamtime_id: &str, scan_name: &str) -> Self {
        Self(format!("{}/{}", beamtime_id, scan_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Person {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(email) => Some(Self {
                name: None,
                email: Some(email.clone()),
            }),
            Value::Object(map) => {
                let text = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
                let name = match (text("firstname"), text("lastname")) {
                    (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
                    (first, last) => last.or(first).or_else(|| text("name")),
                };
                let person = Self {
                    name,
                    email: text("email"),
                };
                (person.name.is_some() || person.email.is_some()).then_some(person)
            }
            _ => None,
        }
    }
}

/// A beamtime as described by its `beamtime-metadata-*.json` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeamtimeDescriptor {
    pub beamtime_id: String,
    pub beamline: String,
    /// Root of the beamtime's dataset tree (the descriptor's directory)
    pub directory: PathBuf,
    pub descriptor_path: PathBuf,
    pub proposal_id: Option<String>,
    pub pi: Option<Person>,
    pub applicant: Option<Person>,
    pub status: Option<String>,
    pub closed: bool,
}

impl BeamtimeDescriptor {
    pub fn from_json(descriptor_path: &Path, raw: &str) -> Result<Self, ScanError> {
        let value: Value = serde_json::from_str(raw).map_err(|source| ScanError::Parse {
            path: descriptor_path.to_path_buf(),
            source,
        })?;
        let invalid = |reason: &str| ScanError::Invalid {
            path: descriptor_path.to_path_buf(),
            reason: reason.to_string(),
        };

        let map = value.as_object().ok_or_else(|| invalid("not a JSON object"))?;
        let text = |key: &str| {
            map.get(key).and_then(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };

        let beamtime_id = text("beamtimeId").ok_or_else(|| invalid("missing beamtimeId"))?;
        let beamline = text("beamline").ok_or_else(|| invalid("missing beamline"))?;
        if beamtime_id.contains('/') {
            return Err(invalid("beamtimeId must not contain '/'"));
        }

        let directory = descriptor_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| invalid("descriptor has no parent directory"))?;

        Ok(Self {
            beamtime_id,
            beamline,
            directory,
            descriptor_path: descriptor_path.to_path_buf(),
            proposal_id: text("proposalId"),
            pi: map.get("pi").and_then(Person::from_value),
            applicant: map.get("applicant").and_then(Person::from_value),
            status: text("status"),
            closed: map.get("closed").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    /// Whether the descriptor marks the beamtime as finished.
    pub fn is_ended(&self) -> bool {
        if self.closed {
            return true;
        }
        self.status.as_deref().is_some_and(|s| {
            matches!(
                s.to_ascii_lowercase().as_str(),
                "closed" | "completed" | "finished"
            )
        })
    }
}

/// One dataset found by a scan pass. Recomputed on every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetCandidate {
    pub scan_name: String,
    pub id: DatasetId,
    pub metadata_path: PathBuf,
    pub datablock_path: Option<PathBuf>,
    /// Directory holding the scan's raw files, when it exists
    pub scan_dir: Option<PathBuf>,
}

/// Modification times (unix seconds) of the files a record was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub metadata_modified: Option<i64>,
    pub datablock_modified: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Submitted, acknowledgment not yet recorded
    Waiting,
    Ingested,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRecord {
    pub id: DatasetId,
    pub status: RecordStatus,
    pub last_attempt: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(flatten)]
    pub fingerprint: Fingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The catalog refused the dataset under the update strategy. Such a
    /// record is never taken for a leftover of our own submission.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conflict: bool,
}

impl IngestionRecord {
    pub fn new(id: DatasetId, status: RecordStatus) -> Self {
        Self {
            id,
            status,
            last_attempt: Utc::now(),
            attempts: 0,
            fingerprint: Fingerprint::default(),
            last_error: None,
            conflict: false,
        }
    }
}

/// How an existing or missing remote dataset is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    /// Never touch remote datasets; only finish waiting leftovers
    No,
    /// Create only; an existing dataset is a conflict
    Create,
    /// Update only; a missing dataset is a conflict
    Patch,
    /// Create if absent, patch if present
    #[default]
    Mixed,
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateStrategy::No => "no",
            UpdateStrategy::Create => "create",
            UpdateStrategy::Patch => "patch",
            UpdateStrategy::Mixed => "mixed",
        };
        f.write_str(name)
    }
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "no" => Ok(UpdateStrategy::No),
            "create" => Ok(UpdateStrategy::Create),
            "patch" => Ok(UpdateStrategy::Patch),
            "mixed" => Ok(UpdateStrategy::Mixed),
            other => Err(format!("unknown update strategy: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_parsing() {
        let path = Path::new("/data/current/beamtime-metadata-99001234.json");
        let raw = r#"{
            "beamtimeId": "99001234",
            "beamline": "p00",
            "proposalId": "BAG-123",
            "pi": {"firstname": "Ada", "lastname": "Lovelace", "email": "ada@example.org"},
            "applicant": "applicant@example.org",
            "status": "running"
        }"#;

        let bt = BeamtimeDescriptor::from_json(path, raw).unwrap();
        assert_eq!(bt.beamtime_id, "99001234");
        assert_eq!(bt.beamline, "p00");
        assert_eq!(bt.directory, PathBuf::from("/data/current"));
        assert_eq!(bt.pi.as_ref().unwrap().name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(
            bt.applicant.as_ref().unwrap().email.as_deref(),
            Some("applicant@example.org")
        );
        assert!(!bt.is_ended());
    }

    #[test]
    fn test_descriptor_requires_fields() {
        let path = Path::new("/data/beamtime-metadata-x.json");
        let missing = BeamtimeDescriptor::from_json(path, r#"{"beamtimeId": "1"}"#);
        assert!(matches!(missing, Err(ScanError::Invalid { .. })));

        let garbage = BeamtimeDescriptor::from_json(path, "{not json");
        assert!(matches!(garbage, Err(ScanError::Parse { .. })));
    }

    #[test]
    fn test_descriptor_lifecycle() {
        let path = Path::new("/data/beamtime-metadata-1.json");
        let done =
            BeamtimeDescriptor::from_json(path, r#"{"beamtimeId": 1, "beamline": "p01", "status": "Completed"}"#)
                .unwrap();
        assert_eq!(done.beamtime_id, "1");
        assert!(done.is_ended());

        let closed =
            BeamtimeDescriptor::from_json(path, r#"{"beamtimeId": "1", "beamline": "p01", "closed": true}"#)
                .unwrap();
        assert!(closed.is_ended());
    }

    #[test]
    fn test_record_serialization_is_forward_compatible() {
        let raw = r#"{
            "id": "bt/scan_001",
            "status": "ingested",
            "lastAttempt": "2024-05-01T10:00:00Z",
            "someFutureField": [1, 2, 3]
        }"#;
        let record: IngestionRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.id, DatasetId::new("bt", "scan_001"));
        assert_eq!(record.status, RecordStatus::Ingested);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.fingerprint, Fingerprint::default());
        assert!(!record.conflict);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("MIXED".parse::<UpdateStrategy>().unwrap(), UpdateStrategy::Mixed);
        assert_eq!(UpdateStrategy::No.to_string(), "no");
        assert!("maybe".parse::<UpdateStrategy>().is_err());
    }
}
