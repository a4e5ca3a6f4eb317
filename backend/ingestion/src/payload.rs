use chrono::{DateTime, Utc};
use scingest_core::{BeamtimeDescriptor, DatasetCandidate, Fingerprint, ScanError};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

/// Catalog documents for one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetPayload {
    pub dataset: Value,
    pub datablock: Option<Value>,
    pub fingerprint: Fingerprint,
}

pub fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub fn modified_secs(path: &Path) -> Option<i64> {
    let time: DateTime<Utc> = modified(path)?.into();
    Some(time.timestamp())
}

/// Current version of the files behind `candidate`.
pub fn fingerprint(candidate: &DatasetCandidate) -> Fingerprint {
    Fingerprint {
        metadata_modified: modified_secs(&candidate.metadata_path),
        datablock_modified: candidate
            .datablock_path
            .as_deref()
            .and_then(modified_secs),
    }
}

fn read_object(path: &Path) -> Result<Map<String, Value>, ScanError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| ScanError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ScanError::Invalid {
            path: path.to_path_buf(),
            reason: "metadata is not a JSON object".to_string(),
        }),
    }
}

fn set_default(map: &mut Map<String, Value>, key: &str, value: Value) {
    map.entry(key.to_string()).or_insert(value);
}

/// Files and total bytes below `dir`.
fn directory_stats(dir: &Path) -> (u64, u64) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(count, size), entry| {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (count + 1, size + len)
        })
}

/// Files and total bytes listed in a datablock's `dataFileList`.
fn datablock_stats(datablock: &Map<String, Value>) -> Option<(u64, u64)> {
    let files = datablock.get("dataFileList")?.as_array()?;
    let size = files
        .iter()
        .filter_map(|f| f.get("size").and_then(Value::as_u64))
        .sum();
    Some((files.len() as u64, size))
}

pub fn access_groups(beamtime: &BeamtimeDescriptor) -> Vec<String> {
    vec![
        format!("{}-clbt", beamtime.beamtime_id),
        format!("{}-dmgt", beamtime.beamtime_id),
        format!("{}dmgt", beamtime.beamline),
    ]
}

/// Reads and validates the metadata of `candidate` and fills in the
/// derived catalog fields it does not set itself.
pub fn build(
    beamtime: &BeamtimeDescriptor,
    candidate: &DatasetCandidate,
    doi_prefix: &str,
) -> Result<DatasetPayload, ScanError> {
    let path = &candidate.metadata_path;
    let invalid = |reason: String| ScanError::Invalid {
        path: path.clone(),
        reason,
    };
    let id = candidate.id.as_str();
    let bt = beamtime.beamtime_id.as_str();

    let mut dataset = read_object(path)?;
    if let Some(proposal) = dataset.get("proposalId").and_then(Value::as_str) {
        if proposal != bt {
            return Err(invalid(format!(
                "proposalId {} does not match beamtime {}",
                proposal, bt
            )));
        }
    }
    if let Some(pid) = dataset.get("pid").and_then(Value::as_str) {
        if pid != id {
            return Err(invalid(format!("pid {} does not match dataset {}", pid, id)));
        }
    }

    let groups = access_groups(beamtime);
    let datablock = match candidate.datablock_path.as_deref() {
        Some(db_path) => {
            let mut db = read_object(db_path)?;
            let expected = format!("{}/{}", doi_prefix, id);
            match db.get("datasetId").and_then(Value::as_str) {
                Some(found) if found != expected => {
                    return Err(ScanError::Invalid {
                        path: db_path.to_path_buf(),
                        reason: format!("datasetId {} does not match {}", found, expected),
                    });
                }
                Some(_) => {}
                None => {
                    db.insert("datasetId".to_string(), json!(expected));
                }
            }
            set_default(&mut db, "ownerGroup", json!(format!("{}-dmgt", bt)));
            set_default(&mut db, "accessGroups", json!(groups));
            Some(db)
        }
        None => None,
    };

    let (files, size) = datablock
        .as_ref()
        .and_then(datablock_stats)
        .or_else(|| candidate.scan_dir.as_deref().map(directory_stats))
        .unwrap_or((0, 0));

    let source_folder = candidate
        .scan_dir
        .as_deref()
        .or_else(|| path.parent())
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    let creation_time = modified(path)
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    set_default(&mut dataset, "pid", json!(id));
    set_default(&mut dataset, "proposalId", json!(bt));
    set_default(&mut dataset, "datasetName", json!(candidate.scan_name));
    set_default(&mut dataset, "type", json!("raw"));
    set_default(&mut dataset, "sourceFolder", json!(source_folder));
    set_default(&mut dataset, "creationTime", json!(creation_time));
    set_default(&mut dataset, "creationLocation", json!(beamtime.beamline));
    set_default(&mut dataset, "ownerGroup", json!(format!("{}-dmgt", bt)));
    set_default(&mut dataset, "accessGroups", json!(groups));
    set_default(&mut dataset, "numberOfFiles", json!(files));
    set_default(&mut dataset, "size", json!(size));

    if let Some(pi) = &beamtime.pi {
        if let Some(email) = &pi.email {
            set_default(&mut dataset, "principalInvestigator", json!(email));
            set_default(&mut dataset, "ownerEmail", json!(email));
        }
        if let Some(name) = &pi.name {
            set_default(&mut dataset, "owner", json!(name));
        }
    }
    let contact = beamtime
        .applicant
        .as_ref()
        .and_then(|a| a.email.clone())
        .or_else(|| beamtime.pi.as_ref().and_then(|p| p.email.clone()));
    if let Some(contact) = contact {
        set_default(&mut dataset, "contactEmail", json!(contact));
    }

    Ok(DatasetPayload {
        dataset: Value::Object(dataset),
        datablock: datablock.map(Value::Object),
        fingerprint: fingerprint(candidate),
    })
}
