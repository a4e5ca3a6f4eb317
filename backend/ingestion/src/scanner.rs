use glob::Pattern;
use scingest_core::{BeamtimeDescriptor, DatasetCandidate, DatasetId, IngestorConfig, ScanError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Result of walking one beamtime directory.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Sorted by scan name
    pub candidates: Vec<DatasetCandidate>,
    pub errors: Vec<ScanError>,
}

/// Descriptor files directly inside `base_dir`, sorted by path.
pub fn find_beamtime_files(base_dir: &Path, pattern: &Pattern) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(base_dir)? {
        let entry = entry?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| pattern.matches(name));
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// The fixed tail of a glob, e.g. `.scan.json` for `*.scan.json`.
fn literal_suffix(pattern: &str) -> &str {
    match pattern.rfind(['*', '?', ']']) {
        Some(i) => &pattern[i + 1..],
        None => "",
    }
}

/// Finds dataset metadata files below a beamtime directory.
pub struct Scanner {
    dataset_pattern: Pattern,
    dataset_suffix: String,
    datablock_suffix: String,
    max_depth: usize,
}

impl Scanner {
    pub fn new(config: &IngestorConfig) -> Result<Self, glob::PatternError> {
        Ok(Self {
            dataset_pattern: Pattern::new(&config.dataset_file_pattern)?,
            dataset_suffix: literal_suffix(&config.dataset_file_pattern).to_string(),
            datablock_suffix: config.datablock_file_suffix.clone(),
            max_depth: config.max_scan_depth,
        })
    }

    /// Whether `path` could change the outcome of a scan.
    pub fn is_relevant(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| {
                self.dataset_pattern.matches(name) || name.ends_with(&self.datablock_suffix)
            })
    }

    fn scan_name(&self, file_name: &str) -> Option<String> {
        let name = if self.dataset_suffix.is_empty() {
            Path::new(file_name).file_stem()?.to_str()?
        } else {
            file_name.strip_suffix(&self.dataset_suffix)?
        };
        (!name.is_empty()).then(|| name.to_string())
    }

    pub fn scan(&self, beamtime: &BeamtimeDescriptor) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut found = Vec::new();

        let walker = WalkDir::new(&beamtime.directory)
            .max_depth(self.max_depth)
            .sort_by_file_name();

        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| beamtime.directory.clone());
                    let source = err.into_io_error().unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop")
                    });
                    outcome.errors.push(ScanError::Io { path, source });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            if !self.dataset_pattern.matches(file_name) || file_name.ends_with(&self.datablock_suffix)
            {
                continue;
            }
            let Some(scan_name) = self.scan_name(file_name) else {
                continue;
            };

            let metadata_path = entry.path().to_path_buf();
            let dir = metadata_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| beamtime.directory.clone());
            let datablock_path = dir.join(format!("{}{}", scan_name, self.datablock_suffix));
            let scan_dir = dir.join(&scan_name);

            found.push(DatasetCandidate {
                id: DatasetId::new(&beamtime.beamtime_id, &scan_name),
                scan_name,
                metadata_path,
                datablock_path: datablock_path.is_file().then_some(datablock_path),
                scan_dir: scan_dir.is_dir().then_some(scan_dir),
            });
        }

        found.sort_by(|a, b| {
            a.scan_name
                .cmp(&b.scan_name)
                .then_with(|| a.metadata_path.cmp(&b.metadata_path))
        });

        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        for candidate in found {
            if let Some(first) = seen.get(&candidate.scan_name) {
                outcome.errors.push(ScanError::DuplicateScan {
                    scan: candidate.scan_name.clone(),
                    path: candidate.metadata_path.clone(),
                    first: first.clone(),
                });
                continue;
            }
            seen.insert(candidate.scan_name.clone(), candidate.metadata_path.clone());
            outcome.candidates.push(candidate);
        }

        debug!(
            "Scanned {:?}: {} candidates, {} errors",
            beamtime.directory,
            outcome.candidates.len(),
            outcome.errors.len()
        );
        if !outcome.candidates.is_empty() {
            info!(
                "Beamtime {}: found {} datasets",
                beamtime.beamtime_id,
                outcome.candidates.len()
            );
        }
        outcome
    }
}
