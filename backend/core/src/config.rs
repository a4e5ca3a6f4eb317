use crate::error::ConfigError;
use crate::UpdateStrategy;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Ingestor configuration, read from a YAML file.
///
/// Every field has a default, so a config only needs the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestorConfig {
    /// Base directories scanned for beamtime descriptor files
    pub beamtime_dirs: Vec<PathBuf>,
    pub beamtime_file_pattern: String,
    /// Matched against file names inside a beamtime directory
    pub dataset_file_pattern: String,
    pub datablock_file_suffix: String,
    /// Files inside a scan directory that count as new dataset content
    pub scan_file_pattern: String,
    pub max_scan_depth: usize,
    pub recheck_interval_secs: u64,
    pub notifier_timeout_ms: u64,
    /// Settle time between noticing a change and scanning for it
    pub ingestion_delay_ms: u64,

    pub scicat_url: String,
    pub ingestor_username: String,
    pub ingestor_credential_file: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub auth_max_attempts: u32,
    pub update_strategy: UpdateStrategy,
    pub doi_prefix: String,

    /// Re-submit datasets whose metadata changed after ingestion
    pub reingest_modified: bool,
    pub watch_scan_dirs: bool,
    /// Where recovery files live; defaults to each beamtime's directory
    pub state_dir: Option<PathBuf>,
    pub clear_closed_beamtimes: bool,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            beamtime_dirs: Vec::new(),
            beamtime_file_pattern: "beamtime-metadata-*.json".to_string(),
            dataset_file_pattern: "*.scan.json".to_string(),
            datablock_file_suffix: ".origdatablock.json".to_string(),
            scan_file_pattern: "*".to_string(),
            max_scan_depth: 4,
            recheck_interval_secs: 60,
            notifier_timeout_ms: 100,
            ingestion_delay_ms: 0,
            scicat_url: "http://localhost:8881/api/v3".to_string(),
            ingestor_username: "ingestor".to_string(),
            ingestor_credential_file: None,
            request_timeout_secs: 30,
            max_attempts: 3,
            retry_delay_ms: 1000,
            auth_max_attempts: 3,
            update_strategy: UpdateStrategy::default(),
            doi_prefix: "10.3204".to_string(),
            reingest_modified: false,
            watch_scan_dirs: false,
            state_dir: None,
            clear_closed_beamtimes: true,
        }
    }
}

impl IngestorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document is a valid all-defaults config.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, pattern) in [
            ("beamtime_file_pattern", &self.beamtime_file_pattern),
            ("dataset_file_pattern", &self.dataset_file_pattern),
            ("scan_file_pattern", &self.scan_file_pattern),
        ] {
            Pattern::new(pattern).map_err(|e| ConfigError::Invalid {
                field,
                reason: format!("{}: {}", pattern, e),
            })?;
        }

        if self.datablock_file_suffix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "datablock_file_suffix",
                reason: "must not be empty".to_string(),
            });
        }

        let positive = [
            ("max_attempts", self.max_attempts as u64),
            ("auth_max_attempts", self.auth_max_attempts as u64),
            ("recheck_interval_secs", self.recheck_interval_secs),
            ("notifier_timeout_ms", self.notifier_timeout_ms),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        url::Url::parse(&self.scicat_url).map_err(|e| ConfigError::Invalid {
            field: "scicat_url",
            reason: format!("{}: {}", self.scicat_url, e),
        })?;

        if self.beamtime_dirs.is_empty() {
            warn!("No beamtime_dirs configured, nothing will be watched");
        }

        Ok(())
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_interval_secs)
    }

    pub fn notifier_timeout(&self) -> Duration {
        Duration::from_millis(self.notifier_timeout_ms)
    }

    pub fn ingestion_delay(&self) -> Duration {
        Duration::from_millis(self.ingestion_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Directory holding the recovery file of a beamtime rooted at `beamtime_dir`.
    pub fn state_dir_for(&self, beamtime_dir: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| beamtime_dir.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_from_partial_yaml() {
        let config = IngestorConfig::from_yaml(
            "beamtime_dirs:\n  - /gpfs/current\nscicat_url: http://catalog:3000/api/v3\n",
        )
        .unwrap();

        assert_eq!(config.beamtime_dirs, vec![PathBuf::from("/gpfs/current")]);
        assert_eq!(config.scicat_url, "http://catalog:3000/api/v3");
        assert_eq!(config.beamtime_file_pattern, "beamtime-metadata-*.json");
        assert_eq!(config.update_strategy, UpdateStrategy::Mixed);
        assert_eq!(config.max_attempts, 3);
        assert!(!config.reingest_modified);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_update_strategy_is_lowercase() {
        let config = IngestorConfig::from_yaml("update_strategy: patch\n").unwrap();
        assert_eq!(config.update_strategy, UpdateStrategy::Patch);

        assert!(IngestorConfig::from_yaml("update_strategy: sometimes\n").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = IngestorConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "max_attempts",
                ..
            })
        ));

        let config = IngestorConfig {
            dataset_file_pattern: "[".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IngestorConfig {
            scicat_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_attempts: 7\nwatch_scan_dirs: true").unwrap();

        let config = IngestorConfig::load(file.path()).unwrap();
        assert_eq!(config.max_attempts, 7);
        assert!(config.watch_scan_dirs);

        let missing = IngestorConfig::load("/definitely/not/here.yaml");
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_state_dir_fallback() {
        let config = IngestorConfig::default();
        assert_eq!(
            config.state_dir_for(Path::new("/data/bt1")),
            PathBuf::from("/data/bt1")
        );

        let config = IngestorConfig {
            state_dir: Some(PathBuf::from("/var/lib/scingest")),
            ..Default::default()
        };
        assert_eq!(
            config.state_dir_for(Path::new("/data/bt1")),
            PathBuf::from("/var/lib/scingest")
        );
    }
}
