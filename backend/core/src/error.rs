use std::path::PathBuf;
use thiserror::Error;

/// Watch registration/removal failure. Never fatal: the affected path
/// degrades to rescan-only.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch path does not exist: {0}")]
    NotFound(PathBuf),

    #[error("OS watch table exhausted while watching {0}")]
    Exhausted(PathBuf),

    #[error("notification backend error on {path}: {message}")]
    Backend { path: PathBuf, message: String },

    #[error("notifier is stopped")]
    Stopped,
}

/// Malformed or unreadable metadata. The candidate is skipped.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid metadata in {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("scan name {scan} of {path} already used by {first}")]
    DuplicateScan {
        scan: String,
        path: PathBuf,
        first: PathBuf,
    },
}

impl ScanError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ScanError::Io { path, .. }
            | ScanError::Parse { path, .. }
            | ScanError::Invalid { path, .. }
            | ScanError::DuplicateScan { path, .. } => path,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential file {path} unreadable: {message}")]
    Credentials { path: PathBuf, message: String },

    #[error("no credential file configured")]
    MissingCredentials,

    #[error("login request failed: {0}")]
    Transport(String),

    #[error("login rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("login response carried no token")]
    MissingToken,

    #[error("token refresh gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Catalog rejected or could not be reached.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("catalog unreachable: {0}")]
    Transport(String),

    #[error("catalog server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("unauthorized ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("dataset not found: {0}")]
    NotFound(String),

    #[error("dataset already exists: {0}")]
    AlreadyExists(String),

    #[error("catalog rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("credential refresh failed: {0}")]
    Auth(#[from] AuthError),

    #[error("submission cancelled")]
    Cancelled,
}

impl SubmissionError {
    /// Network failures and 5xx answers are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmissionError::Transport(_) | SubmissionError::Server { .. }
        )
    }
}

/// Durable state could not be read or written. Fatal for the owning watcher.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} belongs to beamtime {found}, expected {expected}")]
    Mismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
