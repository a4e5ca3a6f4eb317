pub mod notifier;
pub use notifier::{ChangeEvent, ChangeKind, Notifier, WatchHandle, WatchMode};

pub mod lifecycle;
pub use lifecycle::{Lifecycle, WatcherKind};

pub mod report;
pub use report::{IngestReport, MemoryReporter, ReportKind, Reporter, TracingReporter};

pub mod scanner;
pub use scanner::{ScanOutcome, Scanner};

pub mod payload;

pub mod credentials;
pub use credentials::{CredentialProvider, LoginCredentialProvider, StaticTokenProvider};

pub mod catalog;
pub use catalog::{Attempted, CatalogClient};

pub mod ingestor;
pub use ingestor::{BeamtimeIngestor, PassSummary};

pub mod context;
pub use context::WatcherContext;

pub mod scan_dir_watcher;
pub use scan_dir_watcher::{FileCallback, ScanDirWatcher};

pub mod dataset_watcher;
pub use dataset_watcher::{DatasetPhase, DatasetWatcher};

pub mod beamtime_watcher;
pub use beamtime_watcher::BeamtimeWatcher;

pub mod service;
pub use service::{ingest_once, ingest_once_with, IngestionService};
