use crate::catalog::CatalogClient;
use crate::notifier::Notifier;
use crate::report::Reporter;
use scingest_core::IngestorConfig;
use std::sync::Arc;

/// Collaborators shared by every watcher of one service.
#[derive(Clone)]
pub struct WatcherContext {
    pub config: Arc<IngestorConfig>,
    pub notifier: Arc<Notifier>,
    pub catalog: Arc<CatalogClient>,
    pub reporter: Arc<dyn Reporter>,
}
