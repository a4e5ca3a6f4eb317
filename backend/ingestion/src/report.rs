use scingest_core::DatasetId;
use std::fmt;
use std::sync::Mutex;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    ScanError,
    WatchError,
    AuthError,
    SubmissionFailed,
    Conflict,
    StateStoreError,
}

/// A failure worth an operator's attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub kind: ReportKind,
    pub beamtime_id: Option<String>,
    pub dataset_id: Option<DatasetId>,
    pub attempts: u32,
    pub message: String,
}

impl IngestReport {
    pub fn new(kind: ReportKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            beamtime_id: None,
            dataset_id: None,
            attempts: 0,
            message: message.into(),
        }
    }

    pub fn beamtime(mut self, beamtime_id: &str) -> Self {
        self.beamtime_id = Some(beamtime_id.to_string());
        self
    }

    pub fn dataset(mut self, id: &DatasetId) -> Self {
        self.dataset_id = Some(id.clone());
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(bt) = &self.beamtime_id {
            write!(f, " beamtime={}", bt)?;
        }
        if let Some(id) = &self.dataset_id {
            write!(f, " dataset={}", id)?;
        }
        if self.attempts > 0 {
            write!(f, " attempts={}", self.attempts)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Sink for failures. Passed to every component that can fail on behalf
/// of a dataset or beamtime.
pub trait Reporter: Send + Sync {
    fn report(&self, report: IngestReport);
}

/// Writes reports to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, report: IngestReport) {
        match report.kind {
            ReportKind::StateStoreError | ReportKind::SubmissionFailed => error!("{}", report),
            _ => warn!("{}", report),
        }
    }
}

/// Keeps reports in memory, optionally forwarding them to another sink.
#[derive(Default)]
pub struct MemoryReporter {
    reports: Mutex<Vec<IngestReport>>,
    forward: Option<Box<dyn Reporter>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding(inner: impl Reporter + 'static) -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            forward: Some(Box::new(inner)),
        }
    }

    pub fn reports(&self) -> Vec<IngestReport> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, kind: ReportKind) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, report: IngestReport) {
        if let Some(inner) = &self.forward {
            inner.report(report.clone());
        }
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report);
    }
}
