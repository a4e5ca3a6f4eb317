use crate::lifecycle::{Lifecycle, TaskHandle, WatcherKind};
use crate::notifier::{ChangeKind, Notifier, WatchMode};
use async_trait::async_trait;
use glob::Pattern;
use scingest_core::WatchError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub type FileCallback = Arc<dyn Fn(PathBuf) + Send + Sync>;

/// Reports files appearing in a single scan directory.
pub struct ScanDirWatcher {
    path: PathBuf,
    pattern: Pattern,
    notifier: Arc<Notifier>,
    on_file_appeared: FileCallback,
    task: Option<TaskHandle>,
}

impl ScanDirWatcher {
    pub fn new(
        notifier: Arc<Notifier>,
        path: impl Into<PathBuf>,
        pattern: Pattern,
        on_file_appeared: FileCallback,
    ) -> Self {
        Self {
            path: path.into(),
            pattern,
            notifier,
            on_file_appeared,
            task: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Lifecycle for ScanDirWatcher {
    fn kind(&self) -> WatcherKind {
        WatcherKind::ScanDirectory
    }

    fn start(&mut self) -> Result<(), WatchError> {
        if self.running() {
            return Ok(());
        }
        let mut handle = self.notifier.add_watch(&self.path, WatchMode::NonRecursive)?;
        let pattern = self.pattern.clone();
        let callback = Arc::clone(&self.on_file_appeared);
        let watched = handle.path().to_path_buf();

        self.task = Some(TaskHandle::spawn(move |cancel| async move {
            debug!("Watching scan directory {:?}", watched);
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = handle.recv() => event,
                };
                let Some(event) = event else {
                    debug!("Scan directory {:?} no longer watched", watched);
                    break;
                };
                if !matches!(event.kind, ChangeKind::Created | ChangeKind::Renamed)
                    || event.is_dir
                    || event.path == watched
                    || !event.path.exists()
                {
                    continue;
                }
                let matches = event
                    .path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| pattern.matches(name));
                if matches {
                    callback(event.path);
                }
            }
            // dropping the handle releases the registration
            drop(handle);
        }));
        info!("Started scan directory watcher on {:?}", self.path);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.stop().await;
            debug!("Stopped scan directory watcher on {:?}", self.path);
        }
    }

    fn running(&self) -> bool {
        self.task.as_ref().is_some_and(TaskHandle::is_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_reports_matching_files_until_stopped() {
        let dir = TempDir::new().unwrap();
        let scan_dir = dir.path().canonicalize().unwrap();
        let notifier = Arc::new(Notifier::start(Duration::from_millis(20)).unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: FileCallback = Arc::new(move |path: PathBuf| {
            let _ = tx.send(path);
        });
        let mut watcher = ScanDirWatcher::new(
            Arc::clone(&notifier),
            &scan_dir,
            Pattern::new("*.h5").unwrap(),
            callback,
        );
        watcher.start().unwrap();
        watcher.start().unwrap();
        assert!(watcher.running());
        assert_eq!(watcher.kind(), WatcherKind::ScanDirectory);

        std::fs::write(scan_dir.join("notes.txt"), "").unwrap();
        std::fs::write(scan_dir.join("frame_0001.h5"), "x").unwrap();

        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, scan_dir.join("frame_0001.h5"));

        watcher.stop().await;
        watcher.stop().await;
        assert!(!watcher.running());
        assert_eq!(notifier.registration_count(), 0);

        std::fs::write(scan_dir.join("frame_0002.h5"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // only the first file, nothing after stop
        while let Ok(path) = rx.try_recv() {
            assert_eq!(path, scan_dir.join("frame_0001.h5"));
        }
    }

    #[tokio::test]
    async fn test_missing_directory_fails_to_start() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(Notifier::start(Duration::from_millis(20)).unwrap());
        let mut watcher = ScanDirWatcher::new(
            notifier,
            dir.path().join("not_yet"),
            Pattern::new("*").unwrap(),
            Arc::new(|_: PathBuf| {}),
        );
        assert!(matches!(watcher.start(), Err(WatchError::NotFound(_))));
        assert!(!watcher.running());
        watcher.stop().await;
    }
}
