use async_trait::async_trait;
use scingest_core::WatchError;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    Beamtime,
    Dataset,
    ScanDirectory,
}

/// Control surface shared by every watcher.
#[async_trait]
pub trait Lifecycle: Send {
    fn kind(&self) -> WatcherKind;

    /// Starts the watcher's task. A running watcher is left alone.
    fn start(&mut self) -> Result<(), WatchError>;

    /// Lets the current pass finish, then waits for the task to exit.
    /// Calling it again is a no-op.
    async fn stop(&mut self);

    fn running(&self) -> bool;
}

/// A spawned watcher loop and the token that asks it to finish.
pub(crate) struct TaskHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub(crate) fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(task(cancel.clone()));
        Self {
            cancel,
            join: Some(join),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    pub(crate) async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                if e.is_panic() {
                    warn!("Watcher task panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_waits_for_task() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut task = TaskHandle::spawn(|cancel| async move {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(());
        });
        assert!(task.is_running());

        task.stop().await;
        assert!(!task.is_running());
        assert!(rx.await.is_ok());

        task.stop().await;
    }
}
