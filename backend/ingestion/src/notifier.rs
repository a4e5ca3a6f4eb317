//! Shared filesystem notification multiplexer.
//!
//! One `notify` watcher serves every registration in the process. A
//! background thread polls the raw event channel with a bounded timeout and
//! fans each event out to the queues of all registrations whose path covers
//! it. Consumers must still rescan periodically: events can be dropped or
//! duplicated by the OS.

use notify::event::{AccessKind, AccessMode, ModifyKind, RemoveKind};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use scingest_core::WatchError;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Recursive,
    NonRecursive,
}

impl From<WatchMode> for RecursiveMode {
    fn from(mode: WatchMode) -> Self {
        match mode {
            WatchMode::Recursive => RecursiveMode::Recursive,
            WatchMode::NonRecursive => RecursiveMode::NonRecursive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
    /// The backend lost events; the consumer should rescan everything
    Rescan,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_dir: bool,
}

type WatchId = u64;

struct Registration {
    path: PathBuf,
    mode: WatchMode,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl Registration {
    fn covers(&self, path: &Path) -> bool {
        match self.mode {
            WatchMode::Recursive => path.starts_with(&self.path),
            WatchMode::NonRecursive => path == self.path || path.parent() == Some(&self.path),
        }
    }
}

#[derive(Default)]
struct WatchTable {
    watcher: Option<RecommendedWatcher>,
    registrations: HashMap<WatchId, Registration>,
    /// OS-level watches currently installed
    installed: BTreeMap<PathBuf, WatchMode>,
    next_id: WatchId,
}

impl WatchTable {
    /// One OS watch per registered path, in the strongest mode requested for
    /// it, skipping paths already covered by a recursive watch on an ancestor.
    fn desired(&self) -> BTreeMap<PathBuf, WatchMode> {
        let mut strongest: BTreeMap<PathBuf, WatchMode> = BTreeMap::new();
        for reg in self.registrations.values() {
            strongest
                .entry(reg.path.clone())
                .and_modify(|mode| {
                    if reg.mode == WatchMode::Recursive {
                        *mode = WatchMode::Recursive;
                    }
                })
                .or_insert(reg.mode);
        }

        let recursive: Vec<PathBuf> = strongest
            .iter()
            .filter(|(_, mode)| **mode == WatchMode::Recursive)
            .map(|(path, _)| path.clone())
            .collect();
        strongest.retain(|path, _| {
            !recursive
                .iter()
                .any(|ancestor| ancestor != path && path.starts_with(ancestor))
        });
        strongest
    }

    /// Brings the installed OS watches in line with the registrations and
    /// returns the paths that could not be watched.
    fn reconcile(&mut self) -> Vec<(PathBuf, notify::Error)> {
        let desired = self.desired();
        let Some(watcher) = self.watcher.as_mut() else {
            self.installed.clear();
            return Vec::new();
        };

        let stale: Vec<PathBuf> = self
            .installed
            .iter()
            .filter(|(path, mode)| desired.get(*path) != Some(*mode))
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            if let Err(e) = watcher.unwatch(&path) {
                // Already gone when the directory was deleted.
                debug!("Unwatch {:?}: {}", path, e);
            }
            self.installed.remove(&path);
        }

        let mut failures = Vec::new();
        for (path, mode) in desired {
            if self.installed.contains_key(&path) {
                continue;
            }
            match watcher.watch(&path, mode.into()) {
                Ok(()) => {
                    debug!("Watching {:?} ({:?})", path, mode);
                    self.installed.insert(path, mode);
                }
                Err(e) => failures.push((path, e)),
            }
        }
        failures
    }

    fn dispatch(&mut self, event: Event) {
        let mut dead: Vec<WatchId> = Vec::new();

        if event.need_rescan() {
            for (id, reg) in &self.registrations {
                let rescan = ChangeEvent {
                    path: reg.path.clone(),
                    kind: ChangeKind::Rescan,
                    is_dir: true,
                };
                if reg.tx.send(rescan).is_err() {
                    dead.push(*id);
                }
            }
        }

        if let Some(kind) = classify(&event.kind) {
            let folder_removed = matches!(event.kind, EventKind::Remove(RemoveKind::Folder));
            for path in &event.paths {
                let change = ChangeEvent {
                    path: path.clone(),
                    kind,
                    is_dir: folder_removed || path.is_dir(),
                };
                for (id, reg) in &self.registrations {
                    if !reg.covers(path) {
                        continue;
                    }
                    if reg.tx.send(change.clone()).is_err() {
                        dead.push(*id);
                        continue;
                    }
                    let gone = matches!(kind, ChangeKind::Removed | ChangeKind::Renamed)
                        && *path == reg.path
                        && !reg.path.exists();
                    if gone {
                        info!("Watched directory {:?} disappeared, dropping its watch", reg.path);
                        dead.push(*id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            for id in dead {
                self.registrations.remove(&id);
            }
            for (path, e) in self.reconcile() {
                warn!("Failed to re-establish watch on {:?}: {}", path, e);
            }
        }
    }

    fn broadcast_rescan(&mut self) {
        self.dispatch(Event::new(EventKind::Other).set_flag(notify::event::Flag::Rescan));
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        // A writer closing the file is the most reliable "content complete" signal.
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(ChangeKind::Modified),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some(ChangeKind::Other),
    }
}

fn map_notify_error(path: &Path, e: notify::Error) -> WatchError {
    match e.kind {
        notify::ErrorKind::PathNotFound => WatchError::NotFound(path.to_path_buf()),
        notify::ErrorKind::MaxFilesWatch => WatchError::Exhausted(path.to_path_buf()),
        notify::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
            WatchError::NotFound(path.to_path_buf())
        }
        // ENOSPC from inotify_add_watch means max_user_watches is used up.
        notify::ErrorKind::Io(ref io) if io.raw_os_error() == Some(28) => {
            WatchError::Exhausted(path.to_path_buf())
        }
        _ => WatchError::Backend {
            path: path.to_path_buf(),
            message: e.to_string(),
        },
    }
}

/// Collects raw events: waits up to `timeout` for the first one, then
/// drains whatever else is queued. `None` once the backend is gone.
fn poll_events(
    rx: &std_mpsc::Receiver<notify::Result<Event>>,
    timeout: Duration,
) -> Option<Vec<notify::Result<Event>>> {
    let mut batch = Vec::new();
    match rx.recv_timeout(timeout) {
        Ok(event) => batch.push(event),
        Err(std_mpsc::RecvTimeoutError::Timeout) => return Some(batch),
        Err(std_mpsc::RecvTimeoutError::Disconnected) => return None,
    }
    while let Ok(event) = rx.try_recv() {
        batch.push(event);
    }
    Some(batch)
}

struct Shared {
    table: Mutex<WatchTable>,
    running: AtomicBool,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, WatchTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: WatchId) {
        let mut table = self.table();
        if table.registrations.remove(&id).is_some() {
            for (path, e) in table.reconcile() {
                warn!("Failed to re-establish watch on {:?}: {}", path, e);
            }
        }
    }

    fn run(&self, rx: std_mpsc::Receiver<notify::Result<Event>>, timeout: Duration) {
        debug!("Notifier loop started (poll timeout {:?})", timeout);
        while self.running.load(Ordering::SeqCst) {
            let Some(batch) = poll_events(&rx, timeout) else {
                debug!("Notification backend closed");
                break;
            };
            if batch.is_empty() {
                continue;
            }

            let mut table = self.table();
            for event in batch {
                match event {
                    Ok(event) => table.dispatch(event),
                    Err(e) => {
                        warn!("Notification backend error: {}", e);
                        table.broadcast_rescan();
                    }
                }
            }
        }
        debug!("Notifier loop stopped");
    }
}

/// Consumer side of one registration. Dropping the handle removes the
/// registration.
pub struct WatchHandle {
    id: WatchId,
    path: PathBuf,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    shared: Weak<Shared>,
    closed: bool,
}

impl WatchHandle {
    /// Canonical path of the watched directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once the registration was pruned or the notifier stopped.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        let event = self.rx.recv().await;
        if event.is_none() {
            self.closed = true;
        }
        event
    }

    /// Events queued for this registration, waiting up to `timeout` for
    /// the first one.
    pub async fn poll_events(&mut self, timeout: Duration) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) | Err(_) => return events,
        }
        events.extend(self.drain());
        events
    }

    /// Everything queued right now, without waiting.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        events
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Process-wide notification multiplexer.
pub struct Notifier {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    /// Creates the OS watcher and starts the background loop.
    pub fn start(poll_timeout: Duration) -> Result<Self, WatchError> {
        let (tx, rx) = std_mpsc::channel();
        let watcher = RecommendedWatcher::new(tx, Config::default()).map_err(|e| {
            WatchError::Backend {
                path: PathBuf::new(),
                message: e.to_string(),
            }
        })?;

        let shared = Arc::new(Shared {
            table: Mutex::new(WatchTable {
                watcher: Some(watcher),
                ..Default::default()
            }),
            running: AtomicBool::new(true),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("scingest-notifier".to_string())
            .spawn(move || loop_shared.run(rx, poll_timeout))
            .map_err(|e| WatchError::Backend {
                path: PathBuf::new(),
                message: format!("failed to spawn notifier thread: {}", e),
            })?;

        info!("Notifier started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Registers `path`. Several registrations may share a directory.
    pub fn add_watch(&self, path: &Path, mode: WatchMode) -> Result<WatchHandle, WatchError> {
        if !self.running() {
            return Err(WatchError::Stopped);
        }
        let path = path
            .canonicalize()
            .map_err(|_| WatchError::NotFound(path.to_path_buf()))?;
        if !path.is_dir() {
            return Err(WatchError::NotFound(path));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.shared.table();
        if table.watcher.is_none() {
            return Err(WatchError::Stopped);
        }
        let id = table.next_id;
        table.next_id += 1;
        table.registrations.insert(
            id,
            Registration {
                path: path.clone(),
                mode,
                tx,
            },
        );

        let mut result = Ok(());
        for (failed, e) in table.reconcile() {
            if failed == path {
                result = Err(map_notify_error(&failed, e));
            } else {
                warn!("Failed to re-establish watch on {:?}: {}", failed, e);
            }
        }
        if let Err(e) = result {
            table.registrations.remove(&id);
            table.reconcile();
            return Err(e);
        }
        debug!("Registered watch {} on {:?} ({:?})", id, path, mode);

        Ok(WatchHandle {
            id,
            path,
            rx,
            shared: Arc::downgrade(&self.shared),
            closed: false,
        })
    }

    /// Unregisters a watch. Same as dropping the handle.
    pub fn remove_watch(&self, handle: WatchHandle) {
        drop(handle);
    }

    pub fn registration_count(&self) -> usize {
        self.shared.table().registrations.len()
    }

    /// Stops the background loop and releases every OS watch. Idempotent.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        {
            let mut table = self.shared.table();
            // Dropping the senders closes every consumer queue.
            table.registrations.clear();
            table.installed.clear();
            table.watcher = None;
        }

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("Notifier thread panicked");
            }
        }
        if was_running {
            info!("Notifier stopped");
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.stop();
    }
}
