//! Core [`PathWatcher`]: native change notifications backed by a periodic
//! reconciliation sweep.
//!
//! Native events are a latency optimization only. The sweep re-stats every
//! tracked path and re-registers its OS watch on each tick, so a
//! notification lost to watch invalidation (the watched inode destroyed by
//! an atomic rename-over) is caught within one reconcile interval.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, SystemTime};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use walkdir::WalkDir;

use crate::error::{Result, WatchError};
use crate::event::{is_actionable, is_create, is_remove, is_rename, is_write, ChangeEvent};

/// Default interval between reconciliation sweeps.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_millis(200);

/// Buffer between the notify callback thread and the watcher loop. Overflow
/// is tolerable: a dropped native event is recovered by the next sweep.
const NATIVE_EVENT_BUFFER: usize = 256;

/// Buffer on the output queue read by the consumer.
const CHANGE_EVENT_BUFFER: usize = 64;

/// Tuning knobs for a [`PathWatcher`].
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// How often the reconciliation sweep runs.
    pub reconcile_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }
}

/// Bookkeeping for one tracked path. `mod_time == None` means unknown and
/// forces a change on the next sweep.
#[derive(Debug)]
struct TrackedPath {
    mod_time: Option<SystemTime>,
}

/// State shared between the public API and the background loop.
struct Shared {
    /// Canonical path -> bookkeeping. Written by mutations and sweeps, read
    /// by event classification.
    tracked: RwLock<HashMap<PathBuf, TrackedPath>>,
    /// OS watch handle. `None` once the watcher has been stopped; released
    /// only after the loop has fully exited.
    os_watcher: StdMutex<Option<RecommendedWatcher>>,
}

/// Outcome of matching a native event path against the tracked set.
enum Lookup {
    /// The event concerns this tracked entry (the path itself, or the
    /// tracked parent directory of the event path).
    Tracked(PathBuf),
    Untracked,
}

impl Shared {
    fn lookup(&self, path: &Path) -> Lookup {
        let tracked = self.tracked.read().expect("path set lock poisoned");
        if tracked.contains_key(path) {
            return Lookup::Tracked(path.to_path_buf());
        }
        // A file event can concern a tracked directory entry.
        if !path.is_dir() {
            if let Some(parent) = path.parent() {
                if tracked.contains_key(parent) {
                    return Lookup::Tracked(parent.to_path_buf());
                }
            }
        }
        Lookup::Untracked
    }

    /// Force the next sweep to treat `path` as changed.
    fn clear_mod_time(&self, path: &Path) {
        let mut tracked = self.tracked.write().expect("path set lock poisoned");
        if let Some(entry) = tracked.get_mut(path) {
            entry.mod_time = None;
        }
    }

    fn add_path(&self, path: &Path) -> Result<()> {
        let canonical = canonicalize_nonempty(path)?;
        trace!(path = %canonical.display(), "tracking path");
        let mut tracked = self.tracked.write().expect("path set lock poisoned");
        let mut guard = self.os_watcher.lock().expect("os watcher lock poisoned");
        let os_watcher = guard.as_mut().ok_or(WatchError::Stopped)?;
        os_watcher.watch(&canonical, RecursiveMode::NonRecursive)?;
        let mod_time = stat_mod_time(&canonical)?;
        tracked.insert(canonical, TrackedPath {
            mod_time: Some(mod_time),
        });
        Ok(())
    }

    fn remove_path(&self, path: &Path) {
        let key = normalize_lossy(path);
        trace!(path = %key.display(), "untracking path");
        self.tracked
            .write()
            .expect("path set lock poisoned")
            .remove(&key);
    }

    fn replace_path(&self, old: &Path, new: &Path) -> Result<()> {
        let old_key = normalize_lossy(old);
        let new_key = canonicalize_nonempty(new)?;
        if old_key == new_key {
            return Ok(());
        }
        let mut tracked = self.tracked.write().expect("path set lock poisoned");
        if tracked.contains_key(&new_key) {
            return Err(WatchError::AlreadyTracked(new_key));
        }
        let mut guard = self.os_watcher.lock().expect("os watcher lock poisoned");
        let os_watcher = guard.as_mut().ok_or(WatchError::Stopped)?;
        // The new watch goes in before the old entry comes out, all inside
        // one critical section, so a concurrent sweep never observes a
        // window where neither path is tracked.
        os_watcher.watch(&new_key, RecursiveMode::NonRecursive)?;
        let mod_time = stat_mod_time(&new_key)?;
        tracked.insert(new_key.clone(), TrackedPath {
            mod_time: Some(mod_time),
        });
        tracked.remove(&old_key);
        trace!(old = %old_key.display(), new = %new_key.display(), "replaced tracked path");
        Ok(())
    }

    /// One reconciliation sweep: re-stat everything, re-register every OS
    /// watch, and return the paths whose mod time moved.
    fn sweep(&self) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        let mut tracked = self.tracked.write().expect("path set lock poisoned");
        let mut guard = self.os_watcher.lock().expect("os watcher lock poisoned");
        let Some(os_watcher) = guard.as_mut() else {
            return changed;
        };
        for (path, entry) in tracked.iter_mut() {
            let mod_time = match stat_mod_time(path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to stat tracked path");
                    continue;
                }
            };
            // Idempotent, and restores a watch the OS silently dropped.
            if let Err(e) = os_watcher.watch(path, RecursiveMode::NonRecursive) {
                warn!(path = %path.display(), error = %e, "failed to re-register watch");
                continue;
            }
            if entry.mod_time != Some(mod_time) {
                trace!(path = %path.display(), "mod time changed");
                entry.mod_time = Some(mod_time);
                changed.push(path.clone());
            }
        }
        changed
    }
}

/// State owned by the lifecycle lock: start/stop bookkeeping plus the
/// channel halves handed to the loop on start.
struct Lifecycle {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    events_tx: Option<mpsc::Sender<ChangeEvent>>,
    native_rx: Option<mpsc::Receiver<notify::Event>>,
    stopped: bool,
}

/// Watches a set of filesystem paths and emits [`ChangeEvent`]s on an
/// output queue.
///
/// Create with [`PathWatcher::new`], take the queue with
/// [`PathWatcher::events`], then [`PathWatcher::start`]. The queue closes
/// exactly once, when the watcher stops.
pub struct PathWatcher {
    shared: Arc<Shared>,
    config: WatcherConfig,
    lifecycle: Mutex<Lifecycle>,
    events_rx: StdMutex<Option<mpsc::Receiver<ChangeEvent>>>,
}

impl std::fmt::Debug for PathWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathWatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PathWatcher {
    /// Create a watcher over `paths`.
    ///
    /// Every path is canonicalized (absolute, cleaned, symlinks resolved)
    /// and must exist: a failed stat or watch registration aborts
    /// construction. Duplicate paths are deduplicated.
    pub fn new<P: AsRef<Path>>(paths: &[P], config: WatcherConfig) -> Result<Self> {
        let (native_tx, native_rx) = mpsc::channel(NATIVE_EVENT_BUFFER);
        let os_watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                // A full buffer just drops the event; the sweep recovers it.
                Ok(event) => {
                    let _ = native_tx.try_send(event);
                }
                Err(e) => warn!(error = %e, "native watcher error"),
            },
        )?;

        let (events_tx, events_rx) = mpsc::channel(CHANGE_EVENT_BUFFER);
        let watcher = Self {
            shared: Arc::new(Shared {
                tracked: RwLock::new(HashMap::new()),
                os_watcher: StdMutex::new(Some(os_watcher)),
            }),
            config,
            lifecycle: Mutex::new(Lifecycle {
                cancel: None,
                handle: None,
                events_tx: Some(events_tx),
                native_rx: Some(native_rx),
                stopped: false,
            }),
            events_rx: StdMutex::new(Some(events_rx)),
        };
        for path in paths {
            watcher.add(path)?;
        }
        Ok(watcher)
    }

    /// Track an additional path. Registers the OS watch and records the
    /// current mod time; failures propagate to the caller.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<()> {
        self.shared.add_path(path.as_ref())
    }

    /// Stop tracking a path. Unknown paths are ignored.
    pub fn remove(&self, path: impl AsRef<Path>) {
        self.shared.remove_path(path.as_ref());
    }

    /// Atomically swap `old` for `new` in the tracked set.
    ///
    /// A no-op when both resolve to the same path. Fails with
    /// [`WatchError::AlreadyTracked`] when `new` is already tracked under
    /// its own entry.
    pub fn replace(&self, old: impl AsRef<Path>, new: impl AsRef<Path>) -> Result<()> {
        self.shared.replace_path(old.as_ref(), new.as_ref())
    }

    /// Take the output queue. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::Receiver<ChangeEvent>> {
        self.events_rx
            .lock()
            .expect("events receiver lock poisoned")
            .take()
    }

    /// Spawn the background loop. Calling `start` again while running (or
    /// after a stop) is a no-op.
    pub async fn start(&self, cancel: CancellationToken) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.cancel.is_some() || lifecycle.stopped {
            return;
        }
        let (Some(events_tx), Some(native_rx)) =
            (lifecycle.events_tx.take(), lifecycle.native_rx.take())
        else {
            return;
        };
        let token = cancel.child_token();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.shared),
            native_rx,
            events_tx,
            self.config.reconcile_interval,
            token.clone(),
        ));
        lifecycle.cancel = Some(token);
        lifecycle.handle = Some(handle);
    }

    /// Stop the watcher: cancel the loop, wait for it to fully exit, then
    /// release the OS watch handle and close the output queue. Idempotent;
    /// succeeds even if the watcher was never started.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return Ok(());
        }
        lifecycle.stopped = true;
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        let mut result = Ok(());
        if let Some(handle) = lifecycle.handle.take() {
            if let Err(e) = handle.await {
                result = Err(WatchError::Task(e.to_string()));
            }
        }
        // If the loop never ran, dropping the sender here closes the queue.
        lifecycle.events_tx.take();
        lifecycle.native_rx.take();
        // The loop is gone; the OS handle can be released safely.
        self.shared
            .os_watcher
            .lock()
            .expect("os watcher lock poisoned")
            .take();
        result
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        // Best effort: a dropped watcher should not leave its loop running.
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Some(cancel) = &lifecycle.cancel {
                cancel.cancel();
            }
        }
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut native_rx: mpsc::Receiver<notify::Event>,
    events_tx: mpsc::Sender<ChangeEvent>,
    reconcile_interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(reconcile_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("path watcher loop cancelled");
                return;
            }
            maybe = native_rx.recv() => match maybe {
                Some(event) => handle_native_event(&shared, event, &events_tx, &cancel).await,
                None => {
                    error!("native event channel closed");
                    return;
                }
            },
            _ = tick.tick() => reconcile(&shared, &events_tx, &cancel).await,
        }
    }
}

async fn handle_native_event(
    shared: &Shared,
    event: notify::Event,
    events_tx: &mpsc::Sender<ChangeEvent>,
    cancel: &CancellationToken,
) {
    if !is_actionable(&event.kind) {
        return;
    }
    trace!(kind = ?event.kind, paths = ?event.paths, "native event");
    for raw in &event.paths {
        let path = normalize_lossy(raw);
        match shared.lookup(&path) {
            Lookup::Untracked => {
                // A new directory under a tracked ancestor: pick up the
                // files beneath it so an atomic swap is not missed.
                if path.is_dir() {
                    register_subtree(shared, &path);
                }
            }
            Lookup::Tracked(entry_key) => {
                if is_remove(&event.kind) {
                    // The watched inode may be gone. Re-stat immediately:
                    // the sweep re-registers the watch on the replacement
                    // file and emits the change.
                    shared.clear_mod_time(&entry_key);
                    reconcile(shared, events_tx, cancel).await;
                }
                if is_create(&event.kind) || is_write(&event.kind) || is_rename(&event.kind) {
                    publish(events_tx, cancel, ChangeEvent::single(path.clone())).await;
                }
            }
        }
    }
}

fn register_subtree(shared: &Shared, dir: &Path) {
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            if let Err(e) = shared.add_path(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "failed to register discovered file");
            }
        }
    }
}

async fn reconcile(
    shared: &Shared,
    events_tx: &mpsc::Sender<ChangeEvent>,
    cancel: &CancellationToken,
) {
    let changed = shared.sweep();
    if changed.is_empty() {
        return;
    }
    publish(events_tx, cancel, ChangeEvent { paths: changed }).await;
}

/// Send an event, never blocking past cancellation.
async fn publish(
    events_tx: &mpsc::Sender<ChangeEvent>,
    cancel: &CancellationToken,
    event: ChangeEvent,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        res = events_tx.send(event) => {
            if res.is_err() {
                debug!("change event receiver dropped");
            }
        }
    }
}

fn canonicalize_nonempty(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(WatchError::EmptyPath);
    }
    Ok(fs::canonicalize(path)?)
}

/// Canonical form if the path still resolves, otherwise the path as given.
/// Used for lookups that must work after the file is gone.
fn normalize_lossy(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn stat_mod_time(path: &Path) -> std::io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}
