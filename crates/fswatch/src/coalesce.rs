//! [`CoalescingWatcher`]: a rate-limited wrapper around [`PathWatcher`].
//!
//! Consumers that do expensive work per change (certificate parsing, config
//! decoding) should not be stampeded by a burst of writes. This wrapper
//! accumulates the paths of inner events into a pending set and flushes one
//! merged event per coalesce interval.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, WatchError};
use crate::event::ChangeEvent;
use crate::watcher::{PathWatcher, WatcherConfig};

const CHANGE_EVENT_BUFFER: usize = 64;

struct Lifecycle {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    events_tx: Option<mpsc::Sender<ChangeEvent>>,
    stopped: bool,
}

/// A [`PathWatcher`] whose output is merged into at most one event per
/// coalesce interval. Same lifecycle and mutation surface as the inner
/// watcher.
pub struct CoalescingWatcher {
    inner: PathWatcher,
    coalesce_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
    events_rx: StdMutex<Option<mpsc::Receiver<ChangeEvent>>>,
}

impl CoalescingWatcher {
    pub fn new<P: AsRef<Path>>(
        paths: &[P],
        config: WatcherConfig,
        coalesce_interval: Duration,
    ) -> Result<Self> {
        let inner = PathWatcher::new(paths, config)?;
        let (events_tx, events_rx) = mpsc::channel(CHANGE_EVENT_BUFFER);
        Ok(Self {
            inner,
            coalesce_interval,
            lifecycle: Mutex::new(Lifecycle {
                cancel: None,
                handle: None,
                events_tx: Some(events_tx),
                stopped: false,
            }),
            events_rx: StdMutex::new(Some(events_rx)),
        })
    }

    pub fn add(&self, path: impl AsRef<Path>) -> Result<()> {
        self.inner.add(path)
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        self.inner.remove(path);
    }

    pub fn replace(&self, old: impl AsRef<Path>, new: impl AsRef<Path>) -> Result<()> {
        self.inner.replace(old, new)
    }

    /// Take the merged output queue. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::Receiver<ChangeEvent>> {
        self.events_rx
            .lock()
            .expect("events receiver lock poisoned")
            .take()
    }

    /// Start the inner watcher and the merge loop. Repeat calls are no-ops.
    pub async fn start(&self, cancel: CancellationToken) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.cancel.is_some() || lifecycle.stopped {
            return;
        }
        let Some(events_tx) = lifecycle.events_tx.take() else {
            return;
        };
        let token = cancel.child_token();
        self.inner.start(token.clone()).await;
        let Some(inner_rx) = self.inner.events() else {
            return;
        };
        let handle = tokio::spawn(run_merge_loop(
            inner_rx,
            events_tx,
            self.coalesce_interval,
            token.clone(),
        ));
        lifecycle.cancel = Some(token);
        lifecycle.handle = Some(handle);
    }

    /// Stop both loops; idempotent. The merged queue closes once the merge
    /// loop has exited.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return Ok(());
        }
        lifecycle.stopped = true;
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        let mut result = self.inner.stop().await;
        if let Some(handle) = lifecycle.handle.take() {
            if let Err(e) = handle.await {
                result = Err(WatchError::Task(e.to_string()));
            }
        }
        lifecycle.events_tx.take();
        result
    }
}

impl Drop for CoalescingWatcher {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Some(cancel) = &lifecycle.cancel {
                cancel.cancel();
            }
        }
    }
}

async fn run_merge_loop(
    mut inner_rx: mpsc::Receiver<ChangeEvent>,
    events_tx: mpsc::Sender<ChangeEvent>,
    coalesce_interval: Duration,
    cancel: CancellationToken,
) {
    // BTreeSet keeps merged events deterministic and deduplicated.
    let mut pending: BTreeSet<std::path::PathBuf> = BTreeSet::new();
    let mut tick = tokio::time::interval(coalesce_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("coalescing loop cancelled");
                return;
            }
            maybe = inner_rx.recv() => match maybe {
                Some(event) => pending.extend(event.paths),
                None => {
                    // Inner watcher stopped: flush the remainder and close.
                    if !pending.is_empty() {
                        let paths = pending.into_iter().collect();
                        let _ = events_tx.send(ChangeEvent { paths }).await;
                    }
                    return;
                }
            },
            _ = tick.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let paths = pending.iter().cloned().collect();
                pending.clear();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = events_tx.send(ChangeEvent { paths }) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_of_writes_merges_into_few_events() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("busy.txt");
        std::fs::write(&file, b"0").unwrap();

        let config = WatcherConfig {
            reconcile_interval: Duration::from_millis(50),
        };
        let watcher =
            CoalescingWatcher::new(&[&file], config, Duration::from_millis(300)).unwrap();
        let mut events = watcher.events().unwrap();
        watcher.start(CancellationToken::new()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..5 {
            std::fs::write(&file, format!("v{i}")).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        let first = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        let canonical = std::fs::canonicalize(&file).unwrap();
        assert_eq!(first.paths, vec![canonical]);

        // Five writes inside one window must not produce five events.
        let mut extra = 0;
        while let Ok(Some(_)) = timeout(Duration::from_millis(700), events.recv()).await {
            extra += 1;
        }
        assert!(extra <= 2, "expected coalescing, got {} extra events", extra);

        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_is_idempotent_and_closes_queue() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let watcher = CoalescingWatcher::new(
            &[&file],
            WatcherConfig::default(),
            Duration::from_millis(100),
        )
        .unwrap();
        let mut events = watcher.events().unwrap();
        watcher.start(CancellationToken::new()).await;
        watcher.stop().await.unwrap();
        watcher.stop().await.unwrap();

        loop {
            match events.try_recv() {
                Ok(_) => continue,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {
                    assert!(events.recv().await.is_none());
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn mutations_delegate_to_inner_watcher() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let watcher = CoalescingWatcher::new(
            &[&a],
            WatcherConfig::default(),
            Duration::from_millis(100),
        )
        .unwrap();
        watcher.replace(&a, &b).unwrap();
        watcher.add(&a).unwrap();
        watcher.remove(&b);
        assert!(matches!(
            watcher.replace(&b, &a),
            Err(WatchError::AlreadyTracked(_))
        ));
    }
}
