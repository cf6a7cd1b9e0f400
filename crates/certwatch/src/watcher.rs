//! [`CertificateWatcher`]: keeps one TLS certificate pair hot.
//!
//! Composes a coalescing path watcher over the certificate and key files
//! and swaps the live [`CertifiedKey`](rustls::sign::CertifiedKey) on every
//! change event. A failed reload (corrupt PEM, mismatched key, file
//! mid-write) leaves the previous pair serving; once started, the resolver
//! always has something servable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_fswatch::{ChangeEvent, CoalescingWatcher, WatcherConfig};

use crate::error::{CertWatchError, Result};
use crate::pem::load_certified_key;
use crate::resolver::HotCertResolver;

/// Default window for merging bursts of file events into one reload. Secret
/// mounts and cert renewers tend to touch both files close together.
pub const DEFAULT_COALESCE_INTERVAL: Duration = Duration::from_secs(5);

struct Lifecycle {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    stopped: bool,
}

/// Watches a certificate/key pair on disk and republishes it through a
/// [`HotCertResolver`] on every change.
pub struct CertificateWatcher {
    cert_path: PathBuf,
    key_path: PathBuf,
    watcher: CoalescingWatcher,
    resolver: Arc<HotCertResolver>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for CertificateWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateWatcher")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl CertificateWatcher {
    /// Watch `cert_path` / `key_path`. Both files must exist; a nonexistent
    /// path is a construction error and no watcher is produced.
    pub fn new(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        coalesce_interval: Duration,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref().to_path_buf();
        let key_path = key_path.as_ref().to_path_buf();
        let watcher = CoalescingWatcher::new(
            &[&cert_path, &key_path],
            WatcherConfig::default(),
            coalesce_interval,
        )?;
        Ok(Self {
            cert_path,
            key_path,
            watcher,
            resolver: Arc::new(HotCertResolver::empty()),
            lifecycle: Mutex::new(Lifecycle {
                cancel: None,
                handle: None,
                stopped: false,
            }),
        })
    }

    /// Load the initial pair, start the underlying watcher, and spawn the
    /// reload loop.
    ///
    /// The initial load must succeed; there is no "running without a
    /// certificate" state. Returns the resolver handle, suitable for
    /// `rustls::ServerConfig`'s `with_cert_resolver`. A second call while
    /// running returns the same resolver and changes nothing.
    pub async fn start(&self, cancel: CancellationToken) -> Result<Arc<HotCertResolver>> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return Err(CertWatchError::Stopped);
        }
        if lifecycle.cancel.is_some() {
            return Ok(Arc::clone(&self.resolver));
        }

        let initial = load_certified_key(&self.cert_path, &self.key_path)?;
        self.resolver.publish(Arc::new(initial));
        info!(
            cert = %self.cert_path.display(),
            key = %self.key_path.display(),
            "loaded initial certificate"
        );

        let token = cancel.child_token();
        self.watcher.start(token.clone()).await;
        let events = match self.watcher.events() {
            Some(rx) => rx,
            // Unreachable while the inner watcher stays private; still a
            // typed error rather than a panic.
            None => {
                self.watcher.stop().await?;
                return Err(CertWatchError::Task(
                    "change event queue unavailable".to_string(),
                ));
            }
        };
        let handle = tokio::spawn(run_reload_loop(
            events,
            Arc::clone(&self.resolver),
            self.cert_path.clone(),
            self.key_path.clone(),
            token.clone(),
        ));
        lifecycle.cancel = Some(token);
        lifecycle.handle = Some(handle);
        Ok(Arc::clone(&self.resolver))
    }

    /// The live resolver handle. Fails with [`CertWatchError::NotStarted`]
    /// until a start has published a certificate.
    pub fn resolver(&self) -> Result<Arc<HotCertResolver>> {
        if !self.resolver.is_published() {
            return Err(CertWatchError::NotStarted);
        }
        Ok(Arc::clone(&self.resolver))
    }

    /// Stop the underlying watcher and wait for the reload loop to exit.
    /// Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return Ok(());
        }
        lifecycle.stopped = true;
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        self.watcher.stop().await?;
        if let Some(handle) = lifecycle.handle.take() {
            if let Err(e) = handle.await {
                return Err(CertWatchError::Task(e.to_string()));
            }
        }
        Ok(())
    }
}

impl Drop for CertificateWatcher {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Some(cancel) = &lifecycle.cancel {
                cancel.cancel();
            }
        }
    }
}

async fn run_reload_loop(
    mut events: mpsc::Receiver<ChangeEvent>,
    resolver: Arc<HotCertResolver>,
    cert_path: PathBuf,
    key_path: PathBuf,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("certificate reload loop cancelled");
                return;
            }
            maybe = events.recv() => match maybe {
                Some(event) => reload(&resolver, &cert_path, &key_path, &event),
                None => {
                    debug!("change event queue closed");
                    return;
                }
            },
        }
    }
}

fn reload(resolver: &HotCertResolver, cert_path: &Path, key_path: &Path, event: &ChangeEvent) {
    debug!(changed = event.paths.len(), "certificate reload triggered");
    match load_certified_key(cert_path, key_path) {
        Ok(certified) => {
            resolver.publish(Arc::new(certified));
            info!(cert = %cert_path.display(), "rotated live certificate");
        }
        Err(e) => {
            // Keep serving the previous pair; a later reload can recover.
            warn!(
                cert = %cert_path.display(),
                error = %e,
                "certificate reload failed, keeping previous certificate"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::testcert;

    const FAST_COALESCE: Duration = Duration::from_millis(100);

    fn write_pair(dir: &TempDir, name: &str) -> (PathBuf, PathBuf) {
        let pair = testcert::pair(&format!("{name}.example"));
        let cert_path = dir.path().join(format!("{name}-cert.pem"));
        let key_path = dir.path().join(format!("{name}-key.pem"));
        std::fs::write(&cert_path, &pair.cert_pem).unwrap();
        std::fs::write(&key_path, &pair.key_pem).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn construction_fails_for_missing_files() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("absent-cert.pem");
        let key = dir.path().join("absent-key.pem");
        let err = CertificateWatcher::new(&cert, &key, FAST_COALESCE).unwrap_err();
        match err {
            CertWatchError::Watch(vigil_fswatch::WatchError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn resolver_is_unavailable_before_start() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, "idle");
        let watcher = CertificateWatcher::new(&cert, &key, FAST_COALESCE).unwrap();
        assert!(matches!(
            watcher.resolver(),
            Err(CertWatchError::NotStarted)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_fails_on_unparseable_certificate() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, "bad");
        std::fs::write(&cert, "not pem at all").unwrap();

        let watcher = CertificateWatcher::new(&cert, &key, FAST_COALESCE).unwrap();
        let err = watcher.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CertWatchError::NoCertificates(_)));
        assert!(matches!(
            watcher.resolver(),
            Err(CertWatchError::NotStarted)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_publishes_initial_certificate_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, "initial");

        let watcher = CertificateWatcher::new(&cert, &key, FAST_COALESCE).unwrap();
        let token = CancellationToken::new();
        let resolver = watcher.start(token.clone()).await.unwrap();
        assert!(resolver.current().is_some());

        let again = watcher.start(token).await.unwrap();
        assert!(Arc::ptr_eq(&resolver, &again));

        watcher.stop().await.unwrap();
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_after_stop_fails_with_typed_error() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, "done");

        let watcher = CertificateWatcher::new(&cert, &key, FAST_COALESCE).unwrap();
        watcher.start(CancellationToken::new()).await.unwrap();
        watcher.stop().await.unwrap();

        // The queue is consumed and the inner watcher terminal; a restart
        // must fail with a typed error, never panic.
        let err = watcher.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CertWatchError::Stopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn corrupt_reload_keeps_previous_certificate() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, "stable");

        let watcher = CertificateWatcher::new(&cert, &key, FAST_COALESCE).unwrap();
        let resolver = watcher.start(CancellationToken::new()).await.unwrap();
        let before = resolver.current().unwrap();

        std::fs::write(&cert, "garbage, not a certificate").unwrap();
        // Long enough for the sweep to notice and a reload to be attempted.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let after = resolver.current().unwrap();
        assert_eq!(before.cert[0].as_ref(), after.cert[0].as_ref());

        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_never_observe_an_empty_certificate() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, "churn");

        let watcher = CertificateWatcher::new(&cert, &key, Duration::from_millis(50)).unwrap();
        let resolver = watcher.start(CancellationToken::new()).await.unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..100 {
            let resolver = Arc::clone(&resolver);
            let done = Arc::clone(&done);
            readers.push(tokio::spawn(async move {
                while !done.load(Ordering::Relaxed) {
                    let live = resolver
                        .current()
                        .expect("live certificate must never be empty");
                    assert!(!live.cert.is_empty());
                    tokio::task::yield_now().await;
                }
            }));
        }

        // Rotate the pair a few times underneath the readers.
        for round in 0..5 {
            let pair = testcert::pair(&format!("churn-{round}.example"));
            std::fs::write(&cert, &pair.cert_pem).unwrap();
            std::fs::write(&key, &pair.key_pem).unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        done.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.await.unwrap();
        }
        watcher.stop().await.unwrap();
    }
}
