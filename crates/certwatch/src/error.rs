//! Error types for certificate watching.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur constructing, starting, or driving a
/// certificate watcher.
#[derive(Debug, Error)]
pub enum CertWatchError {
    /// Reading a PEM file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The certificate file held no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// The key file held no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// Key parsing, or a certificate/key mismatch.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The underlying path watcher failed.
    #[error("watcher error: {0}")]
    Watch(#[from] vigil_fswatch::WatchError),

    /// The accessor was requested before a successful start.
    #[error("certificate watcher has not been started")]
    NotStarted,

    /// Start was requested after a stop; the watcher is terminal.
    #[error("certificate watcher has been stopped")]
    Stopped,

    /// The reload loop terminated abnormally.
    #[error("reload task failed: {0}")]
    Task(String),
}

/// Result alias for certificate watcher operations.
pub type Result<T> = std::result::Result<T, CertWatchError>;
