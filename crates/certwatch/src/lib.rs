//! TLS certificate hot-reload on top of `vigil-fswatch`.
//!
//! [`CertificateWatcher`] tracks a PEM certificate/key pair on disk and
//! republishes it through a [`HotCertResolver`] whenever the files change.
//! A corrupt or half-written pair never replaces the live one: handshakes
//! keep getting the last known-good certificate.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tokio_util::sync::CancellationToken;
//! use vigil_certwatch::{CertificateWatcher, DEFAULT_COALESCE_INTERVAL};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let watcher = CertificateWatcher::new(
//!     "tls/server-cert.pem",
//!     "tls/server-key.pem",
//!     DEFAULT_COALESCE_INTERVAL,
//! )?;
//! let resolver = watcher.start(CancellationToken::new()).await?;
//!
//! let tls_config = rustls::ServerConfig::builder()
//!     .with_no_client_auth()
//!     .with_cert_resolver(resolver);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod pem;
pub mod resolver;
pub mod watcher;

pub use error::{CertWatchError, Result};
pub use pem::load_certified_key;
pub use resolver::HotCertResolver;
pub use watcher::{CertificateWatcher, DEFAULT_COALESCE_INTERVAL};

#[cfg(test)]
pub(crate) mod testcert {
    //! Self-signed PEM pairs for tests.

    pub(crate) struct TestPair {
        pub cert_pem: String,
        pub key_pem: String,
    }

    pub(crate) fn pair(host: &str) -> TestPair {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()])
            .expect("generate self-signed certificate");
        TestPair {
            cert_pem: cert.serialize_pem().expect("serialize certificate"),
            key_pem: cert.serialize_private_key_pem(),
        }
    }
}
