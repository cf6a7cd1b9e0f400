//! Hot-swap certificate resolver for rustls servers.

use std::fmt;
use std::sync::{Arc, RwLock};

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

/// Shared handle to the live certificate.
///
/// Handshakes read it through [`ResolvesServerCert`]; the reload loop swaps
/// it under the write lock. The lock is held only for the `Arc` clone or
/// the pointer swap, never across I/O or parsing, so concurrent handshakes
/// are only momentarily serialized against an in-progress reload.
pub struct HotCertResolver {
    live: RwLock<Option<Arc<CertifiedKey>>>,
}

impl HotCertResolver {
    pub(crate) fn empty() -> Self {
        Self {
            live: RwLock::new(None),
        }
    }

    /// The currently published certificate, if a load has succeeded.
    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.live
            .read()
            .expect("live certificate lock poisoned")
            .clone()
    }

    pub(crate) fn publish(&self, certified: Arc<CertifiedKey>) {
        *self.live.write().expect("live certificate lock poisoned") = Some(certified);
    }

    pub(crate) fn is_published(&self) -> bool {
        self.live
            .read()
            .expect("live certificate lock poisoned")
            .is_some()
    }
}

impl ResolvesServerCert for HotCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}

impl fmt::Debug for HotCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotCertResolver")
            .field("published", &self.is_published())
            .finish()
    }
}
