//! PEM loading and validation for the live certificate.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::InconsistentKeys;

use crate::error::{CertWatchError, Result};

/// Read a certificate chain and private key fresh from disk and build a
/// [`CertifiedKey`] that is known to be servable: a non-empty chain, a
/// parseable key, and the two consistent with each other.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    let chain = read_cert_chain(cert_path)?;
    let key = read_private_key(key_path)?;
    let signing_key = aws_lc_rs::sign::any_supported_type(&key)?;
    let certified = CertifiedKey::new(chain, signing_key);
    match certified.keys_match() {
        // An undeterminable match is accepted; a known mismatch is not.
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => Ok(certified),
        Err(e) => Err(CertWatchError::Tls(e)),
    }
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|source| CertWatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let chain = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|source| CertWatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(CertWatchError::NoCertificates(path.to_path_buf()));
    }
    Ok(chain)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|source| CertWatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| CertWatchError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertWatchError::NoPrivateKey(path.to_path_buf()))
}
