// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TLS configuration for HTTPS listeners.

use std::sync::Arc;

use thiserror::Error;

/// Errors turning PEM data into a TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The PEM data could not be read.
    #[error("invalid PEM data: {0}")]
    Pem(#[from] std::io::Error),

    /// No certificate block was found.
    #[error("no certificate found in PEM data")]
    NoCertificate,

    /// No private key block was found.
    #[error("no private key found in PEM data")]
    NoPrivateKey,

    /// The certificate and key do not form a usable pair.
    #[error("unusable certificate or key: {0}")]
    Config(#[from] rustls::Error),
}

/// Build a server configuration from a PEM certificate chain followed by
/// its private key. Advertises HTTP/2 and HTTP/1.1 over ALPN.
pub fn server_config_from_pem(pem: &[u8]) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let key = rustls_pemfile::private_key(&mut &pem[..])?.ok_or(TlsError::NoPrivateKey)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
