// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server side of the control channel.
//!
//! The server only owns the endpoint. Callers drive the accept loop
//! themselves with [`ControlServer::accept`], wrap each connection in a
//! [`ConnectionHandler`] and answer one call per [`StreamHandler`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::frame::{Frame, FrameError, read_frame, write_frame};

/// Errors that can occur in the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid transport setting: {0}")]
    Transport(String),
}

/// Transport settings of the control endpoint
#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    /// Maximum pending incoming connections (handshakes in progress)
    pub max_incoming: u32,
    /// Maximum concurrent calls per connection
    pub max_bi_streams: u32,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
}

impl Default for ControlServerConfig {
    fn default() -> Self {
        Self {
            max_incoming: 64,
            max_bi_streams: 16,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ControlServerConfig {
    /// Read the settings from the environment, falling back to defaults.
    ///
    /// - `STEWARD_CONTROL_MAX_INCOMING` (default: 64)
    /// - `STEWARD_CONTROL_MAX_BI_STREAMS` (default: 16)
    /// - `STEWARD_CONTROL_IDLE_TIMEOUT_MS` (default: 120000)
    /// - `STEWARD_CONTROL_KEEP_ALIVE_MS`, 0 disables (default: 15000)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_incoming: env_or("STEWARD_CONTROL_MAX_INCOMING", default.max_incoming),
            max_bi_streams: env_or("STEWARD_CONTROL_MAX_BI_STREAMS", default.max_bi_streams),
            idle_timeout_ms: env_or("STEWARD_CONTROL_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "STEWARD_CONTROL_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
        }
    }

    fn transport(&self) -> Result<TransportConfig, ServerError> {
        let idle_timeout = quinn::IdleTimeout::try_from(Duration::from_millis(self.idle_timeout_ms))
            .map_err(|e| ServerError::Transport(format!("idle timeout: {e}")))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(idle_timeout));
        transport.max_concurrent_bidi_streams(self.max_bi_streams.into());
        transport.max_concurrent_uni_streams(0u32.into());
        if self.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(self.keep_alive_interval_ms)));
        }
        Ok(transport)
    }
}

/// Build the QUIC server configuration from a PEM certificate chain and key.
fn server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    settings: &ControlServerConfig,
) -> Result<ServerConfig, ServerError> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

    let crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    let mut config = ServerConfig::with_crypto(Arc::new(quic_crypto));
    config.transport_config(Arc::new(settings.transport()?));
    config.max_incoming(settings.max_incoming as usize);
    Ok(config)
}

/// QUIC endpoint accepting control connections
pub struct ControlServer {
    endpoint: Endpoint,
}

impl ControlServer {
    /// Bind with the given certificate chain and key.
    pub fn bind(
        addr: SocketAddr,
        cert_pem: &[u8],
        key_pem: &[u8],
        settings: &ControlServerConfig,
    ) -> Result<Self, ServerError> {
        let endpoint = Endpoint::server(server_config(cert_pem, key_pem, settings)?, addr)?;
        info!(
            addr = %endpoint.local_addr()?,
            max_incoming = settings.max_incoming,
            max_bi_streams = settings.max_bi_streams,
            "control endpoint bound"
        );
        Ok(Self { endpoint })
    }

    /// Bind with a fresh self-signed certificate for `localhost`.
    pub fn localhost(addr: SocketAddr, settings: &ControlServerConfig) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        Self::bind(
            addr,
            cert.cert.pem().as_bytes(),
            cert.key_pair.serialize_pem().as_bytes(),
            settings,
        )
    }

    /// Accept the next incoming connection. `None` once closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Address the endpoint is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Close the endpoint and every connection on it
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }
}

/// One accepted control connection
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    /// Wrap an established connection.
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    /// Address of the peer
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Serve streams until the peer goes away, one task per stream
    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.connection.accept_bi().await {
                Ok((send, recv)) => {
                    tokio::spawn(handler.clone()(StreamHandler { send, recv }));
                }
                Err(
                    quinn::ConnectionError::ApplicationClosed(_)
                    | quinn::ConnectionError::LocallyClosed
                    | quinn::ConnectionError::TimedOut,
                ) => {
                    debug!("connection closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "connection lost");
                    break;
                }
            }
        }
    }
}

/// One call: a request frame in, a response frame out
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    /// Read the request frame
    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    /// Write the response frame
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        Ok(write_frame(&mut self.send, frame).await?)
    }

    /// Signal that the response is complete
    pub fn finish(&mut self) -> Result<(), ServerError> {
        self.send
            .finish()
            .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))
    }
}
