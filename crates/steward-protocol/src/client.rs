// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client for pushing state to a steward worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::control_proto::{
    ApplyRequest, RpcRequest, RpcResponse, ServiceState, rpc_request, rpc_response,
};
use crate::frame::{Frame, FrameError, read_frame, write_frame};

/// Errors that can occur in the control client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("worker rejected call ({code}): {message}")]
    Rpc { code: String, message: String },

    #[error("unexpected response from worker")]
    UnexpectedResponse,
}

/// Configuration for the control client
#[derive(Debug, Clone)]
pub struct ControlClientConfig {
    /// Worker control address
    pub server_addr: SocketAddr,
    /// Server name for TLS verification
    pub server_name: String,
    /// Skip certificate verification (the local worker uses a self-signed certificate)
    pub dangerous_skip_cert_verification: bool,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ControlClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 120_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// QUIC client for the worker control channel
pub struct ControlClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    config: ControlClientConfig,
}

impl ControlClient {
    /// Create a new client with the given configuration
    pub fn new(config: ControlClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;

        let client_config = Self::build_client_config(&config)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            config,
        })
    }

    /// Create a client for a worker on this host
    pub fn localhost(server_addr: SocketAddr) -> Result<Self, ClientError> {
        Self::new(ControlClientConfig {
            server_addr,
            dangerous_skip_cert_verification: true,
            ..Default::default()
        })
    }

    fn build_client_config(config: &ControlClientConfig) -> Result<ClientConfig, ClientError> {
        let crypto = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        let idle_timeout =
            quinn::IdleTimeout::try_from(Duration::from_millis(config.idle_timeout_ms))
                .map_err(|e| ClientError::Tls(format!("idle timeout: {}", e)))?;
        transport.max_idle_timeout(Some(idle_timeout));

        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        let mut client_config = ClientConfig::new(Arc::new(quic_crypto));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Current connection, reconnecting if the previous one is gone
    #[instrument(skip(self), fields(addr = %self.config.server_addr))]
    async fn connection(&self) -> Result<Connection, ClientError> {
        let mut current = self.connection.lock().await;
        if let Some(conn) = current.as_ref()
            && conn.close_reason().is_none()
        {
            return Ok(conn.clone());
        }

        info!("connecting to worker");
        let connecting = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)?;
        let conn = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            connecting,
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        debug!(remote = %conn.remote_address(), "connected to worker");
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Push a complete state and return the worker's warnings.
    ///
    /// Each call runs on its own stream. A state the worker cannot accept at
    /// all (for example a port above 65535) comes back as
    /// [`ClientError::Rpc`].
    pub async fn apply(&self, state: ServiceState) -> Result<Vec<String>, ClientError> {
        let request = RpcRequest {
            request: Some(rpc_request::Request::Apply(ApplyRequest { state: Some(state) })),
        };

        let (mut send, mut recv) = self.connection().await?.open_bi().await?;
        write_frame(&mut send, &Frame::request(&request)?).await?;
        send.finish()?;
        let response: RpcResponse = read_frame(&mut recv).await?.decode_response()?;

        match response.response {
            Some(rpc_response::Response::Apply(apply)) => Ok(apply.warnings),
            Some(rpc_response::Response::Error(e)) => Err(ClientError::Rpc {
                code: e.code,
                message: e.message,
            }),
            None => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Close the connection gracefully
    pub async fn close(&self) {
        let mut conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.take() {
            conn.close(0u32.into(), b"client closing");
        }
    }

    /// Check if the client is currently connected
    pub async fn is_connected(&self) -> bool {
        let conn_guard = self.connection.lock().await;
        conn_guard
            .as_ref()
            .is_some_and(|conn| conn.close_reason().is_none())
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.connection.try_lock()
            && let Some(conn) = guard.take()
        {
            conn.close(0u32.into(), b"client dropped");
        }
    }
}

/// Certificate verifier that accepts any server certificate
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControlClientConfig::default();
        assert_eq!(config.server_addr, "127.0.0.1:7400".parse().unwrap());
        assert_eq!(config.server_name, "localhost");
        assert!(!config.dangerous_skip_cert_verification);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout(5000);
        assert_eq!(format!("{}", err), "connection timed out after 5000ms");

        let err = ClientError::Rpc {
            code: "INVALID_STATE".to_string(),
            message: "http_port 70000 out of range".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "worker rejected call (INVALID_STATE): http_port 70000 out of range"
        );
    }

    #[test]
    fn test_skip_server_verification_schemes() {
        use rustls::client::danger::ServerCertVerifier;
        let schemes = SkipServerVerification.supported_verify_schemes();
        assert!(schemes.contains(&rustls::SignatureScheme::ECDSA_NISTP256_SHA256));
        assert!(schemes.contains(&rustls::SignatureScheme::ED25519));
    }

    #[test]
    fn test_build_client_config_variants() {
        for skip in [true, false] {
            let config = ControlClientConfig {
                dangerous_skip_cert_verification: skip,
                keep_alive_interval_ms: 0,
                ..Default::default()
            };
            assert!(ControlClient::build_client_config(&config).is_ok());
        }
    }

    #[tokio::test]
    async fn test_client_initial_not_connected() {
        let client = ControlClient::localhost("127.0.0.1:7400".parse().unwrap()).unwrap();
        assert!(!client.is_connected().await);
        client.close().await;
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_apply_without_server_fails() {
        let client = ControlClient::new(ControlClientConfig {
            server_addr: "127.0.0.1:59994".parse().unwrap(),
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: 100,
            ..Default::default()
        })
        .unwrap();
        assert!(client.apply(ServiceState::default()).await.is_err());
    }
}
