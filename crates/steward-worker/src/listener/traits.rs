// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listener supervisor trait definitions.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use thiserror::Error;

/// Network protocol a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// Plain HTTP.
    Http,
    /// TLS-terminated HTTP.
    Https,
}

impl Protocol {
    /// Every protocol, in start order.
    pub const ALL: [Protocol; 2] = [Protocol::Http, Protocol::Https];
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

/// Errors from listener operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ListenerError {
    /// The address could not be bound.
    #[error("{protocol} listener could not bind {addr}: {source}")]
    Bind {
        /// Protocol of the listener.
        protocol: Protocol,
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The accept loop stopped on a non-transient error.
    #[error("{protocol} listener on {addr} stopped accepting: {source}")]
    Accept {
        /// Protocol of the listener.
        protocol: Protocol,
        /// Bound address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// An HTTPS listener was requested without a TLS configuration.
    #[error("{0} listener requires a TLS configuration")]
    MissingTls(Protocol),

    /// A listener for this protocol is already running.
    #[error("{0} listener is already running")]
    AlreadyRunning(Protocol),

    /// The listener task panicked.
    #[error("{0} listener task panicked")]
    Panicked(Protocol),
}

/// What to start: a protocol, an address and the routes to serve.
#[derive(Clone)]
pub struct ListenerSpec {
    /// Protocol to serve.
    pub protocol: Protocol,
    /// Address to bind.
    pub addr: SocketAddr,
    /// Routes of the current handler instance.
    pub router: Router,
    /// TLS configuration, required for HTTPS.
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl fmt::Debug for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSpec")
            .field("protocol", &self.protocol)
            .field("addr", &self.addr)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// Owner of the running listeners.
///
/// At most one listener per protocol. Only the engine calls into a
/// supervisor, always under its lock.
#[async_trait]
pub trait ListenerSupervisor: Send + Sync {
    /// Whether a listener for `protocol` is up and accepting.
    fn is_running(&self, protocol: Protocol) -> bool;

    /// Protocols with a listener that has not been stopped or reaped.
    fn running(&self) -> Vec<Protocol>;

    /// Bind and start serving.
    async fn start(&mut self, spec: ListenerSpec) -> Result<(), ListenerError>;

    /// Kill a listener and wait until its connections have drained.
    /// Stopping an absent listener is a no-op.
    async fn stop(&mut self, protocol: Protocol) -> Result<(), ListenerError>;

    /// Collect listeners whose serve loop ended on its own.
    async fn reap(&mut self) -> Vec<ListenerError>;

    /// Stop every listener, in protocol order.
    async fn stop_all(&mut self) -> Vec<ListenerError> {
        let mut errors = Vec::new();
        for protocol in self.running() {
            if let Err(e) = self.stop(protocol).await {
                errors.push(e);
            }
        }
        errors
    }
}
