// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP listeners serving the handler's router over HTTP/1.1 and HTTP/2,
//! optionally behind TLS.
//!
//! Each listener is an accept loop on its own task. [`Listener::kill`] stops
//! the loop from accepting and asks every open connection to shut down
//! gracefully; [`Listener::wait`] returns once the last one has finished.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::traits::{ListenerError, ListenerSpec, ListenerSupervisor, Protocol};

/// A running listener.
pub struct Listener {
    protocol: Protocol,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ListenerError>>,
}

impl Listener {
    /// Bind `spec.addr` and spawn the accept loop.
    pub async fn start(spec: ListenerSpec) -> Result<Self, ListenerError> {
        let ListenerSpec {
            protocol,
            addr,
            router,
            tls,
        } = spec;

        let acceptor = match (protocol, tls) {
            (Protocol::Https, Some(config)) => Some(TlsAcceptor::from(config)),
            (Protocol::Https, None) => return Err(ListenerError::MissingTls(protocol)),
            (Protocol::Http, _) => None,
        };

        let bind_error = |source| ListenerError::Bind {
            protocol,
            addr,
            source,
        };
        let tcp = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = tcp.local_addr().map_err(bind_error)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            protocol,
            local_addr,
            tcp,
            router,
            acceptor,
            shutdown_rx,
        ));

        info!(%protocol, addr = %local_addr, "listener started");

        Ok(Self {
            protocol,
            local_addr,
            shutdown,
            task,
        })
    }

    /// Protocol served.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept loop has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop accepting and start draining connections.
    pub fn kill(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the accept loop and every connection to finish.
    ///
    /// A loop ended by [`kill`](Self::kill) is a clean shutdown; only accept
    /// failures and panics are errors.
    pub async fn wait(self) -> Result<(), ListenerError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ListenerError::Panicked(self.protocol)),
            Err(_) => Ok(()),
        }
    }
}

// Errors of a single failed accept, not of the listening socket.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn accept_loop(
    protocol: Protocol,
    addr: SocketAddr,
    tcp: TcpListener,
    router: Router,
    acceptor: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ListenerError> {
    let connections = TaskTracker::new();

    let result = loop {
        let (stream, remote) = tokio::select! {
            biased;

            _ = shutdown.wait_for(|stop| *stop) => break Ok(()),

            accepted = tcp.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) if is_transient(&e) => {
                    debug!(%protocol, error = %e, "transient accept error");
                    continue;
                }
                Err(source) => break Err(ListenerError::Accept { protocol, addr, source }),
            },
        };

        debug!(%protocol, %remote, "accepted connection");

        let router = router.clone();
        let acceptor = acceptor.clone();
        let mut shutdown = shutdown.clone();

        connections.spawn(async move {
            match acceptor {
                None => serve_connection(stream, router, shutdown, remote).await,
                Some(acceptor) => {
                    let handshake = tokio::select! {
                        result = acceptor.accept(stream) => result,
                        _ = shutdown.wait_for(|stop| *stop) => return,
                    };
                    match handshake {
                        Ok(tls_stream) => {
                            serve_connection(tls_stream, router, shutdown, remote).await
                        }
                        Err(e) => debug!(%remote, error = %e, "TLS handshake failed"),
                    }
                }
            }
        });
    };

    drop(tcp);
    connections.close();
    if !connections.is_empty() {
        info!(%protocol, %addr, open = connections.len(), "draining connections");
    }
    connections.wait().await;

    if let Err(e) = &result {
        warn!(%protocol, %addr, error = %e, "listener failed");
    } else {
        info!(%protocol, %addr, "listener stopped");
    }
    result
}

async fn serve_connection<I>(
    io: I,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
    remote: SocketAddr,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn =
        builder.serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(router));
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%remote, error = %e, "connection closed with error");
                }
                break;
            }
            _ = shutdown.wait_for(|stop| *stop), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Supervisor of real TCP listeners.
#[derive(Default)]
pub struct TcpSupervisor {
    listeners: BTreeMap<Protocol, Listener>,
}

impl TcpSupervisor {
    /// Create a supervisor with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Address bound by the listener of `protocol`, if one is running.
    pub fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.listeners.get(&protocol).map(Listener::local_addr)
    }
}

#[async_trait]
impl ListenerSupervisor for TcpSupervisor {
    fn is_running(&self, protocol: Protocol) -> bool {
        self.listeners
            .get(&protocol)
            .is_some_and(|listener| !listener.is_finished())
    }

    fn running(&self) -> Vec<Protocol> {
        self.listeners.keys().copied().collect()
    }

    async fn start(&mut self, spec: ListenerSpec) -> Result<(), ListenerError> {
        if self.listeners.contains_key(&spec.protocol) {
            return Err(ListenerError::AlreadyRunning(spec.protocol));
        }
        let listener = Listener::start(spec).await?;
        self.listeners.insert(listener.protocol(), listener);
        Ok(())
    }

    async fn stop(&mut self, protocol: Protocol) -> Result<(), ListenerError> {
        match self.listeners.remove(&protocol) {
            Some(listener) => {
                listener.kill();
                listener.wait().await
            }
            None => Ok(()),
        }
    }

    async fn reap(&mut self) -> Vec<ListenerError> {
        let finished: Vec<Protocol> = self
            .listeners
            .iter()
            .filter(|(_, listener)| listener.is_finished())
            .map(|(protocol, _)| *protocol)
            .collect();

        let mut errors = Vec::new();
        for protocol in finished {
            if let Some(listener) = self.listeners.remove(&protocol)
                && let Err(e) = listener.wait().await
            {
                errors.push(e);
            }
        }
        errors
    }
}
