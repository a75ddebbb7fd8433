// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for steward-worker.
//!
//! This module provides [`WorkerRuntime`] which allows embedding the worker
//! into an existing tokio application instead of running the standalone
//! binary.
//!
//! ```rust,ignore
//! use steward_worker::runtime::WorkerRuntime;
//! use steward_worker::slots::SlotRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = WorkerRuntime::builder()
//!         .service(MyService)
//!         .registry(SlotRegistry::new().register(DbSlot))
//!         .control_addr("127.0.0.1:7400".parse()?)
//!         .state_dir("/var/lib/steward")
//!         .worker_id("edge-1")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use steward_protocol::server::{ControlServer, ControlServerConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::listener::{ListenerSupervisor, TcpSupervisor};
use crate::persistence::{FileStore, Persistence};
use crate::server::run_control_server;
use crate::service::{HandlerFactory, Service};
use crate::slots::SlotRegistry;

/// Builder for creating a [`WorkerRuntime`].
pub struct WorkerRuntimeBuilder {
    factory: Option<Arc<dyn HandlerFactory>>,
    registry: SlotRegistry,
    supervisor: Option<Box<dyn ListenerSupervisor>>,
    store: Option<Arc<dyn Persistence>>,
    config: Config,
    server_config: Option<ControlServerConfig>,
}

impl Default for WorkerRuntimeBuilder {
    fn default() -> Self {
        Self {
            factory: None,
            registry: SlotRegistry::new(),
            supervisor: None,
            store: None,
            config: Config::default(),
            server_config: None,
        }
    }
}

impl WorkerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler service (required).
    pub fn service<S: Service>(mut self, service: S) -> Self {
        self.factory = Some(Arc::new(service));
        self
    }

    /// Set an already erased handler factory (required unless
    /// [`service`](Self::service) is used).
    pub fn factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the slot registry.
    ///
    /// Default: empty
    pub fn registry(mut self, registry: SlotRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the listener supervisor.
    ///
    /// Default: [`TcpSupervisor`]
    pub fn supervisor(mut self, supervisor: Box<dyn ListenerSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Set the store for the applied state.
    ///
    /// Default: [`FileStore`] under `state_dir` / `worker_id`
    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace every address and path setting at once.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the control channel address.
    ///
    /// Default: `127.0.0.1:7400`
    pub fn control_addr(mut self, addr: SocketAddr) -> Self {
        self.config.control_addr = addr;
        self
    }

    /// Set the IP the HTTP and HTTPS listeners bind on.
    ///
    /// Default: `0.0.0.0`
    pub fn listen_ip(mut self, ip: IpAddr) -> Self {
        self.config.listen_ip = ip;
        self
    }

    /// Set the root of the per-worker state directories.
    ///
    /// Default: `.data`
    pub fn state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.state_dir = path.into();
        self
    }

    /// Set the worker identifier.
    ///
    /// Default: `default`
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    /// Set the control server transport configuration.
    ///
    /// Default: [`ControlServerConfig::from_env()`]
    pub fn server_config(mut self, config: ControlServerConfig) -> Self {
        self.server_config = Some(config);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if the service is missing or declares slots the
    /// registry cannot feed.
    pub fn build(self) -> Result<WorkerRuntimeConfig> {
        let factory = self
            .factory
            .ok_or_else(|| anyhow::anyhow!("service is required"))?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::new(
                &self.config.state_dir,
                &self.config.worker_id,
            )?),
        };
        let supervisor = self
            .supervisor
            .unwrap_or_else(|| Box::new(TcpSupervisor::new()) as Box<dyn ListenerSupervisor>);

        let engine = Engine::new(
            Arc::new(self.registry),
            factory,
            supervisor,
            store,
            self.config.listen_ip,
        )?;

        Ok(WorkerRuntimeConfig {
            engine: Arc::new(engine),
            control_addr: self.config.control_addr,
            server_config: self.server_config,
        })
    }
}

/// Configuration for a [`WorkerRuntime`].
pub struct WorkerRuntimeConfig {
    engine: Arc<Engine>,
    control_addr: SocketAddr,
    server_config: Option<ControlServerConfig>,
}

impl WorkerRuntimeConfig {
    /// Bind the control channel, restore the persisted state, then start
    /// serving calls.
    pub async fn start(self) -> Result<WorkerRuntime> {
        let server_config = self
            .server_config
            .unwrap_or_else(ControlServerConfig::from_env);
        let server = ControlServer::localhost(self.control_addr, &server_config)?;
        let control_addr = server.local_addr()?;

        match self.engine.restore().await {
            Ok(Some(feedback)) if feedback.is_empty() => info!("persisted state restored"),
            Ok(Some(feedback)) => warn!(
                warnings = feedback.warnings().len(),
                "persisted state restored with warnings"
            ),
            Ok(None) => debug!("no persisted state"),
            Err(e) => warn!(error = %e, "persisted state not restored, starting empty"),
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(run_control_server(
            server,
            self.engine.clone(),
            shutdown_rx,
        ));

        info!(%control_addr, "WorkerRuntime started");

        Ok(WorkerRuntime {
            server_handle,
            shutdown_tx,
            engine: self.engine,
            control_addr,
        })
    }
}

/// A running worker that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct WorkerRuntime {
    server_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    engine: Arc<Engine>,
    control_addr: SocketAddr,
}

impl WorkerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkerRuntimeBuilder {
        WorkerRuntimeBuilder::new()
    }

    /// Address the control channel is bound to.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// The reconciliation engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Check if the control server is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Gracefully shut down the worker.
    ///
    /// Stops the control server first, then closes the handler and drains
    /// every listener. The persisted record is left as it is.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkerRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);
        let server_result = match self.server_handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("control server task panicked: {}", e)),
        };

        let feedback = self.engine.shutdown().await;
        if !feedback.is_empty() {
            warn!(
                warnings = feedback.warnings().len(),
                "listeners stopped with warnings"
            );
        }

        match server_result {
            Ok(()) => {
                info!("WorkerRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("WorkerRuntime server error during shutdown: {}", e);
                Err(e)
            }
        }
    }
}
