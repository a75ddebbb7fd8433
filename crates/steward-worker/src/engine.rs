// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation engine.
//!
//! [`Engine::apply`] takes a complete [`State`] and brings the running server
//! in line with it. Calls are serialized by one lock held for the whole
//! reconciliation, so a partially applied state is never observable.
//!
//! One round:
//!
//! 1. Reap listeners that died on their own.
//! 2. If any declared slot has no value, the round is incomplete: nothing is
//!    torn down and nothing is built.
//! 3. A ready HTTPS side must carry a certificate that parses, otherwise the
//!    round stops here the same way.
//! 4. Feed every slot whose bytes changed to its setter.
//! 5. Decide the restart scope against the last applied state. A changed
//!    `arg_data`, a setter asking for a restart, or the HTTP port going to
//!    zero restart everything; a changed port or certificate restarts only
//!    that protocol's listener.
//! 6. Tear down: the handler is closed before its listeners are stopped.
//! 7. Build a handler if none is active, then start every ready protocol
//!    that has no listener.
//! 8. Record the state. It is persisted only once every ready protocol has
//!    a running listener.
//!
//! Problems in any step become warnings in the returned [`Feedback`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::listener::{ListenerSpec, ListenerSupervisor, Protocol, server_config_from_pem};
use crate::persistence::{Persistence, PersistenceError};
use crate::service::{HandlerFactory, HandlerInstance};
use crate::slots::{RegistryError, Relations, SlotDecl, SlotOutcome, SlotRegistry};
use crate::state::State;

/// Advisory result of an apply: warnings only, never a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feedback {
    warnings: Vec<String>,
}

impl Feedback {
    /// Add a warning and log it.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(warning = %message, "apply warning");
        self.warnings.push(message);
    }

    /// Whether no warnings were raised.
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Warnings, in the order they were raised.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Consume into the warning list.
    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }
}

/// The reconciliation engine.
pub struct Engine {
    inner: Mutex<Reconciler>,
}

struct Reconciler {
    registry: Arc<SlotRegistry>,
    factory: Arc<dyn HandlerFactory>,
    supervisor: Box<dyn ListenerSupervisor>,
    store: Arc<dyn Persistence>,
    listen_ip: IpAddr,
    decls: Vec<SlotDecl>,
    relations: Relations,
    handler: Option<HandlerInstance>,
    applied: Option<State>,
}

impl Engine {
    /// Create an engine.
    ///
    /// Fails if the service declares slots the registry cannot feed.
    pub fn new(
        registry: Arc<SlotRegistry>,
        factory: Arc<dyn HandlerFactory>,
        supervisor: Box<dyn ListenerSupervisor>,
        store: Arc<dyn Persistence>,
        listen_ip: IpAddr,
    ) -> Result<Self, RegistryError> {
        let decls = factory.declared_slots();
        registry.validate(&decls)?;
        let relations = Relations::new(&decls);

        Ok(Self {
            inner: Mutex::new(Reconciler {
                registry,
                factory,
                supervisor,
                store,
                listen_ip,
                decls,
                relations,
                handler: None,
                applied: None,
            }),
        })
    }

    /// Reconcile the running server with `state`.
    #[instrument(skip_all, fields(state = %state.fingerprint()))]
    pub async fn apply(&self, state: State) -> Feedback {
        let mut reconciler = self.inner.lock().await;
        reconciler.apply(state).await
    }

    /// The last recorded state.
    pub async fn applied_state(&self) -> Option<State> {
        self.inner.lock().await.applied.clone()
    }

    /// Protocols with a live listener.
    pub async fn running(&self) -> Vec<Protocol> {
        self.inner.lock().await.supervisor.running()
    }

    /// Whether a handler instance is active.
    pub async fn has_handler(&self) -> bool {
        self.inner.lock().await.handler.is_some()
    }

    /// Load the persisted state and apply it.
    ///
    /// Returns `None` when nothing was persisted.
    pub async fn restore(&self) -> Result<Option<Feedback>, PersistenceError> {
        let mut reconciler = self.inner.lock().await;
        let Some(state) = reconciler.store.load().await? else {
            return Ok(None);
        };
        info!(state = %state.fingerprint(), "restoring persisted state");
        Ok(Some(reconciler.apply(state).await))
    }

    /// Close the handler and stop every listener.
    ///
    /// The applied state is kept, so the next apply of the same state
    /// starts everything again.
    pub async fn shutdown(&self) -> Feedback {
        let mut reconciler = self.inner.lock().await;
        let mut feedback = Feedback::default();
        reconciler.teardown(&mut feedback).await;
        feedback
    }
}

impl Reconciler {
    async fn apply(&mut self, state: State) -> Feedback {
        let mut feedback = Feedback::default();

        for e in self.supervisor.reap().await {
            feedback.warn(format!("listener exited: {e}"));
        }

        let missing: Vec<String> = self
            .decls
            .iter()
            .filter(|decl| state.slot_value(&decl.name).is_none())
            .map(|decl| decl.name.clone())
            .collect();
        let complete = missing.is_empty();
        if !complete {
            info!(?missing, "slot values incomplete, keeping current configuration");
            return feedback;
        }

        // The certificate is checked before anything is fed or stopped.
        let tls = if state.https_ready() {
            match server_config_from_pem(&state.cert_pem) {
                Ok(config) => Some(config),
                Err(e) => {
                    feedback.warn(format!("https certificate rejected: {e}"));
                    return feedback;
                }
            }
        } else {
            None
        };

        let mut restart_needed = false;
        let mut setter_failed = false;
        for decl in &self.decls {
            let Some(data) = state.slot_value(&decl.name) else {
                continue;
            };
            let Some(provider) = self.registry.get(decl.kind) else {
                setter_failed = true;
                feedback.warn(format!("slot '{}': kind '{}' not registered", decl.name, decl.kind));
                continue;
            };
            match self.relations.feed(&decl.name, provider.as_ref(), data) {
                Ok(Some(SlotOutcome::RestartNeeded)) => {
                    info!(slot = %decl.name, "slot requires a handler restart");
                    restart_needed = true;
                }
                Ok(Some(SlotOutcome::Applied)) => debug!(slot = %decl.name, "slot updated"),
                Ok(None) => {}
                Err(e) => {
                    setter_failed = true;
                    feedback.warn(format!("slot '{}': {e}", decl.name));
                }
            }
        }
        let startable = !setter_failed;

        let (args_changed, http_disabled, http_changed, https_changed) = match &self.applied {
            Some(prev) => (
                prev.arg_data != state.arg_data,
                prev.http_port != 0 && state.http_port == 0,
                prev.http_port != state.http_port,
                prev.https_port != state.https_port || prev.cert_pem != state.cert_pem,
            ),
            None => (false, false, false, false),
        };
        let full_restart = restart_needed || args_changed || http_disabled;

        // A restart request tears down even when the round cannot start.
        if restart_needed || (startable && full_restart) {
            info!(
                restart_needed,
                args_changed, http_disabled, "restarting handler and listeners"
            );
            self.teardown(&mut feedback).await;
        } else if startable {
            if http_changed {
                self.stop_listener(Protocol::Http, &mut feedback).await;
            }
            if https_changed {
                self.stop_listener(Protocol::Https, &mut feedback).await;
            }
        }

        if !startable {
            return feedback;
        }

        let wanted: Vec<Protocol> = Protocol::ALL
            .into_iter()
            .filter(|protocol| match protocol {
                Protocol::Http => state.http_ready(),
                Protocol::Https => state.https_ready(),
            })
            .collect();

        if wanted.is_empty() {
            info!("no protocol configured, handler stopped");
            self.teardown(&mut feedback).await;
            self.record(state, true, &mut feedback).await;
            return feedback;
        }

        for protocol in self.supervisor.running() {
            if !wanted.contains(&protocol) {
                self.stop_listener(protocol, &mut feedback).await;
            }
        }

        if self.handler.is_none() {
            for e in self.supervisor.stop_all().await {
                feedback.warn(format!("listener stop failed: {e}"));
            }
            match HandlerInstance::build(self.factory.as_ref(), &state.arg_data, &self.relations) {
                Ok(instance) => {
                    info!("handler built");
                    self.handler = Some(instance);
                }
                Err(e) => {
                    feedback.warn(e.to_string());
                    return feedback;
                }
            }
        }
        let Some(router) = self.handler.as_ref().map(HandlerInstance::router) else {
            return feedback;
        };

        let mut all_running = true;
        for protocol in wanted {
            if self.supervisor.is_running(protocol) {
                continue;
            }
            let (port, tls) = match protocol {
                Protocol::Http => (state.http_port, None),
                Protocol::Https => (state.https_port, tls.clone()),
            };
            let spec = ListenerSpec {
                protocol,
                addr: SocketAddr::new(self.listen_ip, port),
                router: router.clone(),
                tls,
            };
            if let Err(e) = self.supervisor.start(spec).await {
                all_running = false;
                feedback.warn(e.to_string());
            }
        }

        // A listener that did not come up is retried on the next push, so the
        // state is kept in memory but the record stays at the last complete one.
        self.record(state, all_running, &mut feedback).await;
        feedback
    }

    async fn teardown(&mut self, feedback: &mut Feedback) {
        if let Some(handler) = self.handler.take() {
            if let Err(message) = handler.close() {
                feedback.warn(format!("handler close panicked: {message}"));
            }
            info!("handler closed");
        }
        for e in self.supervisor.stop_all().await {
            feedback.warn(format!("listener stop failed: {e}"));
        }
    }

    async fn stop_listener(&mut self, protocol: Protocol, feedback: &mut Feedback) {
        if !self.supervisor.running().contains(&protocol) {
            return;
        }
        info!(%protocol, "stopping listener");
        if let Err(e) = self.supervisor.stop(protocol).await {
            feedback.warn(format!("listener stop failed: {e}"));
        }
    }

    async fn record(&mut self, state: State, persist: bool, feedback: &mut Feedback) {
        let applied = self.applied.insert(state);
        if !persist {
            debug!("state not fully running, record left unchanged");
            return;
        }
        if let Err(e) = self.store.save(applied).await {
            feedback.warn(format!("state not persisted: {e}"));
        }
    }
}
