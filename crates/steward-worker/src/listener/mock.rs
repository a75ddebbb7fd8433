// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock supervisor for testing.
//!
//! Records every start and stop in call order without opening sockets.
//! A [`MockHandle`] shares the log with test code, which can also append
//! free-form notes (for example from a test handler's `close`) so that the
//! relative order of handler and listener events can be asserted.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::traits::*;

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)] // Fields are self-documenting from variant docs
pub enum MockEvent {
    /// A listener was started.
    Started { protocol: Protocol, port: u16 },
    /// A listener was stopped.
    Stopped { protocol: Protocol, port: u16 },
    /// A note added through [`MockHandle::note`].
    Note(String),
}

#[derive(Default)]
struct MockState {
    listeners: BTreeMap<Protocol, u16>,
    crashed: BTreeSet<Protocol>,
    fail_next: BTreeSet<Protocol>,
    events: Vec<MockEvent>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Listener supervisor that only records what it is asked to do.
pub struct MockSupervisor {
    state: Arc<Mutex<MockState>>,
}

/// Test-side view of a [`MockSupervisor`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockSupervisor {
    /// Create a supervisor and the handle observing it.
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockHandle { state },
        )
    }
}

impl MockHandle {
    /// Append a note to the event log.
    pub fn note(&self, note: impl Into<String>) {
        lock(&self.state).events.push(MockEvent::Note(note.into()));
    }

    /// Every event so far.
    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.state).events.clone()
    }

    /// Forget the recorded events.
    pub fn clear_events(&self) {
        lock(&self.state).events.clear();
    }

    /// Port of the running listener for `protocol`.
    pub fn port(&self, protocol: Protocol) -> Option<u16> {
        lock(&self.state).listeners.get(&protocol).copied()
    }

    /// Make the listener for `protocol` end on its own, as if its accept
    /// loop had failed. The next reap reports it.
    pub fn crash(&self, protocol: Protocol) {
        let mut state = lock(&self.state);
        if state.listeners.contains_key(&protocol) {
            state.crashed.insert(protocol);
        }
    }

    /// Make the next start of `protocol` fail to bind.
    pub fn fail_next_start(&self, protocol: Protocol) {
        lock(&self.state).fail_next.insert(protocol);
    }
}

fn addr_in_use(protocol: Protocol, spec: &ListenerSpec, reason: &str) -> ListenerError {
    ListenerError::Bind {
        protocol,
        addr: spec.addr,
        source: io::Error::new(io::ErrorKind::AddrInUse, reason.to_string()),
    }
}

#[async_trait]
impl ListenerSupervisor for MockSupervisor {
    fn is_running(&self, protocol: Protocol) -> bool {
        let state = lock(&self.state);
        state.listeners.contains_key(&protocol) && !state.crashed.contains(&protocol)
    }

    fn running(&self) -> Vec<Protocol> {
        lock(&self.state).listeners.keys().copied().collect()
    }

    async fn start(&mut self, spec: ListenerSpec) -> Result<(), ListenerError> {
        let protocol = spec.protocol;
        let port = spec.addr.port();
        let mut state = lock(&self.state);

        if state.fail_next.remove(&protocol) {
            return Err(addr_in_use(protocol, &spec, "simulated bind failure"));
        }
        if state.listeners.contains_key(&protocol) {
            return Err(ListenerError::AlreadyRunning(protocol));
        }
        if state.listeners.values().any(|bound| *bound == port) {
            return Err(addr_in_use(protocol, &spec, "port held by another listener"));
        }
        if protocol == Protocol::Https && spec.tls.is_none() {
            return Err(ListenerError::MissingTls(protocol));
        }

        state.listeners.insert(protocol, port);
        state.events.push(MockEvent::Started { protocol, port });
        Ok(())
    }

    async fn stop(&mut self, protocol: Protocol) -> Result<(), ListenerError> {
        let mut state = lock(&self.state);
        if let Some(port) = state.listeners.remove(&protocol) {
            state.crashed.remove(&protocol);
            state.events.push(MockEvent::Stopped { protocol, port });
        }
        Ok(())
    }

    async fn reap(&mut self) -> Vec<ListenerError> {
        let mut state = lock(&self.state);
        let crashed = std::mem::take(&mut state.crashed);
        let mut errors = Vec::new();
        for protocol in crashed {
            if let Some(port) = state.listeners.remove(&protocol) {
                errors.push(ListenerError::Accept {
                    protocol,
                    addr: ([127, 0, 0, 1], port).into(),
                    source: io::Error::other("simulated crash"),
                });
            }
        }
        errors
    }
}
