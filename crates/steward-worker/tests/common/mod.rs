// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for steward-worker integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use serde::{Deserialize, Serialize};
use steward_worker::engine::Engine;
use steward_worker::listener::{MockEvent, MockHandle, MockSupervisor, Protocol};
use steward_worker::persistence::{FileStore, Persistence};
use steward_worker::service::{Handler, Service};
use steward_worker::slots::{Relations, Slot, SlotDecl, SlotOutcome, SlotRegistry};
use steward_worker::{BoxError, State};
use tempfile::TempDir;

/// Value of the `db` slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub dsn: String,
    pub fail: bool,
    pub panic: bool,
}

/// Slot kind standing in for a database connection: a new DSN replaces the
/// connection, so the handler holding the old one must be rebuilt.
pub struct DbSlot;

impl Slot for DbSlot {
    const KIND: &'static str = "db";
    type Value = DbConfig;
    type Held = String;

    fn produce(&self) -> Result<DbConfig, BoxError> {
        Ok(DbConfig {
            dsn: "postgres://localhost/app".to_string(),
            ..Default::default()
        })
    }

    fn apply(&self, held: &mut Option<String>, value: DbConfig) -> Result<SlotOutcome, BoxError> {
        if value.panic {
            panic!("db setter exploded");
        }
        if value.fail {
            return Err(format!("cannot connect to {}", value.dsn).into());
        }
        let outcome = match held {
            Some(current) if *current != value.dsn => SlotOutcome::RestartNeeded,
            _ => SlotOutcome::Applied,
        };
        *held = Some(value.dsn);
        Ok(outcome)
    }
}

/// Arguments of [`TestService`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TestArgs {
    pub fail_build: bool,
    pub panic_build: bool,
    pub tag: String,
}

/// Service that records builds and closes in the mock's event log.
pub struct TestService {
    pub handle: MockHandle,
}

struct TestHandler {
    handle: MockHandle,
    reply: String,
}

impl Service for TestService {
    type Args = Option<TestArgs>;

    fn slots(&self) -> Vec<SlotDecl> {
        vec![SlotDecl::of::<DbSlot>("db")]
    }

    fn build(&self, args: Self::Args, relations: &Relations) -> Result<Box<dyn Handler>, BoxError> {
        let args = args.unwrap_or_default();
        if args.panic_build {
            panic!("constructor exploded");
        }
        if args.fail_build {
            return Err("constructor refused".into());
        }
        let dsn = relations.get::<DbSlot>("db").ok_or("db not ready")?;
        self.handle.note("handler built");
        Ok(Box::new(TestHandler {
            handle: self.handle.clone(),
            reply: format!("{} via {}", args.tag, dsn),
        }))
    }
}

impl Handler for TestHandler {
    fn router(&self) -> Router {
        let reply = self.reply.clone();
        Router::new().route("/", get(move || async move { reply }))
    }

    fn close(&self) {
        self.handle.note("handler closed");
    }
}

pub fn registry() -> SlotRegistry {
    SlotRegistry::new().register(DbSlot)
}

/// An engine over a mock supervisor and a file store in a temp dir.
pub struct Fixture {
    pub engine: Engine,
    pub handle: MockHandle,
    pub store: Arc<FileStore>,
    pub dir: TempDir,
}

pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path(), "test-worker").unwrap());
    fixture_with_store(dir, store.clone(), store)
}

pub fn fixture_with_store(
    dir: TempDir,
    store: Arc<FileStore>,
    engine_store: Arc<dyn Persistence>,
) -> Fixture {
    let (supervisor, handle) = MockSupervisor::new();
    let engine = Engine::new(
        Arc::new(registry()),
        Arc::new(TestService {
            handle: handle.clone(),
        }),
        Box::new(supervisor),
        engine_store,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )
    .unwrap();
    Fixture {
        engine,
        handle,
        store,
        dir,
    }
}

pub fn db(dsn: &str) -> Vec<u8> {
    serde_json::to_vec(&DbConfig {
        dsn: dsn.to_string(),
        ..Default::default()
    })
    .unwrap()
}

/// A complete state serving HTTP on `http_port`.
pub fn http_state(http_port: u16, dsn: &str) -> State {
    State {
        http_port,
        slot_values: BTreeMap::from([("db".to_string(), db(dsn))]),
        ..Default::default()
    }
}

/// Self-signed certificate chain followed by its key.
pub fn cert_pem() -> Vec<u8> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    format!("{}{}", cert.cert.pem(), cert.key_pair.serialize_pem()).into_bytes()
}

pub fn started(protocol: Protocol, port: u16) -> MockEvent {
    MockEvent::Started { protocol, port }
}

pub fn stopped(protocol: Protocol, port: u16) -> MockEvent {
    MockEvent::Stopped { protocol, port }
}

pub fn note(text: &str) -> MockEvent {
    MockEvent::Note(text.to_string())
}
