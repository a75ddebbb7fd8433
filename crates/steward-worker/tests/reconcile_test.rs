// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation tests against the recording mock supervisor.

mod common;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use common::*;
use steward_worker::engine::Engine;
use steward_worker::listener::{MockEvent, MockHandle, MockSupervisor, Protocol};
use steward_worker::persistence::{Persistence, PersistenceError};
use steward_worker::service::{Handler, Service};
use steward_worker::slots::{RegistryError, Relations, SlotDecl, SlotRegistry};
use steward_worker::{BoxError, State};

fn tls_state(http_port: u16, https_port: u16, cert: &[u8]) -> State {
    State {
        https_port,
        cert_pem: cert.to_vec(),
        ..http_state(http_port, "postgres://a")
    }
}

fn with_args(mut state: State, args: &str) -> State {
    state.arg_data = args.as_bytes().to_vec();
    state
}

#[tokio::test]
async fn test_first_apply_builds_and_starts() {
    let f = fixture();
    let state = http_state(8080, "postgres://a");

    let feedback = f.engine.apply(state.clone()).await;

    assert!(feedback.is_empty(), "{:?}", feedback);
    assert_eq!(
        f.handle.events(),
        vec![note("handler built"), started(Protocol::Http, 8080)]
    );
    assert_eq!(f.engine.applied_state().await, Some(state.clone()));
    assert_eq!(f.store.load().await.unwrap(), Some(state));
}

#[tokio::test]
async fn test_same_state_twice_is_a_no_op() {
    let f = fixture();
    let state = http_state(8080, "postgres://a");
    f.engine.apply(state.clone()).await;
    f.handle.clear_events();

    let feedback = f.engine.apply(state).await;

    assert!(feedback.is_empty());
    assert!(f.handle.events().is_empty());
    assert_eq!(f.engine.running().await, vec![Protocol::Http]);
}

#[tokio::test]
async fn test_incomplete_state_keeps_serving() {
    let f = fixture();
    let good = http_state(8080, "postgres://a");
    f.engine.apply(good.clone()).await;
    f.handle.clear_events();

    let mut incomplete = http_state(9090, "postgres://a");
    incomplete.slot_values.insert("db".to_string(), Vec::new());
    incomplete.arg_data = br#"{"tag":"new"}"#.to_vec();
    let feedback = f.engine.apply(incomplete).await;

    assert!(feedback.is_empty());
    assert!(f.handle.events().is_empty());
    assert!(f.engine.has_handler().await);
    assert_eq!(f.engine.applied_state().await, Some(good));
}

#[tokio::test]
async fn test_incomplete_first_state_builds_nothing() {
    let f = fixture();
    let mut state = http_state(8080, "postgres://a");
    state.slot_values.clear();

    let feedback = f.engine.apply(state).await;

    assert!(feedback.is_empty());
    assert!(f.handle.events().is_empty());
    assert!(!f.engine.has_handler().await);
    assert!(f.engine.applied_state().await.is_none());
    assert_eq!(f.store.load().await.unwrap(), None);
}

#[tokio::test]
async fn test_https_change_leaves_http_running() {
    let f = fixture();
    let cert = cert_pem();
    f.engine.apply(tls_state(8080, 8443, &cert)).await;
    assert_eq!(
        f.handle.events(),
        vec![
            note("handler built"),
            started(Protocol::Http, 8080),
            started(Protocol::Https, 8443),
        ]
    );
    f.handle.clear_events();

    let feedback = f.engine.apply(tls_state(8080, 9443, &cert)).await;

    assert!(feedback.is_empty(), "{:?}", feedback);
    assert_eq!(
        f.handle.events(),
        vec![stopped(Protocol::Https, 8443), started(Protocol::Https, 9443)]
    );
}

#[tokio::test]
async fn test_http_port_change_restarts_only_http() {
    let f = fixture();
    f.engine.apply(http_state(8080, "postgres://a")).await;
    f.handle.clear_events();

    f.engine.apply(http_state(8081, "postgres://a")).await;

    assert_eq!(
        f.handle.events(),
        vec![stopped(Protocol::Http, 8080), started(Protocol::Http, 8081)]
    );
    assert!(f.engine.has_handler().await);
}

#[tokio::test]
async fn test_restart_needed_rebuilds_in_order() {
    let f = fixture();
    f.engine.apply(http_state(8080, "postgres://a")).await;
    f.handle.clear_events();

    let second = http_state(8080, "postgres://b");
    let feedback = f.engine.apply(second.clone()).await;

    assert!(feedback.is_empty(), "{:?}", feedback);
    assert_eq!(
        f.handle.events(),
        vec![
            note("handler closed"),
            stopped(Protocol::Http, 8080),
            note("handler built"),
            started(Protocol::Http, 8080),
        ]
    );

    f.handle.clear_events();
    assert!(f.engine.apply(second).await.is_empty());
    assert!(f.handle.events().is_empty());
}

#[tokio::test]
async fn test_https_without_certificate_is_not_an_error() {
    let f = fixture();

    let feedback = f.engine.apply(tls_state(8080, 8443, b"")).await;

    assert!(feedback.is_empty());
    assert_eq!(
        f.handle.events(),
        vec![note("handler built"), started(Protocol::Http, 8080)]
    );
}

#[tokio::test]
async fn test_bad_certificate_is_a_warning() {
    let f = fixture();

    let feedback = f
        .engine
        .apply(tls_state(8080, 8443, b"-----BEGIN NOTHING-----"))
        .await;

    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("certificate"));
    assert!(f.engine.running().await.is_empty());
    assert_eq!(f.engine.applied_state().await, None);
    assert_eq!(f.store.load().await.unwrap(), None);
}

#[tokio::test]
async fn test_bad_certificate_keeps_serving_the_good_one() {
    let f = fixture();
    let good = tls_state(8080, 8443, &cert_pem());
    assert!(f.engine.apply(good.clone()).await.is_empty());
    assert_eq!(f.engine.running().await, vec![Protocol::Http, Protocol::Https]);
    f.handle.clear_events();

    let feedback = f
        .engine
        .apply(tls_state(8080, 8443, b"-----BEGIN NOTHING-----"))
        .await;

    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("certificate"));
    assert_eq!(f.engine.running().await, vec![Protocol::Http, Protocol::Https]);
    assert!(
        !f.handle
            .events()
            .iter()
            .any(|e| matches!(e, MockEvent::Stopped { .. })),
        "{:?}",
        f.handle.events()
    );
    assert_eq!(f.engine.applied_state().await, Some(good.clone()));
    assert_eq!(f.store.load().await.unwrap(), Some(good));
}

#[tokio::test]
async fn test_setter_error_keeps_running_server() {
    let f = fixture();
    let good = http_state(8080, "postgres://a");
    f.engine.apply(good.clone()).await;
    f.handle.clear_events();

    let mut bad = good.clone();
    bad.slot_values.insert(
        "db".to_string(),
        br#"{"dsn":"postgres://down","fail":true}"#.to_vec(),
    );
    let feedback = f.engine.apply(bad).await;

    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("cannot connect to postgres://down"));
    assert!(f.handle.events().is_empty());
    assert!(f.engine.has_handler().await);
    assert_eq!(f.engine.applied_state().await, Some(good));
}

#[tokio::test]
async fn test_setter_panic_becomes_warning() {
    let f = fixture();
    let good = http_state(8080, "postgres://a");
    f.engine.apply(good.clone()).await;
    f.handle.clear_events();

    let mut bad = good.clone();
    bad.slot_values
        .insert("db".to_string(), br#"{"dsn":"x","panic":true}"#.to_vec());
    let feedback = f.engine.apply(bad).await;

    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("db setter exploded"));
    assert!(f.handle.events().is_empty());
    assert!(f.engine.has_handler().await);
}

#[tokio::test]
async fn test_malformed_slot_value_is_a_warning() {
    let f = fixture();
    let mut state = http_state(8080, "postgres://a");
    state
        .slot_values
        .insert("db".to_string(), b"not json".to_vec());

    let feedback = f.engine.apply(state).await;

    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("invalid value"));
    assert!(!f.engine.has_handler().await);
}

#[tokio::test]
async fn test_build_failure_opens_no_listener() {
    let f = fixture();

    let feedback = f
        .engine
        .apply(with_args(
            http_state(8080, "postgres://a"),
            r#"{"fail_build":true}"#,
        ))
        .await;
    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("constructor refused"));

    let feedback = f
        .engine
        .apply(with_args(
            http_state(8080, "postgres://a"),
            r#"{"panic_build":true}"#,
        ))
        .await;
    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("constructor exploded"));

    let feedback = f
        .engine
        .apply(with_args(http_state(8080, "postgres://a"), "not json"))
        .await;
    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("invalid handler arguments"));

    assert!(f.handle.events().is_empty());
    assert!(f.engine.applied_state().await.is_none());
}

#[tokio::test]
async fn test_failed_rebuild_then_recovery() {
    let f = fixture();
    let good = http_state(8080, "postgres://a");
    f.engine.apply(good.clone()).await;
    f.handle.clear_events();

    let feedback = f
        .engine
        .apply(with_args(good.clone(), r#"{"fail_build":true}"#))
        .await;
    assert_eq!(feedback.warnings().len(), 1);
    assert_eq!(
        f.handle.events(),
        vec![note("handler closed"), stopped(Protocol::Http, 8080)]
    );
    assert!(f.engine.running().await.is_empty());
    assert_eq!(f.engine.applied_state().await, Some(good.clone()));

    f.handle.clear_events();
    assert!(f.engine.apply(good).await.is_empty());
    assert_eq!(
        f.handle.events(),
        vec![note("handler built"), started(Protocol::Http, 8080)]
    );
}

#[tokio::test]
async fn test_args_change_restarts_everything() {
    let f = fixture();
    let cert = cert_pem();
    f.engine
        .apply(with_args(tls_state(8080, 8443, &cert), r#"{"tag":"one"}"#))
        .await;
    f.handle.clear_events();

    f.engine
        .apply(with_args(tls_state(8080, 8443, &cert), r#"{"tag":"two"}"#))
        .await;

    assert_eq!(
        f.handle.events(),
        vec![
            note("handler closed"),
            stopped(Protocol::Http, 8080),
            stopped(Protocol::Https, 8443),
            note("handler built"),
            started(Protocol::Http, 8080),
            started(Protocol::Https, 8443),
        ]
    );
}

#[tokio::test]
async fn test_http_port_zero_forces_full_restart() {
    let f = fixture();
    let cert = cert_pem();
    f.engine.apply(tls_state(8080, 8443, &cert)).await;
    f.handle.clear_events();

    f.engine.apply(tls_state(0, 8443, &cert)).await;

    assert_eq!(
        f.handle.events(),
        vec![
            note("handler closed"),
            stopped(Protocol::Http, 8080),
            stopped(Protocol::Https, 8443),
            note("handler built"),
            started(Protocol::Https, 8443),
        ]
    );
}

#[tokio::test]
async fn test_no_protocol_ready_closes_handler() {
    let f = fixture();
    f.engine.apply(http_state(8080, "postgres://a")).await;
    f.handle.clear_events();

    let idle = http_state(0, "postgres://a");
    let feedback = f.engine.apply(idle.clone()).await;

    assert!(feedback.is_empty());
    assert_eq!(
        f.handle.events(),
        vec![note("handler closed"), stopped(Protocol::Http, 8080)]
    );
    assert!(!f.engine.has_handler().await);
    assert_eq!(f.engine.applied_state().await, Some(idle));

    f.handle.clear_events();
    f.engine.apply(http_state(8080, "postgres://a")).await;
    assert_eq!(
        f.handle.events(),
        vec![note("handler built"), started(Protocol::Http, 8080)]
    );
}

#[tokio::test]
async fn test_start_failure_is_retried_on_next_push() {
    let f = fixture();
    let state = http_state(8080, "postgres://a");
    f.handle.fail_next_start(Protocol::Http);

    let feedback = f.engine.apply(state.clone()).await;
    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("could not bind"));
    assert_eq!(f.handle.events(), vec![note("handler built")]);
    assert_eq!(f.engine.applied_state().await, Some(state.clone()));
    assert_eq!(f.store.load().await.unwrap(), None);

    f.handle.clear_events();
    assert!(f.engine.apply(state.clone()).await.is_empty());
    assert_eq!(f.handle.events(), vec![started(Protocol::Http, 8080)]);
    assert_eq!(f.store.load().await.unwrap(), Some(state));
}

#[tokio::test]
async fn test_crashed_listener_is_reaped_and_restarted() {
    let f = fixture();
    let state = http_state(8080, "postgres://a");
    f.engine.apply(state.clone()).await;
    f.handle.clear_events();

    f.handle.crash(Protocol::Http);
    let feedback = f.engine.apply(state).await;

    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("listener exited"));
    assert_eq!(f.handle.events(), vec![started(Protocol::Http, 8080)]);
}

struct FailingStore;

#[async_trait]
impl Persistence for FailingStore {
    async fn load(&self) -> Result<Option<State>, PersistenceError> {
        Ok(None)
    }

    async fn save(&self, _state: &State) -> Result<(), PersistenceError> {
        Err(PersistenceError::Io {
            path: PathBuf::from("/read-only/state.json"),
            source: std::io::Error::other("disk full"),
        })
    }
}

#[tokio::test]
async fn test_save_failure_keeps_server_and_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(steward_worker::persistence::FileStore::new(dir.path(), "w").unwrap());
    let f = fixture_with_store(dir, store, Arc::new(FailingStore));
    let state = http_state(8080, "postgres://a");

    let feedback = f.engine.apply(state.clone()).await;

    assert_eq!(feedback.warnings().len(), 1);
    assert!(feedback.warnings()[0].contains("disk full"));
    assert_eq!(f.engine.running().await, vec![Protocol::Http]);
    assert_eq!(f.engine.applied_state().await, Some(state));
}

#[tokio::test]
async fn test_restore_applies_persisted_state() {
    let f = fixture();
    let state = tls_state(8080, 8443, &cert_pem());
    f.engine.apply(state.clone()).await;

    let (supervisor, handle) = MockSupervisor::new();
    let restarted = Engine::new(
        Arc::new(registry()),
        Arc::new(TestService {
            handle: handle.clone(),
        }),
        Box::new(supervisor),
        f.store.clone(),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )
    .unwrap();

    let feedback = restarted.restore().await.unwrap().unwrap();

    assert!(feedback.is_empty(), "{:?}", feedback);
    assert_eq!(restarted.applied_state().await, Some(state));
    assert_eq!(
        handle.events(),
        vec![
            note("handler built"),
            started(Protocol::Http, 8080),
            started(Protocol::Https, 8443),
        ]
    );
}

#[tokio::test]
async fn test_restore_without_record() {
    let f = fixture();
    assert!(f.engine.restore().await.unwrap().is_none());
    assert!(f.handle.events().is_empty());
}

#[tokio::test]
async fn test_shutdown_then_reapply() {
    let f = fixture();
    let state = http_state(8080, "postgres://a");
    f.engine.apply(state.clone()).await;
    f.handle.clear_events();

    assert!(f.engine.shutdown().await.is_empty());
    assert_eq!(
        f.handle.events(),
        vec![note("handler closed"), stopped(Protocol::Http, 8080)]
    );

    f.handle.clear_events();
    f.engine.apply(state).await;
    assert_eq!(
        f.handle.events(),
        vec![note("handler built"), started(Protocol::Http, 8080)]
    );
}

#[test]
fn test_unregistered_slot_kind_fails_at_construction() {
    let (supervisor, handle) = MockSupervisor::new();
    let dir = tempfile::tempdir().unwrap();
    let result = Engine::new(
        Arc::new(SlotRegistry::new()),
        Arc::new(TestService { handle }),
        Box::new(supervisor),
        Arc::new(steward_worker::persistence::FileStore::new(dir.path(), "w").unwrap()),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    );
    assert!(matches!(
        result,
        Err(RegistryError::UnknownKind { kind: "db", .. })
    ));
}

/// Service with two slots of the same kind.
struct PairService {
    handle: MockHandle,
}

struct PairHandler;

impl Handler for PairHandler {
    fn router(&self) -> Router {
        Router::new()
    }
}

impl Service for PairService {
    type Args = ();

    fn slots(&self) -> Vec<SlotDecl> {
        vec![
            SlotDecl::of::<DbSlot>("primary"),
            SlotDecl::of::<DbSlot>("replica"),
        ]
    }

    fn build(&self, _: (), _: &Relations) -> Result<Box<dyn Handler>, BoxError> {
        self.handle.note("handler built");
        Ok(Box::new(PairHandler))
    }
}

fn pair_state(primary: &[u8], replica: &[u8]) -> State {
    State {
        http_port: 8080,
        slot_values: BTreeMap::from([
            ("primary".to_string(), primary.to_vec()),
            ("replica".to_string(), replica.to_vec()),
        ]),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_restart_needed_wins_over_setter_error() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, handle) = MockSupervisor::new();
    let engine = Engine::new(
        Arc::new(registry()),
        Arc::new(PairService {
            handle: handle.clone(),
        }),
        Box::new(supervisor),
        Arc::new(steward_worker::persistence::FileStore::new(dir.path(), "w").unwrap()),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )
    .unwrap();

    let first = pair_state(&db("postgres://a"), &db("postgres://r"));
    engine.apply(first.clone()).await;
    handle.clear_events();

    let feedback = engine
        .apply(pair_state(
            &db("postgres://b"),
            br#"{"dsn":"postgres://r2","fail":true}"#,
        ))
        .await;

    assert_eq!(feedback.warnings().len(), 1);
    assert_eq!(handle.events(), vec![stopped(Protocol::Http, 8080)]);
    assert!(!engine.has_handler().await);
    assert_eq!(engine.applied_state().await, Some(first));

    handle.clear_events();
    let feedback = engine
        .apply(pair_state(&db("postgres://b"), &db("postgres://r")))
        .await;
    assert!(feedback.is_empty(), "{:?}", feedback);
    assert_eq!(
        handle.events(),
        vec![note("handler built"), started(Protocol::Http, 8080)]
    );
}

#[tokio::test]
async fn test_concurrent_applies_are_serialized() {
    let f = fixture();
    let engine = Arc::new(f.engine);

    let mut tasks = Vec::new();
    for i in 0..8u16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.apply(http_state(8080 + i, "postgres://a")).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_empty());
    }

    // Every start is preceded by the stop of the previous listener.
    let mut running = None;
    for event in f.handle.events() {
        match event {
            MockEvent::Started { port, .. } => {
                assert!(running.is_none(), "two listeners at once");
                running = Some(port);
            }
            MockEvent::Stopped { port, .. } => {
                assert_eq!(running.take(), Some(port));
            }
            MockEvent::Note(_) => {}
        }
    }
    let applied = engine.applied_state().await.unwrap();
    assert_eq!(running, Some(applied.http_port));
}
