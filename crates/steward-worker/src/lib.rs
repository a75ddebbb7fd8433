// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steward Worker - service-state reconciler
//!
//! A long-lived worker that serves HTTP and HTTPS through a user-supplied
//! handler whose configuration is pushed in, whole, by a separate control
//! process. Every push is reconciled against the last applied state: the
//! running server is left alone, partially or fully restarted, or kept as-is
//! because required inputs are still incomplete.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐   apply(State)    ┌────────────────────────────┐
//! │    control process    │ ────────────────► │  RPC control surface       │
//! │  (steward-protocol)   │ ◄──────────────── │  (server)                  │
//! └───────────────────────┘   warnings        └─────────────┬──────────────┘
//!                                                           │ exclusive lock
//!                                                           ▼
//!   ┌──────────────┐  setters   ┌──────────────────────────────────────────┐
//!   │ SlotRegistry │ ◄───────── │  Engine (reconciliation)                 │
//!   └──────────────┘            └───────┬──────────────────────┬───────────┘
//!                                       │ start / stop         │ save
//!                                       ▼                      ▼
//!                          ┌─────────────────────────┐  ┌─────────────────┐
//!                          │ ListenerSupervisor      │  │ Persistence     │
//!                          │ (HTTP, HTTPS listeners) │  │ (state.json)    │
//!                          └─────────────────────────┘  └─────────────────┘
//! ```
//!
//! # Embedding
//!
//! ```rust,ignore
//! use steward_worker::runtime::WorkerRuntime;
//! use steward_worker::slots::SlotRegistry;
//!
//! let runtime = WorkerRuntime::builder()
//!     .service(MyService)
//!     .registry(SlotRegistry::new().register(MySlot))
//!     .control_addr("127.0.0.1:7400".parse()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! tokio::signal::ctrl_c().await?;
//! runtime.shutdown().await?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod demo;
pub mod engine;
pub mod error;
pub mod listener;
pub mod persistence;
pub mod runtime;
pub mod server;
pub mod service;
pub mod slots;
pub mod state;

pub use engine::{Engine, Feedback};
pub use error::{BoxError, Error, Result};
pub use service::{Handler, Service};
pub use slots::{Relations, Slot, SlotDecl, SlotOutcome, SlotRegistry};
pub use state::State;
