// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steward Protocol - QUIC + Protobuf control channel
//!
//! This crate provides the wire layer between a control process and a
//! steward worker. The control process pushes the complete desired service
//! state; the worker answers with advisory feedback.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    steward-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: one request/response per bidirectional stream   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn), loopback by default               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use steward_protocol::{ControlClient, control_proto::ServiceState};
//!
//! let client = ControlClient::localhost("127.0.0.1:7400".parse()?)?;
//! let warnings = client
//!     .apply(ServiceState {
//!         http_port: 8080,
//!         ..Default::default()
//!     })
//!     .await?;
//! for warning in warnings {
//!     eprintln!("warning: {warning}");
//! }
//! ```

pub mod client;
pub mod control_proto;
pub mod frame;
pub mod server;

// Re-export main types
pub use client::{ClientError, ControlClient, ControlClientConfig};
pub use frame::{Frame, FrameError, MessageType};
pub use server::{
    ConnectionHandler, ControlServer, ControlServerConfig, ServerError, StreamHandler,
};
