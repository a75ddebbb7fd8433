// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages exchanged on the control channel.
//!
//! The message set is small enough to be declared with the `prost` derive
//! macros directly, so the crate needs no `protoc` at build time. Tags are
//! part of the wire contract and must never be reused.

use std::collections::HashMap;

/// Complete desired configuration of a worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceState {
    /// HTTP port, 0 disables plain HTTP.
    #[prost(uint32, tag = "1")]
    pub http_port: u32,
    /// HTTPS port, 0 disables HTTPS.
    #[prost(uint32, tag = "2")]
    pub https_port: u32,
    /// PEM certificate chain followed by the PEM private key.
    #[prost(bytes = "vec", tag = "3")]
    pub cert_pem: Vec<u8>,
    /// Opaque handler arguments.
    #[prost(bytes = "vec", tag = "4")]
    pub arg_data: Vec<u8>,
    /// One opaque value per declared slot, keyed by slot name.
    #[prost(map = "string, bytes", tag = "5")]
    pub slot_values: HashMap<String, Vec<u8>>,
}

/// Request to apply a new state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplyRequest {
    #[prost(message, optional, tag = "1")]
    pub state: Option<ServiceState>,
}

/// Advisory feedback for an applied state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplyResponse {
    #[prost(string, repeated, tag = "1")]
    pub warnings: Vec<String>,
}

/// Marshalling-level failure of a call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Request envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1")]
    pub request: Option<rpc_request::Request>,
}

/// Nested types for [`RpcRequest`].
pub mod rpc_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Apply(super::ApplyRequest),
    }
}

/// Response envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2")]
    pub response: Option<rpc_response::Response>,
}

/// Nested types for [`RpcResponse`].
pub mod rpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        Apply(super::ApplyResponse),
        #[prost(message, tag = "2")]
        Error(super::RpcError),
    }
}
