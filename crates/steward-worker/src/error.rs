// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for steward-worker.

use std::any::Any;

use thiserror::Error;

/// Boxed error returned by user-supplied slots and services.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The declared slots do not match the registry.
    #[error("Slot registry error: {0}")]
    Registry(#[from] crate::slots::RegistryError),

    /// A pushed state could not be converted.
    #[error("State error: {0}")]
    State(#[from] crate::state::StateError),

    /// Loading or saving the applied state failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),

    /// A listener failed.
    #[error("Listener error: {0}")]
    Listener(#[from] crate::listener::ListenerError),

    /// The control channel failed.
    #[error("Control server error: {0}")]
    Server(#[from] steward_protocol::ServerError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using the worker [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
