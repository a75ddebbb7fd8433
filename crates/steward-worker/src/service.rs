// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler services: the user-supplied code the worker serves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::{self, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::{BoxError, panic_message};
use crate::slots::{Relations, SlotDecl};

/// A live handler answering HTTP(S) requests.
pub trait Handler: Send + Sync {
    /// Routes served on every active protocol. Called once per instance.
    fn router(&self) -> Router;

    /// Release resources. Called once, before the listeners are stopped.
    fn close(&self) {}
}

/// Constructor for handlers.
pub trait Service: Send + Sync + 'static {
    /// Arguments decoded from the state's `arg_data` (JSON; empty means `null`).
    type Args: DeserializeOwned;

    /// Slots that must be ready before [`build`](Self::build) is called.
    fn slots(&self) -> Vec<SlotDecl> {
        Vec::new()
    }

    /// Build a handler from the decoded arguments and the held slot values.
    fn build(&self, args: Self::Args, relations: &Relations) -> Result<Box<dyn Handler>, BoxError>;
}

/// Errors building a handler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// `arg_data` is not valid for the service's argument type.
    #[error("invalid handler arguments: {0}")]
    DecodeArgs(#[source] serde_json::Error),

    /// The service refused to build.
    #[error("handler construction failed: {0}")]
    Build(String),

    /// The service panicked while building.
    #[error("handler construction panicked: {0}")]
    Panicked(String),
}

/// Object-safe form of a [`Service`], used by the engine.
pub trait HandlerFactory: Send + Sync {
    /// Slots the service declares.
    fn declared_slots(&self) -> Vec<SlotDecl>;

    /// Decode `arg_data` and build a handler.
    fn construct(&self, arg_data: &[u8], relations: &Relations)
    -> Result<Box<dyn Handler>, ServiceError>;
}

impl<T: Service> HandlerFactory for T {
    fn declared_slots(&self) -> Vec<SlotDecl> {
        Service::slots(self)
    }

    fn construct(
        &self,
        arg_data: &[u8],
        relations: &Relations,
    ) -> Result<Box<dyn Handler>, ServiceError> {
        let args: T::Args = if arg_data.is_empty() {
            serde_json::from_value(serde_json::Value::Null)
        } else {
            serde_json::from_slice(arg_data)
        }
        .map_err(ServiceError::DecodeArgs)?;

        Service::build(self, args, relations).map_err(|e| ServiceError::Build(e.to_string()))
    }
}

/// The engine's wrapper around a live handler.
///
/// Requests that reach the router after [`close`](Self::close) (on
/// connections still draining) are answered with `503`.
pub(crate) struct HandlerInstance {
    handler: Box<dyn Handler>,
    router: Router,
    closed: Arc<AtomicBool>,
}

impl HandlerInstance {
    /// Build a handler through `factory`, catching panics.
    pub(crate) fn build(
        factory: &dyn HandlerFactory,
        arg_data: &[u8],
        relations: &Relations,
    ) -> Result<Self, ServiceError> {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            factory
                .construct(arg_data, relations)
                .map(HandlerInstance::new)
        }));
        match result {
            Ok(built) => built,
            Err(payload) => Err(ServiceError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    fn new(handler: Box<dyn Handler>) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let router = handler
            .router()
            .layer(middleware::from_fn_with_state(closed.clone(), reject_when_closed));
        Self {
            handler,
            router,
            closed,
        }
    }

    pub(crate) fn router(&self) -> Router {
        self.router.clone()
    }

    /// Close the handler. A panic in the handler's own `close` is returned
    /// as its message.
    pub(crate) fn close(self) -> Result<(), String> {
        self.closed.store(true, Ordering::Release);
        let handler = self.handler;
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.close()))
            .map_err(|payload| panic_message(payload.as_ref()))
    }
}

async fn reject_when_closed(
    extract::State(closed): extract::State<Arc<AtomicBool>>,
    request: Request,
    next: Next,
) -> Response {
    if closed.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "handler closed\n").into_response();
    }
    next.run(request).await
}
