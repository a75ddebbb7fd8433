// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Greeting service served by the standalone binary.
//!
//! Push a state such as
//! `{ http_port: 8080, arg_data: {"greeting":"Hi"}, slot_values: {"name": "\"world\""} }`
//! and `GET /` answers `Hi, world!`. Changing the `name` slot updates the
//! answer without a restart.

use std::sync::{Arc, RwLock};

use axum::Router;
use axum::routing::get;
use serde::Deserialize;

use crate::error::BoxError;
use crate::service::{Handler, Service};
use crate::slots::{Relations, Slot, SlotDecl, SlotOutcome};

/// Slot kind holding a piece of text shared with the handler.
pub struct TextSlot {
    /// Value returned by `produce`.
    pub default: String,
}

impl Slot for TextSlot {
    const KIND: &'static str = "text";
    type Value = String;
    type Held = Arc<RwLock<String>>;

    fn produce(&self) -> Result<String, BoxError> {
        Ok(self.default.clone())
    }

    fn apply(
        &self,
        held: &mut Option<Self::Held>,
        value: String,
    ) -> Result<SlotOutcome, BoxError> {
        match held {
            Some(text) => {
                let mut text = text.write().map_err(|_| "text slot lock poisoned")?;
                *text = value;
            }
            None => *held = Some(Arc::new(RwLock::new(value))),
        }
        Ok(SlotOutcome::Applied)
    }
}

/// Arguments of [`GreetingService`].
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GreetingArgs {
    /// Word put in front of the name.
    pub greeting: String,
}

impl Default for GreetingArgs {
    fn default() -> Self {
        Self {
            greeting: "Hello".to_string(),
        }
    }
}

/// Service greeting whoever the `name` slot names.
pub struct GreetingService;

struct GreetingHandler {
    greeting: String,
    name: Arc<RwLock<String>>,
}

impl Service for GreetingService {
    type Args = Option<GreetingArgs>;

    fn slots(&self) -> Vec<SlotDecl> {
        vec![SlotDecl::of::<TextSlot>("name")]
    }

    fn build(&self, args: Self::Args, relations: &Relations) -> Result<Box<dyn Handler>, BoxError> {
        let name = relations
            .get::<TextSlot>("name")
            .cloned()
            .ok_or("slot 'name' has no value")?;
        Ok(Box::new(GreetingHandler {
            greeting: args.unwrap_or_default().greeting,
            name,
        }))
    }
}

impl Handler for GreetingHandler {
    fn router(&self) -> Router {
        let greeting = self.greeting.clone();
        let name = self.name.clone();
        Router::new()
            .route(
                "/",
                get(move || async move {
                    let name = name.read().map(|n| n.clone()).unwrap_or_default();
                    format!("{greeting}, {name}!")
                }),
            )
            .route("/healthz", get(|| async { "ok" }))
    }
}
