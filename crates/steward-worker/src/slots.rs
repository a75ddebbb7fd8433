// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relation slots: named pieces of configuration supplied by outside systems.
//!
//! A slot *kind* is registered once per process as a [`Slot`] implementation.
//! A handler service declares the slots it needs by name and kind
//! ([`SlotDecl`]); the engine feeds each declared slot the bytes found in the
//! pushed state and hands the resulting held values to the service as
//! [`Relations`].
//!
//! Held values may be shared with a running handler (for example behind an
//! `Arc`). A setter that can update its held value in place returns
//! [`SlotOutcome::Applied`] and the handler keeps running; a setter that had
//! to replace a resource the handler depends on returns
//! [`SlotOutcome::RestartNeeded`] and the handler is rebuilt.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::BoxError;

/// Result of applying a decoded value to a slot's held value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The held value reflects the new input; nothing else to do.
    Applied,
    /// The held value was replaced and the handler must be rebuilt.
    RestartNeeded,
}

/// Errors produced while feeding a slot.
#[derive(Debug, Error)]
#[non_exhaustive]
#[allow(missing_docs)] // Fields are self-documenting from variant docs
pub enum SlotError {
    /// No slot of this kind is registered.
    #[error("slot kind '{0}' is not registered")]
    UnknownKind(String),

    /// The bytes are not a valid value for this kind.
    #[error("invalid value for slot kind '{kind}': {source}")]
    Decode {
        kind: &'static str,
        source: serde_json::Error,
    },

    /// The producer could not observe its source.
    #[error("slot kind '{kind}' failed to produce a value: {message}")]
    Produce { kind: &'static str, message: String },

    /// The setter rejected the value.
    #[error("slot kind '{kind}' rejected the value: {message}")]
    Apply { kind: &'static str, message: String },

    /// The held value is not of the kind's held type.
    #[error("slot kind '{kind}' holds a value of another type")]
    TypeMismatch { kind: &'static str },

    /// The setter panicked.
    #[error("slot kind '{kind}' panicked: {message}")]
    Panicked { kind: &'static str, message: String },
}

/// A typed slot kind.
///
/// `produce` is called by whatever feeds the control process, never by the
/// engine. `apply` is called by the engine with the decoded value whenever
/// the pushed bytes differ from the last ones this slot accepted.
pub trait Slot: Send + Sync + 'static {
    /// Registry key for this kind.
    const KIND: &'static str;

    /// Value carried in the pushed state, encoded as JSON.
    type Value: Serialize + DeserializeOwned;

    /// Value held on behalf of the handler.
    type Held: Send + Sync + 'static;

    /// Observe the outside source and return the current value.
    fn produce(&self) -> Result<Self::Value, BoxError>;

    /// Apply a new value to the held value.
    fn apply(
        &self,
        held: &mut Option<Self::Held>,
        value: Self::Value,
    ) -> Result<SlotOutcome, BoxError>;
}

/// Type-erased held value of one slot.
pub type HeldValue = Option<Box<dyn Any + Send + Sync>>;

/// Object-safe form of a [`Slot`], as stored in the registry.
pub trait SlotProvider: Send + Sync {
    /// Registry key.
    fn kind(&self) -> &'static str;

    /// Produce the current value as bytes suitable for a state's slot values.
    fn produce(&self) -> Result<Vec<u8>, SlotError>;

    /// Decode `data` and apply it to `held`.
    fn apply(&self, held: &mut HeldValue, data: &[u8]) -> Result<SlotOutcome, SlotError>;
}

struct Typed<S>(S);

impl<S: Slot> SlotProvider for Typed<S> {
    fn kind(&self) -> &'static str {
        S::KIND
    }

    fn produce(&self) -> Result<Vec<u8>, SlotError> {
        let value = self.0.produce().map_err(|e| SlotError::Produce {
            kind: S::KIND,
            message: e.to_string(),
        })?;
        serde_json::to_vec(&value).map_err(|e| SlotError::Produce {
            kind: S::KIND,
            message: e.to_string(),
        })
    }

    fn apply(&self, held: &mut HeldValue, data: &[u8]) -> Result<SlotOutcome, SlotError> {
        let value: S::Value = serde_json::from_slice(data).map_err(|source| SlotError::Decode {
            kind: S::KIND,
            source,
        })?;

        let mut typed: Option<S::Held> = match held.take() {
            None => None,
            Some(boxed) => match boxed.downcast::<S::Held>() {
                Ok(value) => Some(*value),
                Err(boxed) => {
                    *held = Some(boxed);
                    return Err(SlotError::TypeMismatch { kind: S::KIND });
                }
            },
        };

        let result = self.0.apply(&mut typed, value);
        *held = typed.map(|value| Box::new(value) as Box<dyn Any + Send + Sync>);

        result.map_err(|e| SlotError::Apply {
            kind: S::KIND,
            message: e.to_string(),
        })
    }
}

/// Process-wide table of slot kinds.
///
/// Built once at start-up, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct SlotRegistry {
    providers: HashMap<&'static str, Arc<dyn SlotProvider>>,
}

impl SlotRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed slot kind.
    ///
    /// # Panics
    ///
    /// Panics if the kind is already registered.
    pub fn register<S: Slot>(self, slot: S) -> Self {
        self.register_provider(Arc::new(Typed(slot)))
    }

    /// Register an already erased provider.
    ///
    /// # Panics
    ///
    /// Panics if the kind is already registered.
    pub fn register_provider(mut self, provider: Arc<dyn SlotProvider>) -> Self {
        let kind = provider.kind();
        if self.providers.contains_key(kind) {
            panic!("slot kind '{kind}' registered twice");
        }
        self.providers.insert(kind, provider);
        self
    }

    /// Look up a provider by kind.
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn SlotProvider>> {
        self.providers.get(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Run the producer of a kind.
    pub fn produce(&self, kind: &str) -> Result<Vec<u8>, SlotError> {
        self.get(kind)
            .ok_or_else(|| SlotError::UnknownKind(kind.to_string()))?
            .produce()
    }

    /// Check a service's slot declarations against the registry.
    pub fn validate(&self, decls: &[SlotDecl]) -> Result<(), RegistryError> {
        let mut seen = HashSet::new();
        for decl in decls {
            if decl.name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if !seen.insert(decl.name.as_str()) {
                return Err(RegistryError::DuplicateName(decl.name.clone()));
            }
            if !self.providers.contains_key(decl.kind) {
                return Err(RegistryError::UnknownKind {
                    name: decl.name.clone(),
                    kind: decl.kind,
                });
            }
        }
        Ok(())
    }
}

/// Slot declarations that do not fit the registry.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are self-documenting from variant docs
pub enum RegistryError {
    /// A declaration has an empty name.
    #[error("slot declared with an empty name")]
    EmptyName,

    /// Two declarations share a name.
    #[error("slot '{0}' declared twice")]
    DuplicateName(String),

    /// A declaration names a kind nobody registered.
    #[error("slot '{name}' uses unregistered kind '{kind}'")]
    UnknownKind { name: String, kind: &'static str },
}

/// A slot a handler service needs before it can be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDecl {
    /// Key into the state's slot values.
    pub name: String,
    /// Registered kind feeding this slot.
    pub kind: &'static str,
}

impl SlotDecl {
    /// Declare a slot by kind tag.
    pub fn new(name: impl Into<String>, kind: &'static str) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Declare a slot of a typed kind.
    pub fn of<S: Slot>(name: impl Into<String>) -> Self {
        Self::new(name, S::KIND)
    }
}

struct RelationEntry {
    kind: &'static str,
    held: HeldValue,
    accepted: Option<Vec<u8>>,
}

/// Held values of every declared slot, handed to the handler service.
pub struct Relations {
    entries: BTreeMap<String, RelationEntry>,
}

impl Relations {
    pub(crate) fn new(decls: &[SlotDecl]) -> Self {
        let entries = decls
            .iter()
            .map(|decl| {
                (
                    decl.name.clone(),
                    RelationEntry {
                        kind: decl.kind,
                        held: None,
                        accepted: None,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// The typed held value of a slot, if it has one and is of kind `S`.
    pub fn get<S: Slot>(&self, name: &str) -> Option<&S::Held> {
        let entry = self.entries.get(name)?;
        if entry.kind != S::KIND {
            return None;
        }
        entry.held.as_deref()?.downcast_ref::<S::Held>()
    }

    /// Declared slot names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Feed `data` to the slot `name` unless it equals the bytes the slot
    /// last accepted. Returns `None` when the setter was skipped.
    pub(crate) fn feed(
        &mut self,
        name: &str,
        provider: &dyn SlotProvider,
        data: &[u8],
    ) -> Result<Option<SlotOutcome>, SlotError> {
        let Some(entry) = self.entries.get_mut(name) else {
            return Err(SlotError::UnknownKind(name.to_string()));
        };
        if entry.accepted.as_deref() == Some(data) {
            return Ok(None);
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            provider.apply(&mut entry.held, data)
        }));

        match result {
            Ok(Ok(outcome)) => {
                entry.accepted = Some(data.to_vec());
                Ok(Some(outcome))
            }
            Ok(Err(e)) => Err(e),
            Err(payload) => {
                // The held value may be gone; force the next feed through.
                entry.accepted = None;
                Err(SlotError::Panicked {
                    kind: provider.kind(),
                    message: crate::error::panic_message(payload.as_ref()),
                })
            }
        }
    }
}
