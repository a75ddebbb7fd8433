// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The desired configuration pushed into the worker.
//!
//! A [`State`] is always transferred and compared whole. Its wire form is
//! [`ServiceState`]; its persisted form is JSON with byte fields in base64.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use steward_protocol::control_proto::ServiceState;
use thiserror::Error;

/// Complete desired configuration of the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// HTTP port, 0 disables plain HTTP.
    pub http_port: u16,
    /// HTTPS port, 0 disables HTTPS.
    pub https_port: u16,
    /// PEM certificate chain followed by the PEM private key.
    #[serde(with = "base64_bytes")]
    pub cert_pem: Vec<u8>,
    /// Handler arguments, decoded only by the handler service.
    #[serde(with = "base64_bytes")]
    pub arg_data: Vec<u8>,
    /// One value per declared slot. Missing or empty means not ready.
    #[serde(with = "base64_map")]
    pub slot_values: BTreeMap<String, Vec<u8>>,
}

impl State {
    /// Whether plain HTTP should be served.
    pub fn http_ready(&self) -> bool {
        self.http_port != 0
    }

    /// Whether HTTPS should be served. A missing certificate is a valid
    /// "not configured yet" state, not an error.
    pub fn https_ready(&self) -> bool {
        self.https_port != 0 && !self.cert_pem.is_empty()
    }

    /// The value for a slot, or `None` when it is not ready.
    pub fn slot_value(&self, name: &str) -> Option<&[u8]> {
        self.slot_values
            .get(name)
            .map(Vec::as_slice)
            .filter(|value| !value.is_empty())
    }

    /// Hex SHA-256 over every field, in a fixed order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.http_port.to_be_bytes());
        hasher.update(self.https_port.to_be_bytes());
        hash_field(&mut hasher, &self.cert_pem);
        hash_field(&mut hasher, &self.arg_data);
        hasher.update((self.slot_values.len() as u64).to_be_bytes());
        for (name, value) in &self.slot_values {
            hash_field(&mut hasher, name.as_bytes());
            hash_field(&mut hasher, value);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Convert into the wire message.
    pub fn to_proto(&self) -> ServiceState {
        ServiceState {
            http_port: self.http_port.into(),
            https_port: self.https_port.into(),
            cert_pem: self.cert_pem.clone(),
            arg_data: self.arg_data.clone(),
            slot_values: self
                .slot_values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

// Length-prefixed so that adjacent fields cannot shift into each other.
fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Errors converting a wire message into a [`State`].
#[derive(Debug, Error)]
pub enum StateError {
    /// A port does not fit in 16 bits.
    #[error("{field} {value} is out of range (0-65535)")]
    PortOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// The received value.
        value: u32,
    },
}

fn port(field: &'static str, value: u32) -> Result<u16, StateError> {
    u16::try_from(value).map_err(|_| StateError::PortOutOfRange { field, value })
}

impl TryFrom<ServiceState> for State {
    type Error = StateError;

    fn try_from(proto: ServiceState) -> Result<Self, Self::Error> {
        Ok(Self {
            http_port: port("http_port", proto.http_port)?,
            https_port: port("https_port", proto.https_port)?,
            cert_pem: proto.cert_pem,
            arg_data: proto.arg_data,
            slot_values: proto.slot_values.into_iter().collect(),
        })
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_map {
    use std::collections::BTreeMap;

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, String> = map
            .iter()
            .map(|(name, value)| (name.as_str(), STANDARD.encode(value)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, encoded)| {
                STANDARD
                    .decode(encoded)
                    .map(|value| (name, value))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
