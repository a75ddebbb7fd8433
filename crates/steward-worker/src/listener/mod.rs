// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listener supervision - one network listener per active protocol.

pub mod mock;
pub mod tcp;
pub mod tls;
mod traits;

pub use mock::{MockEvent, MockHandle, MockSupervisor};
pub use tcp::{Listener, TcpSupervisor};
pub use tls::{TlsError, server_config_from_pem};
pub use traits::*;
