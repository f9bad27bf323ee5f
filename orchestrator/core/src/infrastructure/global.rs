// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process-wide bus handle.
//!
//! Hosts that cannot thread an `Arc<MessageBus>` through every component
//! install one bus here at startup. Library code should still prefer an
//! explicit handle.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::domain::config::BusConfig;
use crate::infrastructure::message_bus::MessageBus;

static GLOBAL_BUS: RwLock<Option<Arc<MessageBus>>> = parking_lot::const_rwlock(None);

#[derive(Debug, Error)]
pub enum GlobalBusError {
    #[error("The global message bus is already initialized")]
    AlreadyInitialized,
}

/// Install `bus` as the process-wide bus.
pub fn init(bus: Arc<MessageBus>) -> Result<Arc<MessageBus>, GlobalBusError> {
    let mut slot = GLOBAL_BUS.write();
    if slot.is_some() {
        return Err(GlobalBusError::AlreadyInitialized);
    }
    *slot = Some(bus.clone());
    tracing::debug!("Global message bus installed");
    Ok(bus)
}

pub fn init_default(config: BusConfig) -> Result<Arc<MessageBus>, GlobalBusError> {
    init(Arc::new(MessageBus::new(config)))
}

/// The installed bus, if any
pub fn bus() -> Option<Arc<MessageBus>> {
    GLOBAL_BUS.read().clone()
}

/// The installed bus, installing a default one on first use
pub fn get_or_init() -> Arc<MessageBus> {
    if let Some(bus) = bus() {
        return bus;
    }
    let mut slot = GLOBAL_BUS.write();
    slot.get_or_insert_with(|| Arc::new(MessageBus::with_defaults()))
        .clone()
}

/// Remove the installed bus. Existing handles keep working.
pub fn teardown() -> Option<Arc<MessageBus>> {
    GLOBAL_BUS.write().take()
}
