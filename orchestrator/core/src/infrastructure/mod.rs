// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod global;
pub mod history;
pub mod message_bus;
pub(crate) mod panic;

pub use history::{InMemoryJobHistory, JsonFileJobHistory};
pub use message_bus::{BusError, BusReport, MessageBus, SubscriptionId};
