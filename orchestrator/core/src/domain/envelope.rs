// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Message Envelope
//!
//! The unit of data carried by the bus. An envelope is built once at
//! publish/request time and handed to handlers behind an `Arc`; fields are
//! only reachable through accessors so a delivered envelope cannot change.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Standard envelope for all bus traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    msg_id: MessageId,
    topic: String,
    /// Serialized as epoch milliseconds
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
    source: String,
    target: Option<String>,
    trace_id: Option<String>,
    payload: Value,
}

impl Envelope {
    /// Build an envelope with a fresh id and the current time.
    ///
    /// A `null` payload is normalized to an empty object so handlers can
    /// always index into it.
    pub fn new(topic: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        let payload = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Self {
            msg_id: MessageId::new(),
            topic: topic.into(),
            timestamp: Utc::now(),
            source: source.into(),
            target: None,
            trace_id: None,
            payload,
        }
    }

    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn msg_id(&self) -> MessageId {
        self.msg_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Typed view of the payload, validated at the boundary.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Field lookup on an object payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} -> {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.source,
            self.topic,
            self.payload
        )
    }
}
