// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Request/reply result type.
//!
//! Serializes flat as `{"ok": bool, "error"?: string, ...data}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Reply {
    /// No handler bound to the requested topic
    pub const NO_HANDLER: &'static str = "no_handler";
    /// Handler did not answer within the request timeout
    pub const TIMEOUT: &'static str = "timeout";
    /// Topic failed validation
    pub const INVALID_TOPIC: &'static str = "invalid_topic";

    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            data: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            data: Map::new(),
        }
    }

    /// Attach a data field. `ok` and `error` keys are routed to the
    /// corresponding fields instead of the data map.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        match key.as_str() {
            "ok" => self.ok = value.as_bool().unwrap_or(false),
            "error" => self.error = value.as_str().map(str::to_owned),
            _ => {
                self.data.insert(key, value);
            }
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_timeout(&self) -> bool {
        !self.ok && self.error.as_deref() == Some(Self::TIMEOUT)
    }

    pub fn into_value(self) -> Value {
        let mut map = self.data;
        map.insert("ok".to_string(), Value::Bool(self.ok));
        if let Some(error) = self.error {
            map.insert("error".to_string(), Value::String(error));
        }
        Value::Object(map)
    }
}
