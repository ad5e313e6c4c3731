//! Request/Response data model (spec §3).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One RPC invocation. `id` is unique within its owning Channel for the
/// lifetime of a pending reply only — ids are recycled once the Call
/// Future Registry entry is removed (spec §3 "Request" invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub interface: String,
    pub alias: String,
    pub method: String,
    pub param_types: Vec<String>,
    pub args: Vec<serde_json::Value>,
    pub attachments: HashMap<String, String>,
    #[serde(skip, default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Request {
    pub fn new(interface: impl Into<String>, method: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            id: 0,
            interface: interface.into(),
            alias: "default".to_string(),
            method: method.into(),
            param_types: Vec::new(),
            args,
            attachments: HashMap::new(),
            timeout: default_timeout(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a call: success with a decoded return value, an application
/// exception propagated from the server (`RemoteError`), or a named
/// transport-level failure that the Route layer may treat as retriable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    Ok(serde_json::Value),
    RemoteError { message: String, retriable: bool },
}

/// Response carries the id of the Request it answers plus session
/// attachments the server wants to flow back (spec §3 "Response").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub outcome: Outcome,
    pub attachments: HashMap<String, String>,
}

impl Response {
    pub fn ok(id: u64, value: serde_json::Value) -> Self {
        Self { id, outcome: Outcome::Ok(value), attachments: HashMap::new() }
    }

    pub fn remote_error(id: u64, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            id,
            outcome: Outcome::RemoteError { message: message.into(), retriable },
            attachments: HashMap::new(),
        }
    }
}

/// Correlation id for tracing: request id + channel id (spec §7).
pub fn correlation_id(request_id: u64, channel_id: u64) -> String {
    format!("{request_id}@{channel_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_sets_defaults() {
        let req = Request::new("Echo", "echo", vec![serde_json::json!("abc")]);
        assert_eq!(req.alias, "default");
        assert_eq!(req.timeout, Duration::from_secs(30));
    }

    #[test]
    fn correlation_id_format() {
        assert_eq!(correlation_id(7, 3), "7@3");
    }
}
