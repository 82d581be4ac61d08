//! Device Cloud Shared Protocol Types
//!
//! This crate provides the value types, wire codec and configuration tree
//! shared by the device cloud client and its tooling.

pub mod codec;
pub mod config;
pub mod state_machine;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use config::{ConfigError, ConfigLoader, ConfigTree, ConfigValue};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Status codes reported back to the cloud and returned by the OS layer
pub mod status {
    /// Operation succeeded
    pub const SUCCESS: i32 = 0;

    /// Operation ran and failed
    pub const FAILURE: i32 = 1;

    /// Operation is not available on this platform
    pub const NOT_SUPPORTED: i32 = -20;

    /// The underlying command could not be executed
    pub const EXECUTION_FAILURE: i32 = -21;

    /// Arguments were rejected before execution
    pub const BAD_PARAMETER: i32 = -22;
}

/// Protocol parameters for the device cloud
pub mod protocol {
    /// Topic prefix for outbound API publishes (`api/<topic_seq>`)
    pub const API_TOPIC_PREFIX: &str = "api/";

    /// Topic prefix for cloud replies (`reply/<topic_seq>`)
    pub const REPLY_TOPIC_PREFIX: &str = "reply/";

    /// Topic prefix for inbound action requests
    pub const ACTION_TOPIC_PREFIX: &str = "action/";

    /// Command sequence numbers inside a publish start here
    pub const FIRST_COMMAND_SEQ: u32 = 1;

    /// Default age after which an unacknowledged publish is evicted
    pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 60;

    /// Timestamp format used in outbound command parameters
    pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
}

/// Identifier assigned by the transport when a publish is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mid:{}", self.0)
    }
}

/// Durable (topic sequence, command sequence) pair that identifies a cloud reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub topic_seq: u64,
    pub command_seq: u32,
}

impl CorrelationKey {
    pub fn new(topic_seq: u64, command_seq: u32) -> Self {
        Self {
            topic_seq,
            command_seq,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic_seq, self.command_seq)
    }
}

/// A single action parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

/// Action parameters, in the order the cloud sent them
pub type Params = IndexMap<String, ParamValue>;

/// An inbound, named remote command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub request_id: String,
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

impl ActionRequest {
    /// Create a request with no parameters
    pub fn new(request_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            name: name.into(),
            params: Params::new(),
        }
    }

    /// Append a parameter, keeping insertion order
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// State of a file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    #[default]
    Pending,
    Success,
    Failure,
}

impl TransferStatus {
    /// Terminal statuses fire the completion callback
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "pending"),
            TransferStatus::Success => write!(f, "success"),
            TransferStatus::Failure => write!(f, "failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_key_display() {
        let key = CorrelationKey::new(12, 3);
        assert_eq!(key.to_string(), "12-3");
    }

    #[test]
    fn test_action_request_keeps_param_order() {
        let request = ActionRequest::new("req-1", "reboot")
            .with_param("verbose", true)
            .with_param("count", 5i64)
            .with_param("target", "eth0");

        let keys: Vec<&str> = request.params.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["verbose", "count", "target"]);
    }

    #[test]
    fn test_param_value_deserialize() {
        let params: Params =
            serde_json::from_str(r#"{"a": true, "b": 5, "c": 1.5, "d": "x"}"#).unwrap();
        assert_eq!(params["a"], ParamValue::Bool(true));
        assert_eq!(params["b"], ParamValue::Int(5));
        assert_eq!(params["c"], ParamValue::Float(1.5));
        assert_eq!(params["d"], ParamValue::Str("x".into()));
    }

    #[test]
    fn test_transfer_status_terminal() {
        assert!(!TransferStatus::Pending.is_terminal());
        assert!(TransferStatus::Success.is_terminal());
        assert!(TransferStatus::Failure.is_terminal());
    }
}
