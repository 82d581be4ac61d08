//! JSON wire codec for cloud traffic
//!
//! Outbound publishes go to `api/<topic_seq>` and carry numbered commands:
//! ```text
//! { "1": { "command": "property.publish", "params": { ... } }, "2": { ... } }
//! ```
//!
//! Replies come back on `reply/<topic_seq>`, keyed by the same numbers:
//! ```text
//! { "1": { "success": true }, "2": { "success": false, "errorMessages": ["..."] } }
//! ```
//!
//! Action requests arrive on `action/...` as `{ "id", "method", "params" }`.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::{protocol, ActionRequest, CorrelationKey, Params};

/// Maximum payload size (256 KB) accepted in either direction
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Unrecognized topic: {0}")]
    UnknownTopic(String),

    #[error("Invalid topic sequence in {0}")]
    InvalidTopicSequence(String),

    #[error("Invalid command sequence: {0}")]
    InvalidCommandSequence(String),

    #[error("Nothing to encode")]
    Empty,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single command inside an outbound publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub command: String,
    pub params: Value,
}

impl OutboundCommand {
    pub fn new(command: impl Into<String>, params: Value) -> Self {
        Self {
            command: command.into(),
            params,
        }
    }
}

/// Cloud reply to one outbound command
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub key: CorrelationKey,
    pub success: bool,
    pub error_messages: Vec<String>,
    pub params: Value,
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Action(ActionRequest),
    Reply(Reply),
}

#[derive(Deserialize)]
struct ReplyBody {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "errorMessages")]
    error_messages: Vec<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Deserialize)]
struct ActionBody {
    id: String,
    method: String,
    #[serde(default)]
    params: Params,
}

/// Topic an outbound publish with this sequence goes to
pub fn api_topic(topic_seq: u64) -> String {
    format!("{}{}", protocol::API_TOPIC_PREFIX, topic_seq)
}

/// Topic the cloud replies on for this sequence
pub fn reply_topic(topic_seq: u64) -> String {
    format!("{}{}", protocol::REPLY_TOPIC_PREFIX, topic_seq)
}

/// Parse the sequence number out of `api/<n>` or `reply/<n>`
pub fn topic_sequence(topic: &str) -> Result<u64, CodecError> {
    let rest = topic
        .strip_prefix(protocol::REPLY_TOPIC_PREFIX)
        .or_else(|| topic.strip_prefix(protocol::API_TOPIC_PREFIX))
        .ok_or_else(|| CodecError::UnknownTopic(topic.to_string()))?;

    rest.parse()
        .map_err(|_| CodecError::InvalidTopicSequence(topic.to_string()))
}

/// Encode commands into a publish body; command numbers start at 1
pub fn encode_commands(commands: &[OutboundCommand]) -> Result<Bytes, CodecError> {
    if commands.is_empty() {
        return Err(CodecError::Empty);
    }

    let body: IndexMap<String, &OutboundCommand> = commands
        .iter()
        .enumerate()
        .map(|(i, cmd)| ((i as u32 + protocol::FIRST_COMMAND_SEQ).to_string(), cmd))
        .collect();

    let encoded = serde_json::to_vec(&body)?;
    if encoded.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(encoded.len()));
    }

    Ok(Bytes::from(encoded))
}

/// Decode an outbound publish body back into its numbered commands
pub fn decode_commands(payload: &[u8]) -> Result<Vec<(u32, OutboundCommand)>, CodecError> {
    let body: IndexMap<String, OutboundCommand> = serde_json::from_slice(payload)?;

    body.into_iter()
        .map(|(seq, cmd)| -> Result<(u32, OutboundCommand), CodecError> {
            let seq = seq
                .parse::<u32>()
                .map_err(|_| CodecError::InvalidCommandSequence(seq.clone()))?;
            Ok((seq, cmd))
        })
        .collect()
}

/// Decode an inbound message into the events it carries
pub fn decode(topic: &str, payload: &[u8]) -> Result<Vec<InboundEvent>, CodecError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(payload.len()));
    }

    if topic.starts_with(protocol::REPLY_TOPIC_PREFIX) {
        let topic_seq = topic_sequence(topic)?;
        let body: IndexMap<String, ReplyBody> = serde_json::from_slice(payload)?;

        let events = body
            .into_iter()
            .filter_map(|(seq, reply)| {
                let Ok(command_seq) = seq.parse::<u32>() else {
                    warn!("Skipping reply with invalid command sequence {:?}", seq);
                    return None;
                };
                Some(InboundEvent::Reply(Reply {
                    key: CorrelationKey::new(topic_seq, command_seq),
                    success: reply.success,
                    error_messages: reply.error_messages,
                    params: reply.params,
                }))
            })
            .collect();
        Ok(events)
    } else if topic.starts_with(protocol::ACTION_TOPIC_PREFIX) {
        let body: ActionBody = serde_json::from_slice(payload)?;
        Ok(vec![InboundEvent::Action(ActionRequest {
            request_id: body.id,
            name: body.method,
            params: body.params,
        })])
    } else {
        Err(CodecError::UnknownTopic(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParamValue;
    use serde_json::json;

    #[test]
    fn test_encode_numbers_commands_from_one() {
        let commands = vec![
            OutboundCommand::new("property.publish", json!({"key": "temp", "value": 21.5})),
            OutboundCommand::new("log.publish", json!({"msg": "hello"})),
        ];

        let encoded = encode_commands(&commands).expect("encode failed");
        let value: Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(value["1"]["command"], "property.publish");
        assert_eq!(value["2"]["params"]["msg"], "hello");
        assert!(value.get("0").is_none());

        let decoded = decode_commands(&encoded).expect("decode failed");
        assert_eq!(decoded[0].0, 1);
        assert_eq!(decoded[1].1.command, "log.publish");
    }

    #[test]
    fn test_encode_empty_is_error() {
        assert!(matches!(encode_commands(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn test_decode_reply() {
        let payload = br#"{"1": {"success": true}, "2": {"success": false, "errorMessages": ["bad key"]}}"#;
        let events = decode("reply/17", payload).expect("decode failed");

        assert_eq!(events.len(), 2);
        match &events[1] {
            InboundEvent::Reply(reply) => {
                assert_eq!(reply.key, CorrelationKey::new(17, 2));
                assert!(!reply.success);
                assert_eq!(reply.error_messages, vec!["bad key".to_string()]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_action() {
        let payload = br#"{"id": "abc", "method": "set_led", "params": {"on": true, "level": 3}}"#;
        let events = decode("action/notify", payload).expect("decode failed");

        match &events[0] {
            InboundEvent::Action(request) => {
                assert_eq!(request.request_id, "abc");
                assert_eq!(request.name, "set_led");
                assert_eq!(request.params["on"], ParamValue::Bool(true));
                assert_eq!(request.params["level"], ParamValue::Int(3));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_topic() {
        let result = decode("telemetry/1", b"{}");
        assert!(matches!(result, Err(CodecError::UnknownTopic(_))));
    }

    #[test]
    fn test_decode_bad_sequence() {
        assert!(matches!(
            decode("reply/abc", b"{}"),
            Err(CodecError::InvalidTopicSequence(_))
        ));
    }

    #[test]
    fn test_decode_skips_bad_command_sequence() {
        let payload = br#"{"x": {"success": true}, "2": {"success": true}, "-1": {"success": false}}"#;
        let events = decode("reply/3", payload).expect("decode failed");

        assert_eq!(events.len(), 1);
        match &events[0] {
            InboundEvent::Reply(reply) => {
                assert_eq!(reply.key, CorrelationKey::new(3, 2));
                assert!(reply.success);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_json() {
        assert!(matches!(decode("reply/3", b"{nope"), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_topics() {
        assert_eq!(api_topic(5), "api/5");
        assert_eq!(reply_topic(5), "reply/5");
        assert_eq!(topic_sequence("api/5").unwrap(), 5);
        assert_eq!(topic_sequence("reply/9").unwrap(), 9);
    }
}
