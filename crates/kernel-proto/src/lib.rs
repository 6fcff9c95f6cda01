//! Kernel messaging protocol: message types plus the wire codec.
//!
//! The remote kernel speaks a JSON message protocol over a WebSocket. Every
//! message carries a header identifying it and a `parent_header` echoing the
//! request it answers; replies are correlated to requests purely by
//! `parent_header.msg_id`.

mod wire;

pub use wire::{decode_message, encode_message, WireError};

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "5.3";

/// Message type names used on the wire.
pub mod msg_type {
    pub const EXECUTE_REQUEST: &str = "execute_request";
    pub const KERNEL_INFO_REQUEST: &str = "kernel_info_request";
    pub const INTERRUPT_REQUEST: &str = "interrupt_request";

    pub const EXECUTE_REPLY: &str = "execute_reply";
    pub const STREAM: &str = "stream";
    pub const ERROR: &str = "error";
    pub const DISPLAY_DATA: &str = "display_data";
    pub const EXECUTE_RESULT: &str = "execute_result";
    pub const STATUS: &str = "status";
    pub const KERNEL_INFO_REPLY: &str = "kernel_info_reply";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub date: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Header {
    /// Fresh header with a process-unique `msg_id` and the creation time.
    pub fn new(msg_type: &str, session: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            username: String::new(),
            session: session.to_string(),
            date: Utc::now().to_rfc3339(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub header: Header,
    /// Empty for requests; echoes the request header on replies and events.
    #[serde(
        default,
        serialize_with = "ser_parent",
        deserialize_with = "de_parent"
    )]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "empty_object")]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn ser_parent<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => Map::<String, Value>::new().serialize(serializer),
    }
}

fn de_parent<'de, D>(deserializer: D) -> Result<Option<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    parent_from_value(value).map_err(serde::de::Error::custom)
}

pub(crate) fn parent_from_value(value: Value) -> Result<Option<Header>, serde_json::Error> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other).map(Some),
    }
}

impl Message {
    /// Outbound request: fresh header, empty parent.
    pub fn request(msg_type: &str, session: &str, content: Value) -> Self {
        Self {
            header: Header::new(msg_type, session),
            parent_header: None,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        }
    }

    pub fn execute_request(session: &str, code: &str, silent: bool, store_history: bool) -> Self {
        Self::request(
            msg_type::EXECUTE_REQUEST,
            session,
            serde_json::json!({
                "code": code,
                "silent": silent,
                "store_history": store_history,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        )
    }

    pub fn kernel_info_request(session: &str) -> Self {
        Self::request(msg_type::KERNEL_INFO_REQUEST, session, empty_object())
    }

    pub fn interrupt_request(session: &str) -> Self {
        Self::request(msg_type::INTERRUPT_REQUEST, session, empty_object())
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The `msg_id` of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header
            .as_ref()
            .map(|header| header.msg_id.as_str())
            .filter(|id| !id.is_empty())
    }

    fn content_as<T: serde::de::DeserializeOwned>(&self, expected_type: &str) -> Option<T> {
        if self.header.msg_type != expected_type {
            return None;
        }
        serde_json::from_value(self.content.clone()).ok()
    }

    pub fn stream(&self) -> Option<StreamContent> {
        self.content_as(msg_type::STREAM)
    }

    pub fn execute_reply(&self) -> Option<ExecuteReply> {
        self.content_as(msg_type::EXECUTE_REPLY)
    }

    pub fn error(&self) -> Option<ErrorContent> {
        self.content_as(msg_type::ERROR)
    }

    /// Kernel execution state from a `status` broadcast.
    pub fn execution_state(&self) -> Option<String> {
        if self.header.msg_type != msg_type::STATUS {
            return None;
        }
        self.content
            .get("execution_state")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamContent {
    pub name: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteReply {
    pub status: String,
    #[serde(default)]
    pub execution_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorContent {
    #[serde(default)]
    pub ename: String,
    #[serde(default)]
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}
