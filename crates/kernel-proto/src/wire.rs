//! Wire codec for kernel messages.
//!
//! Two encodings exist in the wild. The structured form carries the message
//! as a single JSON object. The legacy form frames it as a JSON array of
//! `[delimiter, signature, header, parent_header, metadata, content,
//! ...buffers]`, where each slot may itself be a nested JSON string.
//! Encoding always emits the structured form; decoding auto-detects and
//! accepts both.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::{parent_from_value, Message};

/// Slots before the buffer tail in a legacy frame.
const LEGACY_MIN_SLOTS: usize = 6;
const PREVIEW_LEN: usize = 120;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message json: {source} (payload: {preview})")]
    Json {
        preview: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("legacy frame has {len} slots, expected at least 6 (payload: {preview})")]
    ShortFrame { len: usize, preview: String },
    #[error("legacy frame {slot} slot did not parse: {source} (payload: {preview})")]
    Slot {
        slot: &'static str,
        preview: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("message missing required field {0}")]
    MissingField(&'static str),
}

/// Serialize a message in the structured encoding.
pub fn encode_message(msg: &Message) -> Result<String, WireError> {
    serde_json::to_string(msg).map_err(|source| WireError::Json {
        preview: preview(&msg.header.msg_type),
        source,
    })
}

/// Parse a wire frame, auto-detecting the encoding.
pub fn decode_message(raw: &str) -> Result<Message, WireError> {
    let value: Value = serde_json::from_str(raw).map_err(|source| WireError::Json {
        preview: preview(raw),
        source,
    })?;
    let msg = match value {
        Value::Array(slots) => decode_legacy(slots, raw)?,
        other => serde_json::from_value(other).map_err(|source| WireError::Json {
            preview: preview(raw),
            source,
        })?,
    };
    validate(&msg)?;
    Ok(msg)
}

fn decode_legacy(slots: Vec<Value>, raw: &str) -> Result<Message, WireError> {
    if slots.len() < LEGACY_MIN_SLOTS {
        return Err(WireError::ShortFrame {
            len: slots.len(),
            preview: preview(raw),
        });
    }
    // slots[0] is the delimiter and slots[1] the signature; neither is
    // needed to reconstruct the message.
    let header = unwrap_slot(&slots[2], "header")?;
    let parent = unwrap_slot(&slots[3], "parent_header")?;
    let metadata = unwrap_slot(&slots[4], "metadata")?;
    let content = unwrap_slot(&slots[5], "content")?;
    let buffers = slots[LEGACY_MIN_SLOTS..].to_vec();

    let header = serde_json::from_value(header).map_err(|source| WireError::Slot {
        slot: "header",
        preview: preview(raw),
        source,
    })?;
    let parent_header = parent_from_value(parent).map_err(|source| WireError::Slot {
        slot: "parent_header",
        preview: preview(raw),
        source,
    })?;
    let metadata: Map<String, Value> = match metadata {
        Value::Null => Map::new(),
        other => serde_json::from_value(other).map_err(|source| WireError::Slot {
            slot: "metadata",
            preview: preview(raw),
            source,
        })?,
    };

    Ok(Message {
        header,
        parent_header,
        metadata,
        content,
        buffers,
    })
}

/// A legacy slot is either a raw JSON value or that value serialized again
/// as a string; accept both.
fn unwrap_slot(slot: &Value, name: &'static str) -> Result<Value, WireError> {
    match slot {
        Value::String(nested) => serde_json::from_str(nested).map_err(|source| WireError::Slot {
            slot: name,
            preview: preview(nested),
            source,
        }),
        other => Ok(other.clone()),
    }
}

fn validate(msg: &Message) -> Result<(), WireError> {
    if msg.header.msg_id.is_empty() {
        return Err(WireError::MissingField("header.msg_id"));
    }
    if msg.header.msg_type.is_empty() {
        return Err(WireError::MissingField("header.msg_type"));
    }
    if msg.header.session.is_empty() {
        return Err(WireError::MissingField("header.session"));
    }
    Ok(())
}

fn preview(raw: &str) -> String {
    let mut out: String = raw.chars().take(PREVIEW_LEN).collect();
    if raw.chars().count() > PREVIEW_LEN {
        out.push_str("...");
    }
    out
}
