//! Typed rows moved between store collections.
//!
//! Storage adapters move untyped [`Record`]s (JSON objects). Migration steps
//! decode them into the structs below, where every field is an `Option`:
//! absent and `null` source values both decode to `None`, and `None` is never
//! serialized. Re-encoding a decoded record therefore yields a sparse
//! projection holding only the fields that were meaningfully present.
//!
//! Only the `eventId` key is typed as a string. Every other field is carried
//! as raw JSON, so a legacy row with an oddly typed `sender` or `type` still
//! decodes and is moved as-is.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// An untyped row as persisted by a [`crate::adapter::QueryAdapter`].
pub type Record = Map<String, Value>;

/// Key field shared by every collection.
pub const EVENT_ID: &str = "eventId";

/// Collection names used by the message store.
pub mod collections {
    /// Generic per-room event timeline (legacy, drained by consolidation).
    pub const TIMELINE: &str = "timeline";
    /// Canonical normalized messages.
    pub const MESSAGES: &str = "messages";
    /// Recorded message edits.
    pub const MESSAGE_EDITS: &str = "messages_edit";
    /// Flattened search projection of messages.
    pub const SEARCH_INDEX: &str = "messages_search";
}

/// Canonical event type strings.
pub mod event_types {
    pub const ROOM_CREATE: &str = "m.room.create";
    pub const ROOM_MESSAGE: &str = "m.room.message";
    pub const PINNED_EVENTS: &str = "m.room.pinned_events";
    pub const STICKER: &str = "m.sticker";
}

/// Fields shared by timeline entries, messages, and message edits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeds: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redaction: Option<Value>,
    /// Sender-side timestamp. Kept as raw JSON because legacy rows are not
    /// guaranteed to hold a number here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<Value>,
}

/// A row of the timeline collection.
pub type TimelineEntry = EventRecord;

/// A recorded edit. Its `content` declares the replacement for the target
/// message and its `originServerTs` is the edit's own timestamp.
pub type MessageEdit = EventRecord;

/// A row of the canonical messages collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(flatten)]
    pub event: EventRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_to_ts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_to_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_to: Option<Value>,
}

/// Search-optimized projection of a [`Message`]. Derived only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchIndexEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// `content.msgtype` of the source message.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub msgtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Value>,
}

impl SearchIndexEntry {
    /// Project the searchable fields of a message.
    ///
    /// `msgtype` is taken only when it is a string. Content fields are
    /// copied when present and non-null; file metadata only when
    /// `content.file` exists.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        let event = &message.event;
        let mut entry = Self {
            event_id: event.event_id.clone(),
            sender: event.sender.clone(),
            room_id: event.room_id.clone(),
            thread_id: event.thread_id.clone(),
            origin_server_ts: event.origin_server_ts.clone(),
            ..Self::default()
        };

        let Some(content) = event.content.as_ref() else {
            return entry;
        };

        entry.msgtype = content
            .get("msgtype")
            .and_then(Value::as_str)
            .map(str::to_owned);
        entry.body = present(content, "body");
        entry.format = present(content, "format");
        entry.formatted_body = present(content, "formatted_body");

        if let Some(file) = content.get("file").filter(|file| !file.is_null()) {
            entry.mimetype = present(file, "mimetype");
            entry.url = present(file, "url");
        }

        entry
    }
}

impl MessageEdit {
    /// Event id of the message this edit replaces.
    ///
    /// Uses the `m.relates_to` relation declared in the edit's content and
    /// falls back to the edit row's own key for rows recorded under the
    /// target id.
    #[must_use]
    pub fn target_event_id(&self) -> Option<&str> {
        self.content
            .as_ref()
            .and_then(|content| content.get("m.relates_to"))
            .and_then(|relation| relation.get("event_id"))
            .and_then(Value::as_str)
            .or(self.event_id.as_deref())
    }
}

fn present(value: &Value, field: &str) -> Option<Value> {
    value.get(field).filter(|inner| !inner.is_null()).cloned()
}

/// Returns the timestamp as `f64` when it is a positive finite number.
#[must_use]
pub fn valid_timestamp(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|ts| ts.is_finite() && *ts > 0.0)
}

/// Decode a typed row from an untyped record.
///
/// # Errors
///
/// Returns an error if a present field has the wrong JSON type.
pub fn decode<T: DeserializeOwned>(record: Record) -> serde_json::Result<T> {
    serde_json::from_value(Value::Object(record))
}

/// Encode a typed row as a sparse record.
///
/// # Errors
///
/// Returns an error if the value does not serialize to a JSON object.
pub fn encode<T: Serialize>(row: &T) -> serde_json::Result<Record> {
    match serde_json::to_value(row)? {
        Value::Object(record) => Ok(record),
        other => Err(serde::ser::Error::custom(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}
