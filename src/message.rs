use std::collections::HashMap;
use std::str::Utf8Error;

use aws_sdk_sqs::types::Message;
use chrono::{DateTime, Utc};

/// A single delivery of a queue message.
///
/// Each receive of the same message yields a new envelope with a new
/// receipt handle; the envelope is consumed by exactly one handler and
/// dropped once its acknowledgement completes.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    id: String,
    receipt_handle: String,
    body: Vec<u8>,
    attributes: HashMap<String, String>,
    received_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(
        id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<Vec<u8>>,
        attributes: HashMap<String, String>,
    ) -> Self {
        MessageEnvelope {
            id: id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            attributes,
            received_at: Utc::now(),
        }
    }

    /// Converts a wire message into an envelope.
    ///
    /// System attributes and string-valued message attributes are merged
    /// into one map; binary message attributes are dropped. Returns `None`
    /// when the message has no id or no receipt handle, since such a
    /// delivery could never be acknowledged.
    pub fn from_sqs(message: Message) -> Option<Self> {
        let id = message.message_id?;
        let receipt_handle = message.receipt_handle?;

        let mut attributes = HashMap::new();
        for (name, value) in message.attributes.unwrap_or_default() {
            attributes.insert(name.as_str().to_string(), value);
        }
        for (name, value) in message.message_attributes.unwrap_or_default() {
            if let Some(text) = value.string_value {
                attributes.insert(name, text);
            }
        }

        Some(MessageEnvelope::new(
            id,
            receipt_handle,
            message.body.unwrap_or_default(),
            attributes,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as UTF-8 text, which is what SQS carries on the wire.
    pub fn body_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
