//! Message conversion: from a received envelope to what a handler sees.
//!
//! The dispatcher builds one [`ConversionContext`] per delivery and hands it
//! to a [`HeaderMapper`] together with the envelope. The context carries
//! everything acknowledgement-related, so mappers never need a client of
//! their own.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::acknowledgement::AcknowledgementCallback;
use crate::attributes::QueueAttributes;
use crate::client::QueueClient;
use crate::errors::AckError;
use crate::message::MessageEnvelope;

/// Header names produced by [`SqsHeaderMapper`].
pub mod headers {
    pub const MESSAGE_ID: &str = "sqs.message-id";
    pub const RECEIPT_HANDLE: &str = "sqs.receipt-handle";
    pub const QUEUE_URL: &str = "sqs.queue-url";
    pub const VISIBILITY_TIMEOUT: &str = "sqs.visibility-timeout";
    pub const RECEIVED_AT: &str = "sqs.received-at";
}

/// Per-delivery bundle threaded through conversion.
#[derive(Clone)]
pub struct ConversionContext {
    queue_attributes: Arc<QueueAttributes>,
    client: Arc<dyn QueueClient>,
    acknowledgement: AcknowledgementCallback,
}

impl ConversionContext {
    pub fn new(
        queue_attributes: Arc<QueueAttributes>,
        client: Arc<dyn QueueClient>,
        acknowledgement: AcknowledgementCallback,
    ) -> Self {
        ConversionContext {
            queue_attributes,
            client,
            acknowledgement,
        }
    }

    pub fn queue_attributes(&self) -> &QueueAttributes {
        &self.queue_attributes
    }

    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    pub fn acknowledgement(&self) -> &AcknowledgementCallback {
        &self.acknowledgement
    }
}

/// Maps an envelope and its context into message headers.
pub trait HeaderMapper: Send + Sync {
    fn map_headers(
        &self,
        envelope: &MessageEnvelope,
        context: &ConversionContext,
    ) -> HashMap<String, String>;
}

/// Default mapper: every envelope attribute plus the `sqs.*` headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqsHeaderMapper;

impl HeaderMapper for SqsHeaderMapper {
    fn map_headers(
        &self,
        envelope: &MessageEnvelope,
        context: &ConversionContext,
    ) -> HashMap<String, String> {
        let mut headers = envelope.attributes().clone();
        let attributes = context.queue_attributes();

        headers.insert(headers::MESSAGE_ID.to_string(), envelope.id().to_string());
        headers.insert(
            headers::RECEIPT_HANDLE.to_string(),
            envelope.receipt_handle().to_string(),
        );
        headers.insert(
            headers::QUEUE_URL.to_string(),
            attributes.queue_url().to_string(),
        );
        headers.insert(
            headers::VISIBILITY_TIMEOUT.to_string(),
            attributes.visibility_timeout_seconds().to_string(),
        );
        headers.insert(
            headers::RECEIVED_AT.to_string(),
            envelope.received_at().to_rfc3339(),
        );
        headers
    }
}

/// A converted message as handed to a handler.
#[derive(Clone)]
pub struct SqsMessage {
    envelope: MessageEnvelope,
    headers: HashMap<String, String>,
    context: ConversionContext,
    shutdown: CancellationToken,
}

impl SqsMessage {
    /// Converts `envelope` with `mapper`.
    pub fn convert(
        envelope: MessageEnvelope,
        context: ConversionContext,
        mapper: &dyn HeaderMapper,
        shutdown: CancellationToken,
    ) -> Self {
        let headers = mapper.map_headers(&envelope, &context);
        SqsMessage {
            envelope,
            headers,
            context,
            shutdown,
        }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub fn id(&self) -> &str {
        self.envelope.id()
    }

    pub fn body(&self) -> &[u8] {
        self.envelope.body()
    }

    /// The body as text; invalid UTF-8 is replaced lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(self.envelope.body()).into_owned()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn context(&self) -> &ConversionContext {
        &self.context
    }

    /// Acknowledges the message now. Required in manual acknowledgement mode,
    /// harmless otherwise.
    pub async fn acknowledge(&self) -> Result<(), AckError> {
        self.context.acknowledgement().acknowledge().await
    }

    /// Extends the message's visibility for long-running work.
    pub async fn extend_visibility(&self, seconds: i32) -> Result<(), AckError> {
        self.context.acknowledgement().extend_visibility(seconds).await
    }

    /// Signal cancelled when the owning dispatcher starts draining.
    /// Handlers that watch it can stop early; others simply run to completion.
    pub fn shutdown_signal(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl std::fmt::Debug for SqsMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsMessage")
            .field("envelope", &self.envelope)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
