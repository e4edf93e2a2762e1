use std::sync::Arc;

use crate::attributes::QueueAttributes;
use crate::client::QueueClient;
use crate::errors::TransportError;
use crate::message::MessageEnvelope;

/// Issues long-poll receives and turns wire messages into envelopes.
#[derive(Clone)]
pub struct MessageFetcher {
    client: Arc<dyn QueueClient>,
}

impl MessageFetcher {
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        MessageFetcher { client }
    }

    /// Receives at most `max_messages_per_poll` envelopes, waiting up to the
    /// queue's wait time for the first one.
    ///
    /// An empty batch means the wait elapsed without messages and is not an
    /// error. Wire messages that cannot be acknowledged are dropped with a
    /// warning; SQS will redeliver them after their visibility timeout.
    pub async fn poll(
        &self,
        attributes: &QueueAttributes,
    ) -> Result<Vec<MessageEnvelope>, TransportError> {
        let max_messages = attributes.max_messages_per_poll();
        let messages = self
            .client
            .receive_messages(
                attributes.queue_url(),
                max_messages,
                attributes.effective_wait_time_seconds(),
            )
            .await?;

        let mut envelopes = Vec::with_capacity(messages.len());
        for message in messages {
            if envelopes.len() >= max_messages as usize {
                tracing::warn!(
                    queue_url = %attributes.queue_url(),
                    max_messages,
                    "Receive returned more messages than requested, ignoring the rest"
                );
                break;
            }
            let message_id = message.message_id.clone();
            match MessageEnvelope::from_sqs(message) {
                Some(envelope) => envelopes.push(envelope),
                None => tracing::warn!(
                    queue_url = %attributes.queue_url(),
                    message_id = ?message_id,
                    "Received a message without id or receipt handle, skipping"
                ),
            }
        }

        Ok(envelopes)
    }
}
