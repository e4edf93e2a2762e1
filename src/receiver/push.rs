use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::functions::MessageHandler;
use crate::acknowledgement::AcknowledgementCallback;
use crate::attributes::QueueAttributes;
use crate::client::QueueClient;
use crate::conversion::{ConversionContext, HeaderMapper, SqsHeaderMapper, SqsMessage};
use crate::errors::HandlerError;
use crate::message::MessageEnvelope;

/// Feeds externally delivered payloads into a handler.
///
/// Push-style transports (for example an HTTP notification endpoint) have
/// no receipt handle to delete; their envelopes go through the same
/// conversion and handler as polled ones, with a detached acknowledgement.
/// The caller decides how to answer the sender based on the returned result.
pub struct PushAdapter {
    attributes: Arc<QueueAttributes>,
    client: Arc<dyn QueueClient>,
    handler: Arc<dyn MessageHandler>,
    mapper: Arc<dyn HeaderMapper>,
    shutdown: CancellationToken,
}

impl PushAdapter {
    pub fn new(
        attributes: QueueAttributes,
        client: Arc<dyn QueueClient>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        PushAdapter {
            attributes: Arc::new(attributes),
            client,
            handler,
            mapper: Arc::new(SqsHeaderMapper),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_header_mapper(mut self, mapper: Arc<dyn HeaderMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Runs the handler for one pushed envelope.
    #[tracing::instrument(skip_all, fields(message_id = %envelope.id()))]
    pub async fn deliver(&self, envelope: MessageEnvelope) -> Result<(), HandlerError> {
        let context = ConversionContext::new(
            Arc::clone(&self.attributes),
            Arc::clone(&self.client),
            AcknowledgementCallback::detached(),
        );
        let message = SqsMessage::convert(
            envelope,
            context,
            self.mapper.as_ref(),
            self.shutdown.child_token(),
        );

        let result = self.handler.handle(message).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Handler failed for pushed message");
        }
        result
    }

    /// Cancels the shutdown signal seen by handlers of pushed messages.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
