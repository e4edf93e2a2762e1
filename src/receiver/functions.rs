use crate::conversion::SqsMessage;
use crate::errors::HandlerError;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Trait for implementing asynchronous SQS message handlers.
///
/// The dispatcher calls `handle` once per delivery. Returning `Ok(())`
/// lets the message be acknowledged (depending on the
/// [`AcknowledgementMode`](super::config::AcknowledgementMode)); returning an
/// error leaves it on the queue until its visibility timeout expires.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Processes a single message.
    ///
    /// # Arguments
    ///
    /// * `message` - The converted message, including its acknowledgement context
    async fn handle(&self, message: SqsMessage) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, message: SqsMessage) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

#[async_trait]
impl<RFn, Fut, TShared> MessageHandler for MessageHandlerFn<RFn, Fut, TShared>
where
    RFn: Fn(SqsMessage, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    async fn handle(&self, message: SqsMessage) -> Result<(), HandlerError> {
        (self.rv_fn)(message, self.shared_resources.clone()).await
    }
}

/// Implementation of [`MessageHandler`] backed by a plain async function.
///
/// This struct wraps a user-provided function and a shared resource that is
/// cloned into every call.
///
/// # Type Parameters
///
/// * `RFn` - The message handler function type
/// * `Fut` - The future returned by the handler function
/// * `TShared` - The type of shared resources passed to the handler
pub struct MessageHandlerFn<RFn, Fut, TShared>
where
    RFn: Fn(SqsMessage, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    rv_fn: RFn,
    shared_resources: TShared,
    _future: PhantomData<fn() -> Fut>,
}

impl<RFn, Fut, TShared> MessageHandlerFn<RFn, Fut, TShared>
where
    RFn: Fn(SqsMessage, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    /// Creates a new handler from a function and the resources shared
    /// between its calls.
    ///
    /// # Arguments
    ///
    /// * `rv_fn` - The message handler function
    /// * `shared_resources` - Resources cloned into every call
    pub fn new(rv_fn: RFn, shared_resources: TShared) -> Self {
        MessageHandlerFn {
            rv_fn,
            shared_resources,
            _future: PhantomData,
        }
    }
}
