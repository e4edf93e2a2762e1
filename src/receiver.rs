use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tokio::sync::broadcast;

use crate::attributes::QueueAttributes;
use crate::client::QueueClient;
use crate::conversion::{HeaderMapper, SqsHeaderMapper, SqsMessage};
use crate::errors::{ConfigurationError, HandlerError, ListenerError};

pub mod config;
pub mod dispatcher;
pub mod fetcher;
mod functions;
pub mod push;
pub mod stats;

pub use config::{AcknowledgementMode, ListenerConfig};
pub use dispatcher::{Dispatcher, DispatcherState};
pub use fetcher::MessageFetcher;
pub use functions::{MessageHandler, MessageHandlerFn};
pub use push::PushAdapter;
pub use stats::{ListenerEvent, QueueStatsSnapshot};

use stats::EventSink;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Owns one [`Dispatcher`] per registered queue.
///
/// The container is built around an explicitly owned queue client that is
/// shared by every dispatcher; dropping the container (after
/// [`shutdown`](Self::shutdown)) releases it.
pub struct ListenerContainer {
    /// The client used by every dispatcher for receive and acknowledgement calls.
    client: Arc<dyn QueueClient>,

    /// Configuration used by `register` and `add_handler_fn`.
    defaults: ListenerConfig,

    mapper: Arc<dyn HeaderMapper>,
    dispatchers: DashMap<String, Arc<Dispatcher>>,
    events: EventSink,
}

/// Outcome of [`ListenerContainer::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queues whose in-flight handlers all finished before the deadline.
    pub drained: Vec<String>,
    /// Queues that still had handlers running when the deadline elapsed.
    pub not_drained: Vec<String>,
}

impl ShutdownReport {
    pub fn is_complete(&self) -> bool {
        self.not_drained.is_empty()
    }
}

impl ListenerContainer {
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        ListenerContainer {
            client,
            defaults: ListenerConfig::default(),
            mapper: Arc::new(SqsHeaderMapper),
            dispatchers: DashMap::new(),
            events: EventSink::new(DEFAULT_EVENT_CAPACITY),
        }
    }

    pub fn from_sqs_client(sqs_client: aws_sdk_sqs::Client) -> Self {
        Self::new(Arc::new(sqs_client))
    }

    pub fn with_default_config(mut self, config: ListenerConfig) -> Self {
        self.defaults = config;
        self
    }

    pub fn with_header_mapper(mut self, mapper: Arc<dyn HeaderMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Sets how many unread events a slow subscriber may lag behind.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = EventSink::new(capacity);
        self
    }

    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    /// Registers `handler` for the queue and starts polling it right away
    /// on the current tokio runtime.
    ///
    /// Uses the container's default configuration with `concurrency`
    /// handlers at most.
    pub fn register(
        &self,
        attributes: QueueAttributes,
        handler: impl MessageHandler,
        concurrency: usize,
    ) -> Result<(), ListenerError> {
        let config = self.defaults.clone().with_concurrency(concurrency);
        self.register_with_config(attributes, Arc::new(handler), config)
    }

    /// Registers a handler with its own configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] when the configuration is invalid or
    /// the queue already has a listener, and [`ListenerError::NoRuntime`]
    /// when called outside a tokio runtime; nothing is registered then.
    pub fn register_with_config(
        &self,
        attributes: QueueAttributes,
        handler: Arc<dyn MessageHandler>,
        config: ListenerConfig,
    ) -> Result<(), ListenerError> {
        let queue_url = attributes.queue_url().to_string();

        match self.dispatchers.entry(queue_url) {
            Entry::Occupied(entry) => {
                Err(ConfigurationError::DuplicateQueue(entry.key().clone()).into())
            }
            Entry::Vacant(entry) => {
                let dispatcher = Dispatcher::with_parts(
                    attributes,
                    Arc::clone(&self.client),
                    handler,
                    Arc::clone(&self.mapper),
                    config,
                    self.events.clone(),
                )?;
                dispatcher.start()?;
                entry.insert(dispatcher);
                Ok(())
            }
        }
    }

    /// Registers an async function together with a resource cloned into each call.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use rs_sqs_listener::{attributes::QueueAttributes, client, receiver::ListenerContainer};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let container = ListenerContainer::from_sqs_client(client::create_sqs_client_from_env().await);
    ///     let attributes = QueueAttributes::new(
    ///         "https://sqs.us-east-1.amazonaws.com/123456789012/orders", 30, 10, 20,
    ///     )?;
    ///
    ///     container.add_handler_fn(
    ///         attributes,
    ///         |message, prefix: String| async move {
    ///             println!("{prefix}: {}", message.body_text());
    ///             Ok(())
    ///         },
    ///         "orders".to_string(),
    ///         Some(4),
    ///     )?;
    ///
    ///     let report = container.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await;
    ///     println!("drained: {:?}", report.drained);
    ///     Ok(())
    /// }
    /// ```
    pub fn add_handler_fn<RFn, Fut, TShared>(
        &self,
        attributes: QueueAttributes,
        rv_fn: RFn,
        shared_resources: TShared,
        concurrency: Option<usize>,
    ) -> Result<(), ListenerError>
    where
        RFn: Fn(SqsMessage, TShared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
        TShared: Send + Sync + Clone + 'static,
    {
        let concurrency = concurrency.unwrap_or(self.defaults.concurrency);
        self.register(
            attributes,
            MessageHandlerFn::new(rv_fn, shared_resources),
            concurrency,
        )
    }

    pub fn dispatcher(&self, queue_url: &str) -> Option<Arc<Dispatcher>> {
        self.dispatchers
            .get(queue_url)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn queue_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .dispatchers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        urls.sort();
        urls
    }

    pub fn pause(&self, queue_url: &str) -> Result<(), ListenerError> {
        self.require(queue_url)?.pause();
        Ok(())
    }

    pub fn resume(&self, queue_url: &str) -> Result<(), ListenerError> {
        self.require(queue_url)?.resume();
        Ok(())
    }

    /// Drains a single queue; see [`Dispatcher::stop`].
    pub async fn stop(&self, queue_url: &str, timeout: Duration) -> Result<bool, ListenerError> {
        let dispatcher = self.require(queue_url)?;
        Ok(dispatcher.stop(timeout).await)
    }

    pub fn stats(&self, queue_url: &str) -> Option<QueueStatsSnapshot> {
        self.dispatchers
            .get(queue_url)
            .map(|entry| entry.value().stats())
    }

    /// Subscribes to failure events of every queue in the container.
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.events.subscribe()
    }

    /// Stops every dispatcher concurrently, waiting up to `timeout` for
    /// each to drain.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let dispatchers: Vec<Arc<Dispatcher>> = self
            .dispatchers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        tracing::info!(
            queues = dispatchers.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Shutting down listener container"
        );

        let outcomes = join_all(dispatchers.iter().map(|dispatcher| async move {
            let drained = dispatcher.stop(timeout).await;
            (dispatcher.queue_url().to_string(), drained)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (queue_url, drained) in outcomes {
            if drained {
                report.drained.push(queue_url);
            } else {
                report.not_drained.push(queue_url);
            }
        }
        report.drained.sort();
        report.not_drained.sort();

        if !report.is_complete() {
            tracing::warn!(
                not_drained = ?report.not_drained,
                "Listener container shut down with queues still draining"
            );
        }
        report
    }

    /// Runs until `signal` completes, then shuts down with the default
    /// configuration's shutdown timeout.
    pub async fn run_until<F>(&self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        signal.await;
        tracing::info!("Shutdown signal received");
        self.shutdown(self.defaults.shutdown_timeout).await
    }

    fn require(&self, queue_url: &str) -> Result<Arc<Dispatcher>, ListenerError> {
        self.dispatcher(queue_url)
            .ok_or_else(|| ListenerError::UnknownQueue(queue_url.to_string()))
    }
}
