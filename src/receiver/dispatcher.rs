//! Per-queue poll loop and worker pool.
//!
//! A [`Dispatcher`] owns one queue. While running it long-polls through the
//! [`MessageFetcher`], hands each envelope to the handler on a tokio task
//! and acknowledges it once the handler has returned. A semaphore sized to
//! the configured concurrency caps the number of running handlers; when it
//! is exhausted the loop stops fetching until a slot frees up.
//!
//! Acknowledgement calls that fail in the transport are retried with
//! jittered exponential backoff before they are reported.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashSet;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::config::{AcknowledgementMode, ListenerConfig};
use super::fetcher::MessageFetcher;
use super::functions::MessageHandler;
use super::stats::{EventSink, ListenerEvent, QueueStats, QueueStatsSnapshot};
use crate::acknowledgement::AcknowledgementCallback;
use crate::attributes::QueueAttributes;
use crate::client::QueueClient;
use crate::conversion::{ConversionContext, HeaderMapper, SqsHeaderMapper, SqsMessage};
use crate::errors::{AckError, ConfigurationError, HandlerError, ListenerError};
use crate::message::MessageEnvelope;

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;
const DRAINING: u8 = 2;

/// Lifecycle of a dispatcher: `Stopped → Running → Draining → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Running,
    Draining,
}

impl DispatcherState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            RUNNING => DispatcherState::Running,
            DRAINING => DispatcherState::Draining,
            _ => DispatcherState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherState::Stopped => "stopped",
            DispatcherState::Running => "running",
            DispatcherState::Draining => "draining",
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    tracker: TaskTracker,
    task: JoinHandle<()>,
}

/// What a call to `stop` has to do, decided under the run lock.
enum StopRole {
    Drain(RunHandle),
    Join(TaskTracker),
    Idle,
}

/// Polls one queue and runs its handler with bounded concurrency.
pub struct Dispatcher {
    attributes: Arc<QueueAttributes>,
    queue_url: Arc<str>,
    client: Arc<dyn QueueClient>,
    fetcher: MessageFetcher,
    handler: Arc<dyn MessageHandler>,
    mapper: Arc<dyn HeaderMapper>,
    config: ListenerConfig,
    permits: Arc<Semaphore>,
    in_flight_ids: DashSet<String>,
    stats: Arc<QueueStats>,
    events: EventSink,
    state: AtomicU8,
    paused: watch::Sender<bool>,
    run: Mutex<Option<RunHandle>>,
    /// Handler tasks of the run currently draining, for concurrent `stop` calls.
    draining: Mutex<Option<TaskTracker>>,
}

impl Dispatcher {
    /// Creates a stopped dispatcher with the default header mapping and its
    /// own event channel.
    pub fn new(
        attributes: QueueAttributes,
        client: Arc<dyn QueueClient>,
        handler: Arc<dyn MessageHandler>,
        config: ListenerConfig,
    ) -> Result<Arc<Self>, ConfigurationError> {
        Self::with_parts(
            attributes,
            client,
            handler,
            Arc::new(SqsHeaderMapper),
            config,
            EventSink::new(64),
        )
    }

    pub(crate) fn with_parts(
        attributes: QueueAttributes,
        client: Arc<dyn QueueClient>,
        handler: Arc<dyn MessageHandler>,
        mapper: Arc<dyn HeaderMapper>,
        config: ListenerConfig,
        events: EventSink,
    ) -> Result<Arc<Self>, ConfigurationError> {
        config.validate()?;

        let (paused, _) = watch::channel(false);
        Ok(Arc::new(Dispatcher {
            queue_url: Arc::from(attributes.queue_url()),
            attributes: Arc::new(attributes),
            fetcher: MessageFetcher::new(Arc::clone(&client)),
            client,
            handler,
            mapper,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
            in_flight_ids: DashSet::new(),
            stats: Arc::new(QueueStats::default()),
            events,
            state: AtomicU8::new(STOPPED),
            paused,
            run: Mutex::new(None),
            draining: Mutex::new(None),
        }))
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn attributes(&self) -> &QueueAttributes {
        &self.attributes
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Number of handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.events.subscribe()
    }

    /// Begins polling on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::InvalidState`] unless the dispatcher is
    /// stopped, and [`ListenerError::NoRuntime`] when called outside a
    /// tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), ListenerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ListenerError::NoRuntime(self.queue_url.to_string()))?;

        let mut run = self.run.lock();
        if let Err(current) =
            self.state
                .compare_exchange(STOPPED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(ListenerError::InvalidState {
                queue_url: self.queue_url.to_string(),
                state: DispatcherState::from_raw(current).as_str(),
            });
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let task = runtime.spawn(Arc::clone(self).poll_loop(cancel.clone(), tracker.clone()));
        *run = Some(RunHandle {
            cancel,
            tracker,
            task,
        });

        info!(
            queue_url = %self.queue_url,
            concurrency = self.config.concurrency,
            max_messages_per_poll = self.attributes.max_messages_per_poll(),
            wait_time_seconds = self.attributes.wait_time_seconds(),
            "Dispatcher started"
        );
        Ok(())
    }

    /// Stops polling and waits up to `timeout` for in-flight handlers.
    ///
    /// Handlers see their shutdown signal cancelled right away but are never
    /// aborted. Returns `true` when nothing was left running at the end.
    /// A call made while another one is draining waits on the same handlers.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let role = {
            let mut run = self.run.lock();
            match self.state.compare_exchange(
                RUNNING,
                DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => match run.take() {
                    Some(handle) => {
                        *self.draining.lock() = Some(handle.tracker.clone());
                        StopRole::Drain(handle)
                    }
                    None => {
                        self.state.store(STOPPED, Ordering::Release);
                        return true;
                    }
                },
                Err(DRAINING) => match self.draining.lock().clone() {
                    Some(tracker) => StopRole::Join(tracker),
                    None => StopRole::Idle,
                },
                Err(_) => StopRole::Idle,
            }
        };

        let RunHandle {
            cancel,
            tracker,
            task,
        } = match role {
            StopRole::Drain(handle) => handle,
            StopRole::Join(tracker) => {
                debug!(queue_url = %self.queue_url, "Waiting for drain already in progress");
                let finished = tokio::time::timeout_at(deadline, tracker.wait())
                    .await
                    .is_ok();
                return finished || self.in_flight() == 0;
            }
            StopRole::Idle => return self.in_flight() == 0,
        };

        info!(
            queue_url = %self.queue_url,
            in_flight = self.in_flight(),
            "Dispatcher draining"
        );
        cancel.cancel();

        let queue_url = Arc::clone(&self.queue_url);
        let finished = tokio::time::timeout_at(deadline, async move {
            if let Err(e) = task.await {
                error!(queue_url = %queue_url, error = %e, "Poll loop task failed");
            }
            tracker.close();
            tracker.wait().await;
        })
        .await
        .is_ok();
        let drained = finished || self.in_flight() == 0;

        if !drained {
            let in_flight = self.in_flight();
            warn!(
                queue_url = %self.queue_url,
                in_flight,
                "Drain deadline elapsed with handlers still running"
            );
            self.events.publish(ListenerEvent::DrainTimedOut {
                queue_url: Arc::clone(&self.queue_url),
                in_flight,
            });
        }

        {
            let _run = self.run.lock();
            self.draining.lock().take();
            self.state.store(STOPPED, Ordering::Release);
        }
        info!(queue_url = %self.queue_url, drained, "Dispatcher stopped");
        drained
    }

    /// Stops fetching new batches; running handlers are unaffected.
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!(queue_url = %self.queue_url, "Dispatcher paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!(queue_url = %self.queue_url, "Dispatcher resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken, tracker: TaskTracker) {
        let mut paused = self.paused.subscribe();
        let mut consecutive_failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if *paused.borrow_and_update() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            // Every slot is busy: wait for one to free up before fetching more.
            if self.permits.available_permits() == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(&self.permits).acquire_owned() => {
                        if permit.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.fetcher.poll(&self.attributes) => polled,
            };

            match polled {
                Ok(batch) => {
                    if consecutive_failures > 0 {
                        info!(
                            queue_url = %self.queue_url,
                            previous_failures = consecutive_failures,
                            "Polling recovered after consecutive failures"
                        );
                    }
                    consecutive_failures = 0;

                    if batch.is_empty() {
                        continue;
                    }

                    debug!(
                        queue_url = %self.queue_url,
                        message_count = batch.len(),
                        "Received messages"
                    );
                    self.stats.record_received(batch.len());
                    self.dispatch_batch(batch, &cancel, &tracker).await;
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.stats.record_transport_failure();
                    let backoff = self.config.poll_backoff(consecutive_failures);

                    error!(
                        queue_url = %self.queue_url,
                        error = %e,
                        consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to receive messages, backing off"
                    );
                    if consecutive_failures % self.config.max_poll_attempts == 0 {
                        self.events.publish(ListenerEvent::PollFailed {
                            queue_url: Arc::clone(&self.queue_url),
                            attempts: consecutive_failures,
                            error: e.to_string(),
                        });
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        // No handler is spawned past this point.
        tracker.close();
        debug!(queue_url = %self.queue_url, "Poll loop exited");
    }

    async fn dispatch_batch(
        self: &Arc<Self>,
        batch: Vec<MessageEnvelope>,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) {
        let mut pending: VecDeque<(MessageEnvelope, AcknowledgementCallback)> = batch
            .into_iter()
            .filter_map(|envelope| {
                if !self.in_flight_ids.insert(envelope.id().to_string()) {
                    debug!(
                        queue_url = %self.queue_url,
                        message_id = %envelope.id(),
                        "Message is already being handled, skipping duplicate delivery"
                    );
                    return None;
                }
                let callback = AcknowledgementCallback::new(
                    Arc::clone(&self.client),
                    Arc::clone(&self.queue_url),
                    envelope.receipt_handle(),
                );
                Some((envelope, callback))
            })
            .collect();

        // Every message still waiting was part of the last extension, so one
        // timestamp covers the whole batch.
        let mut last_extended: Option<Instant> = None;
        while let Some((envelope, callback)) = pending.pop_front() {
            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::Closed) => None,
                Err(TryAcquireError::NoPermits) => {
                    self.wait_for_slot(&envelope, &callback, &pending, &mut last_extended, cancel)
                        .await
                }
            };

            let Some(permit) = permit else {
                pending.push_front((envelope, callback));
                self.release_remaining(pending).await;
                return;
            };

            // Count the handler before re-checking cancellation so a concurrent
            // `stop` either sees it in flight or the loop backs out.
            self.stats.enter_handler();
            if cancel.is_cancelled() {
                self.stats.exit_handler();
                drop(permit);
                pending.push_front((envelope, callback));
                self.release_remaining(pending).await;
                return;
            }

            self.spawn_handler(envelope, callback, permit, cancel.clone(), tracker);
        }
    }

    /// Waits for a worker slot while keeping the held messages invisible.
    ///
    /// Held messages are extended to the queue's visibility timeout and
    /// extended again every half timeout until a slot frees up. Returns
    /// `None` when draining starts first.
    async fn wait_for_slot(
        &self,
        envelope: &MessageEnvelope,
        callback: &AcknowledgementCallback,
        pending: &VecDeque<(MessageEnvelope, AcknowledgementCallback)>,
        last_extended: &mut Option<Instant>,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        let interval = self.held_extension_interval();

        loop {
            let due = match *last_extended {
                Some(at) if at.elapsed() < interval => at + interval,
                _ => {
                    self.extend_held(envelope, callback).await;
                    for (envelope, callback) in pending {
                        self.extend_held(envelope, callback).await;
                    }
                    let now = Instant::now();
                    *last_extended = Some(now);
                    now + interval
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                permit = Arc::clone(&self.permits).acquire_owned() => return permit.ok(),
                _ = tokio::time::sleep_until(due) => {}
            }
        }
    }

    fn held_extension_interval(&self) -> Duration {
        Duration::from_millis(self.attributes.visibility_timeout_seconds() as u64 * 500)
    }

    fn spawn_handler(
        self: &Arc<Self>,
        envelope: MessageEnvelope,
        callback: AcknowledgementCallback,
        permit: OwnedSemaphorePermit,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let dispatcher = Arc::clone(self);
        tracker.spawn(async move {
            let _permit = permit;
            dispatcher.process(envelope, callback, shutdown).await;
            dispatcher.stats.exit_handler();
        });
    }

    async fn process(
        &self,
        envelope: MessageEnvelope,
        callback: AcknowledgementCallback,
        shutdown: CancellationToken,
    ) {
        let message_id = envelope.id().to_string();
        let context = ConversionContext::new(
            Arc::clone(&self.attributes),
            Arc::clone(&self.client),
            callback.clone(),
        );
        let message = SqsMessage::convert(envelope, context, self.mapper.as_ref(), shutdown);

        debug!(queue_url = %self.queue_url, message_id = %message_id, "Handling message");

        match self.invoke(message).await {
            Ok(()) => {
                self.stats.record_processed();
                match self.config.acknowledgement_mode {
                    AcknowledgementMode::Manual => {
                        if callback.is_acknowledged() {
                            self.stats.record_acknowledged();
                        }
                    }
                    AcknowledgementMode::OnSuccess | AcknowledgementMode::Always => {
                        self.acknowledge(&message_id, &callback).await;
                    }
                }
            }
            Err(e) => {
                self.stats.record_handler_failure();
                warn!(
                    queue_url = %self.queue_url,
                    message_id = %message_id,
                    error = %e,
                    "Handler failed, message left for redelivery"
                );
                self.events.publish(ListenerEvent::HandlerFailed {
                    queue_url: Arc::clone(&self.queue_url),
                    message_id: message_id.clone(),
                    error: e.to_string(),
                });

                if self.config.acknowledgement_mode == AcknowledgementMode::Always {
                    self.acknowledge(&message_id, &callback).await;
                } else if self.config.release_on_failure && !callback.is_acknowledged() {
                    if let Err(e) = self
                        .with_ack_retry(&message_id, || callback.release())
                        .await
                    {
                        self.report_ack_failure(&message_id, &e);
                    }
                }
            }
        }

        self.in_flight_ids.remove(&message_id);
    }

    async fn invoke(&self, message: SqsMessage) -> Result<(), HandlerError> {
        let handling = AssertUnwindSafe(self.handler.handle(message)).catch_unwind();

        let outcome = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, handling).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(HandlerError::TimedOut(limit)),
            },
            None => handling.await,
        };

        outcome.unwrap_or_else(|panic| {
            let reason = panic
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| panic.downcast_ref::<&str>().copied())
                .unwrap_or("unknown panic");
            Err(HandlerError::Panicked(reason.to_string()))
        })
    }

    /// Runs an acknowledgement call, retrying transport failures.
    async fn with_ack_retry<F, Fut>(
        &self,
        message_id: &str,
        mut operation: F,
    ) -> Result<(), AckError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), AckError>>,
    {
        let mut attempt = 0u32;
        RetryIf::spawn(
            self.config.ack_retry_strategy(),
            || {
                attempt += 1;
                if attempt > 1 {
                    debug!(
                        queue_url = %self.queue_url,
                        message_id = %message_id,
                        attempt,
                        "Retrying acknowledgement"
                    );
                }
                operation()
            },
            AckError::is_transport,
        )
        .await
    }

    async fn acknowledge(&self, message_id: &str, callback: &AcknowledgementCallback) {
        match self.with_ack_retry(message_id, || callback.acknowledge()).await {
            Ok(()) => {
                self.stats.record_acknowledged();
                debug!(queue_url = %self.queue_url, message_id = %message_id, "Message acknowledged");
            }
            Err(e) => self.report_ack_failure(message_id, &e),
        }
    }

    async fn extend_held(&self, envelope: &MessageEnvelope, callback: &AcknowledgementCallback) {
        let seconds = self.attributes.visibility_timeout_seconds();
        match self
            .with_ack_retry(envelope.id(), || callback.extend_visibility(seconds))
            .await
        {
            Ok(()) => debug!(
                queue_url = %self.queue_url,
                message_id = %envelope.id(),
                visibility_timeout_seconds = seconds,
                "All workers busy, extended visibility of held message"
            ),
            Err(e) => self.report_ack_failure(envelope.id(), &e),
        }
    }

    /// Hands undispatched messages back to the queue when draining begins.
    async fn release_remaining(
        &self,
        pending: VecDeque<(MessageEnvelope, AcknowledgementCallback)>,
    ) {
        debug!(
            queue_url = %self.queue_url,
            message_count = pending.len(),
            "Releasing messages that were not dispatched before draining"
        );
        for (envelope, callback) in pending {
            if let Err(e) = self.with_ack_retry(envelope.id(), || callback.release()).await {
                self.report_ack_failure(envelope.id(), &e);
            }
            self.in_flight_ids.remove(envelope.id());
        }
    }

    fn report_ack_failure(&self, message_id: &str, error: &AckError) {
        self.stats.record_ack_failure();
        warn!(
            queue_url = %self.queue_url,
            message_id = %message_id,
            error = %error,
            "Acknowledgement failed, message left for redelivery"
        );
        self.events.publish(ListenerEvent::AcknowledgementFailed {
            queue_url: Arc::clone(&self.queue_url),
            message_id: message_id.to_string(),
            error: error.to_string(),
        });
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_url", &self.queue_url)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
