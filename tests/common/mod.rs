#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::Message;
use parking_lot::Mutex;
use rs_sqs_listener::{QueueAttributes, QueueClient, TransportError};
use tokio::time::Instant;

pub const QUEUE_URL: &str = "https://sqs.us-east-1.amazonaws.com/123456789012/orders";

/// One scripted answer to a receive call.
pub enum Receive {
    Messages(Vec<Message>),
    Fail(&'static str),
}

/// In-memory stand-in for SQS.
///
/// Receives are answered from a per-queue script; once it runs out every
/// receive returns an empty batch after a short wait. Every call is recorded in
/// `log` so tests can check ordering between handlers and acknowledgements.
#[derive(Clone, Default)]
pub struct FakeQueue {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Receive>>>>,
    deletes: Arc<Mutex<Vec<String>>>,
    visibility_changes: Arc<Mutex<Vec<(String, i32)>>>,
    visibility_times: Arc<Mutex<Vec<(String, Instant)>>>,
    log: Arc<Mutex<Vec<String>>>,
    receive_calls: Arc<AtomicUsize>,
    failing_deletes: Arc<AtomicUsize>,
}

pub fn message(id: &str, receipt_handle: &str, body: &str) -> Message {
    Message::builder()
        .message_id(id)
        .receipt_handle(receipt_handle)
        .body(body)
        .build()
}

pub fn attributes(max_messages: i32, wait_time_seconds: i32) -> QueueAttributes {
    QueueAttributes::new(QUEUE_URL, 30, max_messages, wait_time_seconds).unwrap()
}

pub fn attributes_with_visibility(visibility_timeout_seconds: i32) -> QueueAttributes {
    QueueAttributes::new(QUEUE_URL, visibility_timeout_seconds, 10, 0).unwrap()
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, receive: Receive) {
        self.push_to(QUEUE_URL, receive);
    }

    pub fn push_to(&self, queue_url: &str, receive: Receive) {
        self.scripts
            .lock()
            .entry(queue_url.to_string())
            .or_default()
            .push_back(receive);
    }

    pub fn push_messages(&self, messages: Vec<Message>) {
        self.push(Receive::Messages(messages));
    }

    /// Makes the next `count` deletes fail.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().clone()
    }

    pub fn visibility_changes(&self) -> Vec<(String, i32)> {
        self.visibility_changes.lock().clone()
    }

    /// When each visibility change for `receipt_handle` was issued.
    pub fn visibility_times(&self, receipt_handle: &str) -> Vec<Instant> {
        self.visibility_times
            .lock()
            .iter()
            .filter(|(receipt, _)| receipt == receipt_handle)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn client(&self) -> Arc<dyn QueueClient> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl QueueClient for FakeQueue {
    async fn receive_messages(
        &self,
        queue_url: &str,
        _max_messages: i32,
        _wait_time_seconds: i32,
    ) -> Result<Vec<Message>, TransportError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .scripts
            .lock()
            .get_mut(queue_url)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Receive::Messages(messages)) => Ok(messages),
            Some(Receive::Fail(reason)) => Err(TransportError::service("ReceiveMessage", reason)),
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_message(
        &self,
        _queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), TransportError> {
        let failing = self.failing_deletes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_deletes.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::service("DeleteMessage", "service unavailable"));
        }
        self.deletes.lock().push(receipt_handle.to_string());
        self.record(format!("deleted:{receipt_handle}"));
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        _queue_url: &str,
        receipt_handle: &str,
        visibility_timeout_seconds: i32,
    ) -> Result<(), TransportError> {
        self.visibility_changes
            .lock()
            .push((receipt_handle.to_string(), visibility_timeout_seconds));
        self.visibility_times
            .lock()
            .push((receipt_handle.to_string(), Instant::now()));
        Ok(())
    }

    async fn queue_visibility_timeout(
        &self,
        _queue_url: &str,
    ) -> Result<Option<i32>, TransportError> {
        Ok(Some(45))
    }
}

/// Polls `condition` until it holds, panicking after `timeout`.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let result = tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met within {timeout:?}");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
