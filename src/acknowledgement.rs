//! Per-message acknowledgement handles.
//!
//! An [`AcknowledgementCallback`] is bound to exactly one receipt handle and
//! hides how the queue client deletes or re-times a delivery. Clones share
//! state, so the dispatcher and a handler can hold the same callback and the
//! message is still deleted at most once.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::attributes::MAX_VISIBILITY_TIMEOUT_SECONDS;
use crate::client::QueueClient;
use crate::errors::AckError;

const PENDING: u8 = 0;
const IN_PROGRESS: u8 = 1;
const ACKNOWLEDGED: u8 = 2;

/// Acknowledgement handle for a single delivery.
#[derive(Clone)]
pub struct AcknowledgementCallback {
    inner: Arc<Inner>,
}

struct Inner {
    target: Option<Target>,
    state: AtomicU8,
}

struct Target {
    client: Arc<dyn QueueClient>,
    queue_url: Arc<str>,
    receipt_handle: String,
}

impl AcknowledgementCallback {
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue_url: Arc<str>,
        receipt_handle: impl Into<String>,
    ) -> Self {
        AcknowledgementCallback {
            inner: Arc::new(Inner {
                target: Some(Target {
                    client,
                    queue_url,
                    receipt_handle: receipt_handle.into(),
                }),
                state: AtomicU8::new(PENDING),
            }),
        }
    }

    /// A callback for deliveries that did not come from a pollable queue
    /// (push endpoints). Acknowledging it only records the fact.
    pub fn detached() -> Self {
        AcknowledgementCallback {
            inner: Arc::new(Inner {
                target: None,
                state: AtomicU8::new(PENDING),
            }),
        }
    }

    /// Deletes the delivery.
    ///
    /// Calling this again after a successful delete, or while another clone
    /// is deleting, is a no-op. A failed delete leaves the callback pending
    /// so it can be retried.
    pub async fn acknowledge(&self) -> Result<(), AckError> {
        if self
            .inner
            .state
            .compare_exchange(PENDING, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let Some(target) = &self.inner.target else {
            self.inner.state.store(ACKNOWLEDGED, Ordering::Release);
            return Ok(());
        };

        match target
            .client
            .delete_message(&target.queue_url, &target.receipt_handle)
            .await
        {
            Ok(()) => {
                self.inner.state.store(ACKNOWLEDGED, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.inner.state.store(PENDING, Ordering::Release);
                Err(AckError::Delete(e))
            }
        }
    }

    /// Resets the delivery's visibility timeout to `seconds` from now.
    pub async fn extend_visibility(&self, seconds: i32) -> Result<(), AckError> {
        if !(0..=MAX_VISIBILITY_TIMEOUT_SECONDS).contains(&seconds) {
            return Err(AckError::InvalidVisibilityTimeout(seconds));
        }
        if self.is_acknowledged() {
            return Err(AckError::AlreadyAcknowledged);
        }

        let Some(target) = &self.inner.target else {
            return Ok(());
        };

        target
            .client
            .change_message_visibility(&target.queue_url, &target.receipt_handle, seconds)
            .await
            .map_err(AckError::ChangeVisibility)
    }

    /// Makes the delivery visible again immediately instead of waiting for
    /// its visibility timeout to run out.
    pub async fn release(&self) -> Result<(), AckError> {
        self.extend_visibility(0).await
    }

    pub fn is_acknowledged(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == ACKNOWLEDGED
    }

    pub fn receipt_handle(&self) -> Option<&str> {
        self.inner
            .target
            .as_ref()
            .map(|target| target.receipt_handle.as_str())
    }
}

impl fmt::Debug for AcknowledgementCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgementCallback")
            .field("receipt_handle", &self.receipt_handle())
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}
