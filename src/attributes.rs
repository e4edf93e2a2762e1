use std::sync::Arc;

use crate::client::QueueClient;
use crate::errors::{ConfigurationError, ListenerError};

/// Largest visibility timeout SQS accepts (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: i32 = 43_200;

/// Largest batch a single `ReceiveMessage` call may return.
pub const MAX_MESSAGES_PER_POLL: i32 = 10;

/// Longest long-poll wait SQS honors.
pub const MAX_WAIT_TIME_SECONDS: i32 = 20;

/// Visibility timeout SQS assigns to queues created without one.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: i32 = 30;

/// Polling-relevant metadata of a single queue.
///
/// Built once at registration and shared read-only by the fetcher, the
/// dispatcher and every conversion context of that queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAttributes {
    queue_url: String,
    visibility_timeout_seconds: i32,
    max_messages_per_poll: i32,
    wait_time_seconds: i32,
}

impl QueueAttributes {
    /// Validates and builds a snapshot of the queue's polling settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the url is empty, the visibility
    /// timeout is outside `1..=43200`, the batch size is outside `1..=10`
    /// or the wait time is negative.
    pub fn new(
        queue_url: impl Into<String>,
        visibility_timeout_seconds: i32,
        max_messages_per_poll: i32,
        wait_time_seconds: i32,
    ) -> Result<Self, ConfigurationError> {
        let queue_url = queue_url.into();
        if queue_url.trim().is_empty() {
            return Err(ConfigurationError::EmptyQueueUrl);
        }
        if !(1..=MAX_VISIBILITY_TIMEOUT_SECONDS).contains(&visibility_timeout_seconds) {
            return Err(ConfigurationError::InvalidVisibilityTimeout(
                visibility_timeout_seconds,
            ));
        }
        if !(1..=MAX_MESSAGES_PER_POLL).contains(&max_messages_per_poll) {
            return Err(ConfigurationError::InvalidMaxMessages(max_messages_per_poll));
        }
        if wait_time_seconds < 0 {
            return Err(ConfigurationError::InvalidWaitTime(wait_time_seconds));
        }

        Ok(QueueAttributes {
            queue_url,
            visibility_timeout_seconds,
            max_messages_per_poll,
            wait_time_seconds,
        })
    }

    /// Builds the attributes using the visibility timeout configured on the
    /// queue itself, falling back to the SQS default when the client cannot
    /// report it.
    pub async fn resolve(
        client: &Arc<dyn QueueClient>,
        queue_url: impl Into<String>,
        max_messages_per_poll: i32,
        wait_time_seconds: i32,
    ) -> Result<Self, ListenerError> {
        let queue_url = queue_url.into();
        let visibility_timeout = client
            .queue_visibility_timeout(&queue_url)
            .await?
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECONDS);

        tracing::debug!(
            queue_url = %queue_url,
            visibility_timeout_seconds = visibility_timeout,
            "Resolved queue attributes"
        );

        Ok(QueueAttributes::new(
            queue_url,
            visibility_timeout,
            max_messages_per_poll,
            wait_time_seconds,
        )?)
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn visibility_timeout_seconds(&self) -> i32 {
        self.visibility_timeout_seconds
    }

    pub fn max_messages_per_poll(&self) -> i32 {
        self.max_messages_per_poll
    }

    pub fn wait_time_seconds(&self) -> i32 {
        self.wait_time_seconds
    }

    /// Wait time actually sent to SQS; longer waits are capped at 20 seconds.
    pub(crate) fn effective_wait_time_seconds(&self) -> i32 {
        self.wait_time_seconds.min(MAX_WAIT_TIME_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://sqs.us-east-1.amazonaws.com/123456789012/orders";

    #[test]
    fn accepts_boundary_values() {
        let attrs = QueueAttributes::new(URL, MAX_VISIBILITY_TIMEOUT_SECONDS, 10, 0).unwrap();
        assert_eq!(attrs.max_messages_per_poll(), 10);
        assert_eq!(attrs.wait_time_seconds(), 0);

        assert!(QueueAttributes::new(URL, 1, 1, 20).is_ok());
    }

    #[test]
    fn rejects_invalid_values() {
        assert_eq!(
            QueueAttributes::new("  ", 30, 5, 2),
            Err(ConfigurationError::EmptyQueueUrl)
        );
        assert_eq!(
            QueueAttributes::new(URL, 0, 5, 2),
            Err(ConfigurationError::InvalidVisibilityTimeout(0))
        );
        assert_eq!(
            QueueAttributes::new(URL, 43_201, 5, 2),
            Err(ConfigurationError::InvalidVisibilityTimeout(43_201))
        );
        assert_eq!(
            QueueAttributes::new(URL, 30, 0, 2),
            Err(ConfigurationError::InvalidMaxMessages(0))
        );
        assert_eq!(
            QueueAttributes::new(URL, 30, 11, 2),
            Err(ConfigurationError::InvalidMaxMessages(11))
        );
        assert_eq!(
            QueueAttributes::new(URL, 30, 5, -1),
            Err(ConfigurationError::InvalidWaitTime(-1))
        );
    }

    #[test]
    fn caps_long_poll_wait() {
        let attrs = QueueAttributes::new(URL, 30, 5, 60).unwrap();
        assert_eq!(attrs.wait_time_seconds(), 60);
        assert_eq!(attrs.effective_wait_time_seconds(), 20);
    }
}
