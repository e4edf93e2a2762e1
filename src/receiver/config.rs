use std::time::Duration;

use tokio_retry::strategy::{ExponentialBackoff, jitter};

use crate::errors::ConfigurationError;

/// When the dispatcher acknowledges a message on the handler's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcknowledgementMode {
    /// Delete the message only after the handler succeeded.
    #[default]
    OnSuccess,
    /// Delete the message once the handler returned, whatever the outcome.
    Always,
    /// Never delete automatically; the handler calls
    /// [`SqsMessage::acknowledge`](crate::conversion::SqsMessage::acknowledge).
    Manual,
}

/// Configuration for a single queue listener.
///
/// Polling parameters (batch size, long-poll wait) live on
/// [`QueueAttributes`](crate::attributes::QueueAttributes); this struct holds
/// how the dispatcher runs handlers and reacts to failures.
///
/// # Fields
/// - `concurrency`: maximum number of handlers running at once for the queue.
/// - `acknowledgement_mode`: when messages are deleted.
/// - `release_on_failure`: make failed messages visible again immediately.
/// - `handler_timeout`: optional upper bound on a single handler run.
/// - `max_poll_attempts`: consecutive receive failures before the failure is reported.
/// - `poll_backoff_initial` / `poll_backoff_max`: backoff between failed receives.
/// - `max_ack_attempts`: tries per delete or visibility change before it is reported.
/// - `ack_backoff_initial`: first delay between acknowledgement retries,
///   capped by `poll_backoff_max`.
/// - `shutdown_timeout`: drain deadline used by `run_until`.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub concurrency: usize,
    pub acknowledgement_mode: AcknowledgementMode,
    pub release_on_failure: bool,
    pub handler_timeout: Option<Duration>,
    pub max_poll_attempts: u32,
    pub poll_backoff_initial: Duration,
    pub poll_backoff_max: Duration,
    pub max_ack_attempts: u32,
    pub ack_backoff_initial: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            concurrency: 10,
            acknowledgement_mode: AcknowledgementMode::OnSuccess,
            release_on_failure: false,
            handler_timeout: None,
            max_poll_attempts: 5,
            poll_backoff_initial: Duration::from_secs(1),
            poll_backoff_max: Duration::from_secs(30),
            max_ack_attempts: 3,
            ack_backoff_initial: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ListenerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_acknowledgement_mode(mut self, mode: AcknowledgementMode) -> Self {
        self.acknowledgement_mode = mode;
        self
    }

    pub fn with_release_on_failure(mut self, release: bool) -> Self {
        self.release_on_failure = release;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    pub fn with_poll_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_backoff_initial = initial;
        self.poll_backoff_max = max;
        self
    }

    pub fn with_ack_retry(mut self, attempts: u32, initial_backoff: Duration) -> Self {
        self.max_ack_attempts = attempts;
        self.ack_backoff_initial = initial_backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.concurrency == 0 {
            return Err(ConfigurationError::ZeroConcurrency);
        }
        if self.max_poll_attempts == 0 {
            return Err(ConfigurationError::ZeroPollAttempts);
        }
        if self.max_ack_attempts == 0 {
            return Err(ConfigurationError::ZeroAckAttempts);
        }
        if self.poll_backoff_initial > self.poll_backoff_max {
            return Err(ConfigurationError::InvalidBackoff {
                initial: self.poll_backoff_initial,
                max: self.poll_backoff_max,
            });
        }
        Ok(())
    }

    /// Delay before the next receive after `consecutive_failures` failed ones.
    pub(crate) fn poll_backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        self.poll_backoff_initial
            .saturating_mul(1u32 << exponent)
            .min(self.poll_backoff_max)
    }

    /// Delays between acknowledgement attempts: roughly doubling from
    /// `ack_backoff_initial`, jittered, `max_ack_attempts - 1` of them.
    pub(crate) fn ack_retry_strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        let factor = (self.ack_backoff_initial.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.poll_backoff_max)
            .map(jitter)
            .take(self.max_ack_attempts.saturating_sub(1) as usize)
    }
}
