use std::time::Duration;

use thiserror::Error;

/// Boxed error type used for sources coming from the AWS SDK or user handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error types for the SQS listener.
///
/// This enum aggregates every failure the listener can surface to callers.
/// Most of them are isolated per message or per queue and only reported
/// through logs and [`ListenerEvent`](crate::receiver::stats::ListenerEvent)s;
/// the ones returned directly are registration and lifecycle errors.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Invalid queue attributes or listener configuration.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Network or service failure while talking to the queue.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A delete or visibility change failed.
    #[error(transparent)]
    Acknowledgement(#[from] AckError),

    /// A message handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The dispatcher was asked to start while it was not stopped.
    #[error("dispatcher for {queue_url} is already {state}")]
    InvalidState {
        queue_url: String,
        state: &'static str,
    },

    /// A dispatcher was started outside of a tokio runtime.
    #[error("starting the dispatcher for {0} requires a tokio runtime")]
    NoRuntime(String),

    /// No dispatcher is registered for the given queue.
    #[error("no listener registered for queue {0}")]
    UnknownQueue(String),
}

/// Failure of a remote call against the queue service.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The service (or the network path to it) rejected the call.
    #[error("{operation} failed: {source}")]
    Service {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    /// The service answered with something the listener cannot use.
    #[error("{operation} returned an invalid response: {reason}")]
    InvalidResponse {
        operation: &'static str,
        reason: String,
    },
}

impl TransportError {
    /// Wraps an SDK or I/O error raised by `operation`.
    pub fn service(operation: &'static str, source: impl Into<BoxError>) -> Self {
        TransportError::Service {
            operation,
            source: source.into(),
        }
    }
}

/// Failure of an acknowledgement call.
#[derive(Debug, Error)]
pub enum AckError {
    #[error("failed to delete message: {0}")]
    Delete(#[source] TransportError),

    #[error("failed to change message visibility: {0}")]
    ChangeVisibility(#[source] TransportError),

    /// Visibility can no longer be changed once the message is deleted.
    #[error("message has already been acknowledged")]
    AlreadyAcknowledged,

    #[error("visibility timeout of {0} seconds is outside 0..=43200")]
    InvalidVisibilityTimeout(i32),
}

impl AckError {
    /// Whether the failure came from the transport and may succeed on retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, AckError::Delete(_) | AckError::ChangeVisibility(_))
    }
}

/// Failure reported by (or on behalf of) a message handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Generic(#[from] GenericError),

    #[error("{0}")]
    Source(#[source] BoxError),

    #[error("handler did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Wraps any error type as a handler failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        HandlerError::Source(source.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Generic(GenericError::new(message))
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Generic(GenericError::new(message.to_string()))
    }
}

/// Invalid configuration, detected before any dispatcher is started.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("queue url must not be empty")]
    EmptyQueueUrl,

    #[error("visibility timeout must be within 1..=43200 seconds, got {0}")]
    InvalidVisibilityTimeout(i32),

    #[error("max messages per poll must be within 1..=10, got {0}")]
    InvalidMaxMessages(i32),

    #[error("wait time must not be negative, got {0}")]
    InvalidWaitTime(i32),

    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,

    #[error("max poll attempts must be at least 1")]
    ZeroPollAttempts,

    #[error("max acknowledgement attempts must be at least 1")]
    ZeroAckAttempts,

    #[error("initial poll backoff {initial:?} exceeds the maximum {max:?}")]
    InvalidBackoff { initial: Duration, max: Duration },

    #[error("a listener is already registered for queue {0}")]
    DuplicateQueue(String),
}

/// Generic error type carrying only a message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct GenericError(String);

impl GenericError {
    /// Creates a new `GenericError` with the provided message.
    pub fn new(message: String) -> Self {
        GenericError(message)
    }
}

impl From<String> for GenericError {
    fn from(s: String) -> Self {
        GenericError::new(s)
    }
}
