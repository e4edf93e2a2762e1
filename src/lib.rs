//! # AWS SQS Listener
//!
//! An asynchronous AWS SQS listener engine: it long-polls queues, runs
//! registered handlers with bounded per-queue concurrency and acknowledges
//! each message only after its handler has returned.
//!
//! ## Features
//!
//! - Asynchronous SQS message processing with tokio
//! - One dispatcher per queue with a bounded worker pool and backpressure
//! - Acknowledgement callbacks that delete at most once and can extend visibility
//! - Failed handlers leave messages to SQS redelivery (optionally released early)
//! - Poll failures back off exponentially and are reported to subscribers
//! - Graceful draining with a deadline and a per-queue shutdown report
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rs_sqs_listener::{attributes::QueueAttributes, client, receiver::ListenerContainer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sqs_client = client::create_sqs_client_from_env().await;
//!     let container = ListenerContainer::from_sqs_client(sqs_client);
//!
//!     let attributes = QueueAttributes::new(
//!         "https://sqs.region.amazonaws.com/account/queue-name",
//!         30,
//!         10,
//!         20,
//!     )?;
//!     let shared_data = "shared state".to_string();
//!
//!     container.add_handler_fn(
//!         attributes,
//!         |message, shared| async move {
//!             println!("Processing message: {} with shared: {}", message.body_text(), shared);
//!             Ok(())
//!         },
//!         shared_data,
//!         Some(4),
//!     )?;
//!
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     let report = container.shutdown(Duration::from_secs(30)).await;
//!     assert!(report.is_complete());
//!     Ok(())
//! }
//! ```

pub mod acknowledgement;
pub mod attributes;
pub mod client;
pub mod conversion;
pub mod errors;
pub mod message;
pub mod receiver;

pub use acknowledgement::AcknowledgementCallback;
pub use attributes::QueueAttributes;
pub use client::QueueClient;
pub use conversion::{ConversionContext, HeaderMapper, SqsHeaderMapper, SqsMessage};
pub use errors::{AckError, ConfigurationError, HandlerError, ListenerError, TransportError};
pub use message::MessageEnvelope;
pub use receiver::{
    AcknowledgementMode, Dispatcher, ListenerConfig, ListenerContainer, MessageHandler,
    ShutdownReport,
};
