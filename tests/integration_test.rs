//! Tests against a real queue. They need AWS credentials in the
//! environment (or a `.env` file) and `TEST_SQS_QUEUE_URL`; run them with
//! `cargo test -- --ignored`.

use rs_sqs_listener::{
    HandlerError, QueueAttributes, SqsMessage, client,
    receiver::{AcknowledgementMode, ListenerConfig, ListenerContainer},
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

#[derive(Clone)]
struct SharedCounter {
    count: Arc<Mutex<i32>>,
}

impl SharedCounter {
    fn new() -> Self {
        Self {
            count: Arc::new(Mutex::new(0)),
        }
    }

    async fn increment(&self) {
        let mut count = self.count.lock().await;
        *count += 1;
    }

    async fn get_count(&self) -> i32 {
        *self.count.lock().await
    }
}

async fn test_handler(message: SqsMessage, shared: SharedCounter) -> Result<(), HandlerError> {
    println!("Received message {}: {}", message.id(), message.body_text());
    shared.increment().await;
    Ok(())
}

async fn wait_for_count(counter: &SharedCounter, expected: i32) -> Result<(), i32> {
    let result = timeout(Duration::from_secs(30), async {
        loop {
            if counter.get_count().await >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(_) => Err(counter.get_count().await),
    }
}

#[tokio::test]
#[ignore = "requires TEST_SQS_QUEUE_URL and AWS credentials"]
async fn test_sqs_integration() {
    dotenvy::dotenv().ok();

    let queue_url = env::var("TEST_SQS_QUEUE_URL").expect("TEST_SQS_QUEUE_URL must be set");
    let sqs_client = client::create_sqs_client_from_env().await;

    for i in 1..=2 {
        sqs_client
            .send_message()
            .queue_url(&queue_url)
            .message_body(format!("Test message {i}"))
            .message_deduplication_id(format!("test-message-{i}"))
            .message_group_id("test-group")
            .send()
            .await
            .expect("Failed to send test message");
    }

    let container = ListenerContainer::from_sqs_client(sqs_client.clone());
    let attributes = QueueAttributes::resolve(container.client(), &queue_url, 10, 5)
        .await
        .expect("Failed to resolve queue attributes");

    let shared_counter = SharedCounter::new();
    container
        .add_handler_fn(attributes, test_handler, shared_counter.clone(), Some(2))
        .expect("Failed to register handler");

    let outcome = wait_for_count(&shared_counter, 2).await;
    let report = container.shutdown(Duration::from_secs(10)).await;

    if let Err(count) = outcome {
        panic!("Test timed out. Only processed {} messages", count);
    }
    assert!(report.is_complete(), "Queue did not drain: {:?}", report);

    let stats = container.stats(&queue_url).expect("queue should be registered");
    assert!(stats.acknowledged >= 2, "Messages were not acknowledged");
}

#[tokio::test]
#[ignore = "requires AWS credentials"]
async fn test_manual_acknowledgement_against_created_queue() {
    dotenvy::dotenv().ok();

    let queue_name = "test-queue-manual-ack";
    let sqs_client = client::create_sqs_client_from_env().await;

    let queue_url = match sqs_client
        .create_queue()
        .queue_name(queue_name)
        .send()
        .await
    {
        Ok(output) => output.queue_url().unwrap().to_string(),
        Err(e) => {
            if e.to_string().contains("QueueAlreadyExists") {
                let queues = sqs_client
                    .list_queues()
                    .queue_name_prefix(queue_name)
                    .send()
                    .await
                    .expect("Failed to list queues");

                queues
                    .queue_urls()
                    .first()
                    .expect("Queue should exist but not found")
                    .clone()
            } else {
                panic!("Failed to create/get queue: {}", e);
            }
        }
    };

    sqs_client
        .send_message()
        .queue_url(&queue_url)
        .message_body("Manual acknowledgement test message")
        .send()
        .await
        .expect("Failed to send test message");

    let shared_counter = SharedCounter::new();
    let container = ListenerContainer::from_sqs_client(sqs_client.clone()).with_default_config(
        ListenerConfig::default().with_acknowledgement_mode(AcknowledgementMode::Manual),
    );
    container
        .add_handler_fn(
            QueueAttributes::new(&queue_url, 30, 10, 5).expect("Invalid queue attributes"),
            |message: SqsMessage, shared: SharedCounter| async move {
                message.extend_visibility(60).await.map_err(HandlerError::new)?;
                message.acknowledge().await.map_err(HandlerError::new)?;
                shared.increment().await;
                Ok::<(), HandlerError>(())
            },
            shared_counter.clone(),
            None,
        )
        .expect("Failed to register handler");

    let outcome = wait_for_count(&shared_counter, 1).await;
    let report = container.shutdown(Duration::from_secs(10)).await;

    if let Err(count) = outcome {
        panic!("Manual acknowledgement test timed out. Only processed {} messages", count);
    }
    assert!(report.is_complete());

    let purge_result = sqs_client.purge_queue().queue_url(&queue_url).send().await;
    if let Err(e) = purge_result {
        println!("Warning: Failed to purge queue: {}", e);
    }
}
