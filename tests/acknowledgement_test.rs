mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{FakeQueue, QUEUE_URL, attributes};
use rs_sqs_listener::conversion::headers;
use rs_sqs_listener::{
    AckError, AcknowledgementCallback, ConversionContext, MessageEnvelope, SqsHeaderMapper,
    SqsMessage,
};
use tokio_util::sync::CancellationToken;

fn callback(queue: &FakeQueue, receipt_handle: &str) -> AcknowledgementCallback {
    AcknowledgementCallback::new(queue.client(), Arc::from(QUEUE_URL), receipt_handle)
}

#[tokio::test]
async fn acknowledging_twice_deletes_once() {
    let queue = FakeQueue::new();
    let ack = callback(&queue, "r1");

    ack.acknowledge().await.unwrap();
    ack.clone().acknowledge().await.unwrap();

    assert!(ack.is_acknowledged());
    assert_eq!(queue.deletes(), vec!["r1".to_string()]);
}

#[tokio::test]
async fn concurrent_acknowledgements_delete_once() {
    let queue = FakeQueue::new();
    let ack = callback(&queue, "r1");

    let results = futures::future::join_all((0..8).map(|_| {
        let ack = ack.clone();
        async move { ack.acknowledge().await }
    }))
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(queue.deletes(), vec!["r1".to_string()]);
}

#[tokio::test]
async fn failed_delete_can_be_retried() {
    let queue = FakeQueue::new();
    queue.fail_next_deletes(1);
    let ack = callback(&queue, "r1");

    let err = ack.acknowledge().await.unwrap_err();
    assert!(matches!(err, AckError::Delete(_)));
    assert!(!ack.is_acknowledged());
    assert!(queue.deletes().is_empty());

    ack.acknowledge().await.unwrap();
    assert!(ack.is_acknowledged());
    assert_eq!(queue.deletes(), vec!["r1".to_string()]);
}

#[tokio::test]
async fn visibility_changes_are_validated() {
    let queue = FakeQueue::new();
    let ack = callback(&queue, "r1");

    ack.extend_visibility(120).await.unwrap();
    ack.release().await.unwrap();
    assert!(matches!(
        ack.extend_visibility(-1).await,
        Err(AckError::InvalidVisibilityTimeout(-1))
    ));
    assert!(matches!(
        ack.extend_visibility(43_201).await,
        Err(AckError::InvalidVisibilityTimeout(43_201))
    ));
    assert_eq!(
        queue.visibility_changes(),
        vec![("r1".to_string(), 120), ("r1".to_string(), 0)]
    );

    ack.acknowledge().await.unwrap();
    assert!(matches!(
        ack.extend_visibility(60).await,
        Err(AckError::AlreadyAcknowledged)
    ));
    assert_eq!(queue.visibility_changes().len(), 2);
}

#[tokio::test]
async fn detached_callback_never_touches_a_queue() {
    let ack = AcknowledgementCallback::detached();
    assert_eq!(ack.receipt_handle(), None);

    ack.extend_visibility(30).await.unwrap();
    ack.acknowledge().await.unwrap();
    assert!(ack.is_acknowledged());
}

#[tokio::test]
async fn default_mapper_adds_sqs_headers_to_message_attributes() {
    let queue = FakeQueue::new();
    let mut message_attributes = HashMap::new();
    message_attributes.insert("tenant".to_string(), "acme".to_string());
    message_attributes.insert("ApproximateReceiveCount".to_string(), "2".to_string());
    let envelope = MessageEnvelope::new("m1", "r1", "{\"order\":7}", message_attributes);
    let received_at = envelope.received_at().to_rfc3339();

    let context = ConversionContext::new(
        Arc::new(attributes(10, 20)),
        queue.client(),
        callback(&queue, "r1"),
    );
    let message = SqsMessage::convert(
        envelope,
        context,
        &SqsHeaderMapper,
        CancellationToken::new(),
    );

    assert_eq!(message.id(), "m1");
    assert_eq!(message.body_text(), "{\"order\":7}");
    assert_eq!(message.header("tenant"), Some("acme"));
    assert_eq!(message.header("ApproximateReceiveCount"), Some("2"));
    assert_eq!(message.header(headers::MESSAGE_ID), Some("m1"));
    assert_eq!(message.header(headers::RECEIPT_HANDLE), Some("r1"));
    assert_eq!(message.header(headers::QUEUE_URL), Some(QUEUE_URL));
    assert_eq!(message.header(headers::VISIBILITY_TIMEOUT), Some("30"));
    assert_eq!(
        message.header(headers::RECEIVED_AT),
        Some(received_at.as_str())
    );
    assert!(!message.shutdown_signal().is_cancelled());

    message.acknowledge().await.unwrap();
    assert!(message.context().acknowledgement().is_acknowledged());
    assert_eq!(queue.deletes(), vec!["r1".to_string()]);
}
