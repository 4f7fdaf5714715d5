//! Integration tests for the in-memory broker's session lifecycle.
//!
//! Covers connection refusal, idempotent queue declaration, and the
//! return of unacknowledged messages when a session closes or is dropped.

use assert_matches::assert_matches;
use hpc_broker::{BrokerConfig, Connector, Credentials, InMemoryBroker, TransportError};
use hpc_core::{CorrelationId, MessageProperties, OutboundMessage};

fn broker() -> InMemoryBroker {
    InMemoryBroker::new("mq.local", Credentials::new("rodan", "secret"))
}

fn tagged(id: &str) -> OutboundMessage {
    OutboundMessage {
        body: b"{}".to_vec(),
        properties: MessageProperties {
            correlation_id: Some(CorrelationId::from(id)),
            reply_to: None,
        },
    }
}

// ---------------------------------------------------------------------------
// Test: invalid credentials fail before any queue exists
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_credentials_fail_with_connection_error() {
    let broker = broker();
    let config = BrokerConfig::new("mq.local", Credentials::new("rodan", "wrong"));

    let result = broker.open(&config).await;

    assert_matches!(result, Err(TransportError::Connection(_)));
    assert_eq!(broker.sessions_opened(), 0);
    assert!(broker.queue_names().is_empty());
}

// ---------------------------------------------------------------------------
// Test: unknown host is a connection error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_host_fails_with_connection_error() {
    let broker = broker();
    let config = BrokerConfig::new("elsewhere", Credentials::new("rodan", "secret"));

    assert_matches!(broker.open(&config).await, Err(TransportError::Connection(_)));
}

// ---------------------------------------------------------------------------
// Test: declaring the same queue twice is a no-op
// ---------------------------------------------------------------------------

#[tokio::test]
async fn declare_queue_twice_creates_one_queue() {
    let broker = broker();
    let mut session = broker.open(&broker.config()).await.unwrap();

    session.declare_queue("hpc-results").await.unwrap();
    session.publish("hpc-results", tagged("a")).await.unwrap();
    session.declare_queue("hpc-results").await.unwrap();

    assert_eq!(broker.queue_names(), vec!["hpc-results".to_string()]);
    // Re-declaring must not reset the queue contents.
    assert_eq!(broker.ready_count("hpc-results"), 1);
}

// ---------------------------------------------------------------------------
// Test: publishing to an undeclared queue fails
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_to_undeclared_queue_fails() {
    let broker = broker();
    let mut session = broker.open(&broker.config()).await.unwrap();

    assert_matches!(
        session.publish("missing", tagged("a")).await,
        Err(TransportError::QueueNotFound(name)) if name == "missing"
    );
}

// ---------------------------------------------------------------------------
// Test: close returns unacknowledged messages in order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_returns_unacked_messages_in_order() {
    let broker = broker();
    let mut session = broker.open(&broker.config()).await.unwrap();
    session.declare_queue("q").await.unwrap();
    for id in ["m1", "m2", "m3"] {
        session.publish("q", tagged(id)).await.unwrap();
    }

    session.try_receive("q").await.unwrap().unwrap();
    session.try_receive("q").await.unwrap().unwrap();
    assert_eq!(broker.ready_count("q"), 1);

    session.close().await.unwrap();

    assert_eq!(broker.unacked_count("q"), 0);
    assert_eq!(
        broker.ready_correlation_ids("q"),
        vec![Some("m1".into()), Some("m2".into()), Some("m3".into())]
    );
    assert_eq!(broker.sessions_closed(), 1);
}

// ---------------------------------------------------------------------------
// Test: dropping a session without close releases its messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dropped_session_releases_messages() {
    let broker = broker();
    {
        let mut session = broker.open(&broker.config()).await.unwrap();
        session.declare_queue("q").await.unwrap();
        session.publish("q", tagged("m1")).await.unwrap();
        session.try_receive("q").await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("q"), 1);
    }

    assert_eq!(broker.ready_count("q"), 1);
    assert_eq!(broker.sessions_closed(), 1);
}

// ---------------------------------------------------------------------------
// Test: acknowledged messages are gone for good
// ---------------------------------------------------------------------------

#[tokio::test]
async fn acknowledged_message_is_not_redelivered() {
    let broker = broker();
    let mut session = broker.open(&broker.config()).await.unwrap();
    session.declare_queue("q").await.unwrap();
    session.publish("q", tagged("m1")).await.unwrap();

    let delivery = session.try_receive("q").await.unwrap().unwrap();
    session.acknowledge(delivery.tag).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(broker.ready_count("q"), 0);
    assert_eq!(broker.acknowledged_count(), 1);
}
