// tests/transport_memory.rs

use bytes::Bytes;
use tokio::time::{timeout, Duration};

use queue_rpc::{
    // ---
    create_memory_transport_with_hub,
    Address,
    ConsumeOptions,
    CorrelationId,
    Envelope,
    MemoryHub,
    QueueOptions,
    RpcConfig,
    RpcError,
};

#[tokio::test]
async fn memory_consume_then_publish_keeps_metadata() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let config = RpcConfig::memory("mstpd");

    let transport = create_memory_transport_with_hub(&config, hub.clone())
        .await
        .expect("failed to create memory transport");

    let queue = transport
        .declare_queue("", QueueOptions::reply())
        .await
        .expect("declare failed");

    let mut sub = transport
        .consume(queue.name.as_str(), ConsumeOptions { no_ack: true })
        .await
        .expect("consume failed");

    let payload = Bytes::from_static(b"{\"status\":\"success\"}");
    let token = CorrelationId::generate();

    let env = Envelope::request(
        queue.name.clone(),
        payload.clone(),
        (&token).into(),
        Address::from("rpc_queue:erxes-automations"),
    );

    // ---
    // Act
    // ---
    transport.publish(env).await.expect("publish failed");

    // ---
    // Assert
    // ---
    let received = timeout(Duration::from_millis(100), sub.inbox.recv())
        .await
        .expect("timed out waiting for message")
        .expect("consumer inbox closed unexpectedly");

    assert_eq!(received.envelope.payload, payload);
    assert!(token.matches(received.envelope.correlation_id.as_deref()));
    assert_eq!(
        received.envelope.reply_to,
        Some(Address::from("rpc_queue:erxes-automations"))
    );
    assert!(!received.redelivered);
}

#[tokio::test]
async fn memory_unacked_request_is_redelivered_after_close() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let first = create_memory_transport_with_hub(&RpcConfig::memory("worker-1"), hub.clone())
        .await
        .expect("first transport");
    let second = create_memory_transport_with_hub(&RpcConfig::memory("worker-2"), hub.clone())
        .await
        .expect("second transport");

    first
        .declare_queue("rpc_queue:erkhet", QueueOptions::well_known())
        .await
        .expect("declare failed");

    let mut sub = first
        .consume("rpc_queue:erkhet", ConsumeOptions { no_ack: false })
        .await
        .expect("consume failed");

    second
        .publish(Envelope::one_way(
            Address::from("rpc_queue:erkhet"),
            Bytes::from_static(b"{}"),
        ))
        .await
        .expect("publish failed");

    let delivered = sub.inbox.recv().await.expect("first delivery");
    assert!(!delivered.redelivered);
    assert_eq!(hub.unacked_count(), 1);

    // ---
    // Act: worker-1 goes away without acking
    // ---
    first.close().await.expect("close failed");

    // ---
    // Assert
    // ---
    assert_eq!(hub.unacked_count(), 0);
    assert_eq!(hub.queue_depth("rpc_queue:erkhet"), Some(1));

    let mut sub = second
        .consume("rpc_queue:erkhet", ConsumeOptions { no_ack: false })
        .await
        .expect("consume on second failed");

    let again = timeout(Duration::from_millis(100), sub.inbox.recv())
        .await
        .expect("timed out waiting for redelivery")
        .expect("inbox closed");
    assert!(again.redelivered);

    second.ack(again.delivery_tag).await.expect("ack failed");
    assert_eq!(hub.unacked_count(), 0);
}

#[tokio::test]
async fn memory_reply_queue_is_private_to_its_connection() {
    // ---
    let hub = MemoryHub::new();
    let owner = create_memory_transport_with_hub(&RpcConfig::memory("owner"), hub.clone())
        .await
        .expect("owner transport");
    let other = create_memory_transport_with_hub(&RpcConfig::memory("other"), hub.clone())
        .await
        .expect("other transport");

    let queue = owner
        .declare_queue("", QueueOptions::reply())
        .await
        .expect("declare failed");
    assert!(queue.name.as_str().starts_with("amq.gen-"));

    let res = other
        .consume(queue.name.as_str(), ConsumeOptions { no_ack: true })
        .await;
    assert!(matches!(res, Err(RpcError::Transport(_))));

    // Anyone may publish a reply into it.
    other
        .publish(Envelope::response(
            queue.name.clone(),
            Bytes::from_static(b"{}"),
            "token".into(),
        ))
        .await
        .expect("publish failed");
    assert_eq!(hub.queue_depth(queue.name.as_str()), Some(1));

    owner.close().await.expect("close failed");
    assert_eq!(hub.queue_depth(queue.name.as_str()), None);
}
