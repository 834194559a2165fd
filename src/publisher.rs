//! Fire-and-forget publishing.
//!
//! A one-way message has no correlation token, no reply address and no
//! wait. Success means the broker accepted the publish; nothing is known about
//! delivery or processing, and a queue without consumers is not an error.

use bytes::Bytes;
use serde::Serialize;

use crate::{
    // ---
    log_debug,
    Address,
    Envelope,
    QueueOptions,
    Result,
    TransportPtr,
};

/// One-way sender for well-known queues.
///
/// # Example
///
/// ```
/// # use queue_rpc::{create_memory_transport_with_hub, MemoryHub, Publisher, RpcConfig};
/// # use serde_json::json;
/// # async fn example() -> queue_rpc::Result<()> {
/// let hub = MemoryHub::new();
/// let transport = create_memory_transport_with_hub(&RpcConfig::memory("app"), hub.clone()).await?;
///
/// Publisher::new(transport)
///     .send("automations:trigger", &json!({ "type": "deal" }))
///     .await?;
/// assert_eq!(hub.queue_depth("automations:trigger"), Some(1));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Publisher {
    transport: TransportPtr,
}

impl Publisher {
    pub fn new(transport: TransportPtr) -> Self {
        Self { transport }
    }

    /// Declare `queue` (durable, shared; idempotent) and publish `data` as JSON.
    ///
    /// # Errors
    ///
    /// `RpcError::Serialization` if `data` cannot be encoded,
    /// `RpcError::Transport` if the broker rejects the declare or publish.
    pub async fn send<T>(&self, queue: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = Bytes::from(serde_json::to_vec(data)?);
        self.send_bytes(queue, payload).await
    }

    /// Publish an empty JSON object (`{}`) to `queue`.
    pub async fn send_empty(&self, queue: &str) -> Result<()> {
        self.send_bytes(queue, Bytes::from_static(b"{}")).await
    }

    async fn send_bytes(&self, queue: &str, payload: Bytes) -> Result<()> {
        // ---
        self.transport
            .declare_queue(queue, QueueOptions::well_known())
            .await?;

        log_debug!("[{}] send to {queue} ({} bytes)", self.transport.transport_id(), payload.len());

        self.transport
            .publish(Envelope::one_way(Address::from(queue), payload))
            .await
    }
}
