use bytes::Bytes;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    log_debug,
    log_warn,
    Address,
    ConsumeOptions,
    CorrelationId,
    QueueOptions,
    Result,
    RpcError,
    SubscriptionHandle,
    TransportPtr,
};

/// The private reply queue of one outstanding call.
///
/// Declared anonymous and exclusive, consumed before the request is
/// published, and deleted exactly once: by [`release`](Self::release) on every
/// normal exit, or by the drop guard when the caller abandons the call future.
pub(super) struct ReplyQueue {
    // ---
    transport: TransportPtr,
    name: Address,
    sub: SubscriptionHandle,
    released: bool,
}

impl ReplyQueue {
    /// Declare a fresh reply queue and start consuming it.
    pub(super) async fn open(transport: &TransportPtr) -> Result<Self> {
        // ---
        let queue = transport.declare_queue("", QueueOptions::reply()).await?;

        let sub = match transport
            .consume(queue.name.as_str(), ConsumeOptions { no_ack: true })
            .await
        {
            Ok(sub) => sub,
            Err(err) => {
                let _ = transport.delete_queue(queue.name.as_str()).await;
                return Err(err);
            }
        };

        log_debug!("reply queue {} ready", queue.name);

        Ok(Self {
            transport: transport.clone(),
            name: queue.name,
            sub,
            released: false,
        })
    }

    pub(super) fn address(&self) -> &Address {
        &self.name
    }

    /// Wait for the reply carrying `token`.
    ///
    /// Messages with any other correlation id are logged and skipped without
    /// touching the deadline. A delivered reply wins over a deadline that
    /// expires in the same poll; caller cancellation wins over both.
    pub(super) async fn wait_for(
        &mut self,
        token: &CorrelationId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        // ---
        let deadline = time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return Err(RpcError::Cancelled),

                delivery = self.sub.inbox.recv() => match delivery {
                    Some(d) if token.matches(d.envelope.correlation_id.as_deref()) => {
                        return Ok(d.envelope.payload);
                    }
                    Some(d) => {
                        log_warn!(
                            "reply queue {}: ignoring message for correlation id {:?} (waiting for {token})",
                            self.name,
                            d.envelope.correlation_id
                        );
                    }
                    None => return Err(RpcError::ConsumerCancelled),
                },

                () = &mut deadline => return Err(RpcError::Timeout),
            }
        }
    }

    /// Delete the queue, which also ends its consumer.
    ///
    /// Failures are logged, not returned: an exclusive queue is removed by the
    /// broker when the connection closes anyway.
    pub(super) async fn release(mut self) {
        // ---
        let res = self.transport.delete_queue(self.name.as_str()).await;

        // Set after the delete so a drop mid-delete still runs the guard.
        self.released = true;
        if let Err(_err) = res {
            log_warn!("reply queue {}: delete failed, left to broker cleanup: {_err}", self.name);
        }
    }
}

impl Drop for ReplyQueue {
    fn drop(&mut self) {
        // ---
        if self.released {
            return;
        }

        // The call future was dropped mid-wait.
        let transport = self.transport.clone();
        let name = self.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(_err) = transport.delete_queue(name.as_str()).await {
                        log_debug!("reply queue {name}: delete after abandon failed: {_err}");
                    }
                });
            }
            Err(_) => {
                log_warn!("reply queue {name}: no runtime to delete it, left to broker cleanup");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        create_memory_transport_with_hub, DeliveryTag, Envelope, MemoryHub, QueueRef, RpcConfig,
        Transport,
    };
    use std::sync::Arc;

    /// Memory transport whose queue deletes take a while, like a slow broker.
    struct SlowDelete {
        inner: TransportPtr,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Transport for SlowDelete {
        fn transport_id(&self) -> &str {
            self.inner.transport_id()
        }

        async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<QueueRef> {
            self.inner.declare_queue(name, opts).await
        }

        async fn publish(&self, env: Envelope) -> Result<()> {
            self.inner.publish(env).await
        }

        async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
            self.inner.consume(queue, opts).await
        }

        async fn cancel(&self, consumer_tag: &str) -> Result<()> {
            self.inner.cancel(consumer_tag).await
        }

        async fn delete_queue(&self, name: &str) -> Result<()> {
            time::sleep(self.delay).await;
            self.inner.delete_queue(name).await
        }

        async fn ack(&self, delivery_tag: DeliveryTag) -> Result<()> {
            self.inner.ack(delivery_tag).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_release_dropped_mid_delete_still_deletes() {
        // ---
        let hub = MemoryHub::new();
        let inner = create_memory_transport_with_hub(&RpcConfig::memory("slow"), hub.clone())
            .await
            .unwrap();
        let transport: TransportPtr = Arc::new(SlowDelete {
            inner,
            delay: Duration::from_millis(50),
        });

        let queue = ReplyQueue::open(&transport).await.unwrap();
        assert_eq!(hub.queue_names().len(), 1);

        // The caller gives up while the delete is still in flight.
        let res = time::timeout(Duration::from_millis(10), queue.release()).await;
        assert!(res.is_err());

        time::timeout(Duration::from_secs(1), async {
            while !hub.queue_names().is_empty() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reply queue left behind");
    }

    #[tokio::test]
    async fn test_release_deletes_queue() {
        // ---
        let hub = MemoryHub::new();
        let transport = create_memory_transport_with_hub(&RpcConfig::memory("fast"), hub.clone())
            .await
            .unwrap();

        let queue = ReplyQueue::open(&transport).await.unwrap();
        queue.release().await;
        assert!(hub.queue_names().is_empty());
    }
}
