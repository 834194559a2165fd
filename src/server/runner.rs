//! Queue consumer runner.
//!
//! Glue between a [`Transport`](crate::Transport) and a role that handles
//! deliveries (the RPC server today). The runner:
//! - starts a manual-ack consumer on one queue
//! - drives the receive loop over the consumer inbox
//! - hands each [`Delivery`] to a [`DeliveryConsumer`]
//! - stops on shutdown, or reports the consumer ending on the broker side
//!
//! It does not define RPC semantics. Acking is the consumer's job; the
//! runner never acks on its own.
//!
//! ## Error handling
//!
//! Errors returned by [`DeliveryConsumer::handle_delivery`] are logged and
//! do not end the loop: one bad message must not bring down the consumer.
//! The inbox closing without a shutdown request means the broker cancelled
//! the consumer (queue deleted, connection lost) and is reported as
//! [`RpcError::ConsumerCancelled`].

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    log_debug,
    log_warn,
    ConsumeOptions,
    Delivery,
    Result,
    RpcError,
    TransportPtr,
};

/// A handler of queue deliveries.
///
/// Implementations should assume deliveries may be redelivered after a
/// connection loss and may arrive concurrently from several queues.
#[async_trait::async_trait]
pub(super) trait DeliveryConsumer: Send + Sync {
    /// Handle one delivery, including acking it when done.
    ///
    /// An error is logged by the runner; the loop keeps going.
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()>;
}

/// Start consuming `queue` and spawn its receive loop into `tasks`.
///
/// Returns once the consumer is registered, so messages already waiting in the
/// queue are delivered as soon as the loop runs.
///
/// The loop resolves to `Ok(())` after `shutdown` fires (its consumer is
/// cancelled first) and to `Err(RpcError::ConsumerCancelled)` if the broker
/// ends the consumer.
pub(super) async fn start(
    transport: TransportPtr,
    queue: &str,
    consumer: Arc<dyn DeliveryConsumer>,
    shutdown: CancellationToken,
    tasks: &mut JoinSet<Result<()>>,
) -> Result<()> {
    // ---
    let mut sub = transport
        .consume(queue, ConsumeOptions { no_ack: false })
        .await?;

    let queue = queue.to_string();

    tasks.spawn(async move {
        // ---
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    if let Err(_err) = transport.cancel(&sub.consumer_tag).await {
                        log_debug!("{queue}: cancel consumer {} failed: {_err}", sub.consumer_tag);
                    }
                    log_debug!("{queue}: consumer stopped");
                    return Ok(());
                }

                delivery = sub.inbox.recv() => match delivery {
                    Some(d) => {
                        if let Err(_err) = consumer.handle_delivery(d).await {
                            log_warn!("{queue}: delivery rejected: {_err}");
                        }
                    }
                    None => {
                        log_warn!("{queue}: consumer cancelled by broker");
                        return Err(RpcError::ConsumerCancelled);
                    }
                },
            }
        }
    });

    Ok(())
}
