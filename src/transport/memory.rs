//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! [`MemoryHub`] behaves like a queue broker with a default exchange:
//!
//! - Publishing to an existing queue enqueues the message; it is delivered
//!   once a consumer exists. Publishing to a missing queue drops it.
//! - Consumers of one queue receive messages round-robin.
//! - Manual-ack deliveries stay unacknowledged until `ack()`; if the consuming
//!   connection closes first they are requeued and marked redelivered.
//!   Cancelling the consumer does not requeue them; they stay ackable until
//!   the connection closes.
//! - Exclusive queues are usable only by the declaring connection and are
//!   deleted when it closes. Auto-delete queues go away with their last
//!   consumer.
//! - Deleting a queue, cancelling a consumer, or losing the connection closes
//!   the consumer's inbox.
//!
//! ## Non-Goals
//!
//! Persistence, prefetch limits, exchanges other than the default one, and
//! network failure simulation beyond the explicit test hooks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    // ---
    log_debug,
    log_info,
    Address,
    ConsumeOptions,
    Delivery,
    DeliveryTag,
    Envelope,
    QueueOptions,
    QueueRef,
    Result,
    RpcConfig,
    RpcError,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

type ConnectionId = u64;

/// Acquire the hub lock, ignoring poisoning.
///
/// No invariant spans an unwinding section: every mutation below either
/// completes or leaves the maps as they were.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct ConsumerSlot {
    tag: Arc<str>,
    conn: ConnectionId,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    owner: ConnectionId,
    ready: VecDeque<(Envelope, bool)>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl QueueState {
    fn queue_ref(&self, name: &Arc<str>) -> QueueRef {
        QueueRef {
            name: Address(name.clone()),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }
}

struct Unacked {
    conn: ConnectionId,
    queue: Arc<str>,
    envelope: Envelope,
}

#[derive(Default)]
struct HubState {
    queues: HashMap<Arc<str>, QueueState>,
    // consumer tag -> queue name
    consumer_queues: HashMap<Arc<str>, Arc<str>>,
    unacked: HashMap<DeliveryTag, Unacked>,
    open: HashSet<ConnectionId>,
    next_conn: ConnectionId,
    next_tag: DeliveryTag,
    next_consumer: u64,
}

impl HubState {
    fn ensure_open(&self, conn: ConnectionId) -> Result<()> {
        if self.open.contains(&conn) {
            Ok(())
        } else {
            Err(RpcError::Transport("memory: connection closed".into()))
        }
    }

    fn check_access(&self, conn: ConnectionId, queue: &str) -> Result<()> {
        match self.queues.get(queue) {
            Some(q) if q.options.exclusive && q.owner != conn => Err(RpcError::Transport(format!(
                "memory: resource locked, queue '{queue}' is exclusive to another connection"
            ))),
            Some(_) => Ok(()),
            None => Err(RpcError::Transport(format!("memory: no queue '{queue}'"))),
        }
    }

    /// Hand ready messages to consumers until one side runs out.
    fn dispatch(&mut self, queue: &str) {
        // ---
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        while !q.ready.is_empty() && !q.consumers.is_empty() {
            let idx = q.cursor % q.consumers.len();
            let Some((envelope, redelivered)) = q.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let delivery_tag = self.next_tag;
            let slot = &q.consumers[idx];

            let delivery = Delivery {
                envelope: envelope.clone(),
                delivery_tag,
                redelivered,
            };

            if slot.tx.send(delivery).is_err() {
                // Receiver dropped without cancelling; forget the consumer.
                let gone = q.consumers.remove(idx);
                self.consumer_queues.remove(&gone.tag);
                q.ready.push_front((envelope, redelivered));
                continue;
            }

            if !slot.no_ack {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        conn: slot.conn,
                        queue: Arc::from(queue),
                        envelope,
                    },
                );
            }
            q.cursor = idx + 1;
        }
    }

    fn remove_queue(&mut self, queue: &str) -> Option<QueueState> {
        let removed = self.queues.remove(queue)?;
        for slot in &removed.consumers {
            self.consumer_queues.remove(&slot.tag);
        }
        self.unacked.retain(|_, u| &*u.queue != queue);
        Some(removed)
    }

    fn remove_consumer(&mut self, tag: &str) -> bool {
        // ---
        let Some(queue) = self.consumer_queues.remove(tag) else {
            return false;
        };
        let mut now_idle = false;
        if let Some(q) = self.queues.get_mut(&queue) {
            q.consumers.retain(|c| &*c.tag != tag);
            now_idle = q.consumers.is_empty() && q.options.auto_delete;
        }
        if now_idle {
            log_debug!("memory: auto-deleting queue {queue}");
            self.remove_queue(&queue);
        }
        true
    }

    /// Put a connection's unacked deliveries back at the head of their queues.
    fn requeue_unacked(&mut self, conn: Option<ConnectionId>) {
        // ---
        let mut tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| conn.map_or(true, |c| u.conn == c))
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first so push_front restores the original order.
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = HashSet::new();
        for tag in tags {
            if let Some(u) = self.unacked.remove(&tag) {
                if let Some(q) = self.queues.get_mut(&u.queue) {
                    q.ready.push_front((u.envelope, true));
                    touched.insert(u.queue);
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, conn: ConnectionId) {
        // ---
        if !self.open.remove(&conn) {
            return;
        }

        let tags: Vec<Arc<str>> = self
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .filter(|c| c.conn == conn)
            .map(|c| c.tag.clone())
            .collect();
        for tag in tags {
            self.remove_consumer(&tag);
        }

        let exclusive: Vec<Arc<str>> = self
            .queues
            .iter()
            .filter(|(_, q)| q.options.exclusive && q.owner == conn)
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }

        self.requeue_unacked(Some(conn));
    }
}

/// Shared in-process broker for the memory transport.
///
/// Every `MemoryTransport` created against the same hub is a separate
/// connection to the same broker.
///
/// # Testing hooks
///
/// `queue_names`, `queue_depth`, `consumer_count`, `unacked_count`,
/// `cancel_consumers` and `drop_connections` exist to observe and disturb the
/// broker from tests. Production code should go through [`create_transport`](crate::create_transport).
///
/// ```
/// # use queue_rpc::{MemoryHub, RpcConfig, QueueOptions};
/// # async fn example() -> queue_rpc::Result<()> {
/// let hub = MemoryHub::new();
/// let transport =
///     queue_rpc::create_memory_transport_with_hub(&RpcConfig::memory("a"), hub.clone()).await?;
/// transport.declare_queue("jobs", QueueOptions::well_known()).await?;
/// assert_eq!(hub.queue_names(), vec!["jobs".to_string()]);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryHub {
    state: Mutex<HubState>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        lock_ignore_poison(&self.state)
    }

    fn connect(&self) -> ConnectionId {
        let mut state = self.lock();
        state.next_conn += 1;
        let conn = state.next_conn;
        state.open.insert(conn);
        conn
    }

    fn declare(&self, conn: ConnectionId, name: &str, opts: QueueOptions) -> Result<QueueRef> {
        // ---
        let mut state = self.lock();
        state.ensure_open(conn)?;

        let name: Arc<str> = if name.is_empty() {
            Arc::from(format!("amq.gen-{}", Uuid::new_v4().simple()))
        } else {
            Arc::from(name)
        };

        if state.queues.contains_key(&name) {
            state.check_access(conn, &name)?;
        } else {
            state.queues.insert(
                name.clone(),
                QueueState {
                    options: opts,
                    owner: conn,
                    ready: VecDeque::new(),
                    consumers: Vec::new(),
                    cursor: 0,
                },
            );
        }

        Ok(state.queues[&name].queue_ref(&name))
    }

    fn publish(&self, conn: ConnectionId, env: Envelope) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.ensure_open(conn)?;

        let queue = env.address.0.clone();
        match state.queues.get_mut(&queue) {
            Some(q) => q.ready.push_back((env, false)),
            None => {
                log_debug!("memory: no queue '{queue}', message dropped");
                return Ok(());
            }
        }
        state.dispatch(&queue);
        Ok(())
    }

    fn consume(
        &self,
        conn: ConnectionId,
        queue: &str,
        opts: ConsumeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let mut state = self.lock();
        state.ensure_open(conn)?;
        state.check_access(conn, queue)?;

        state.next_consumer += 1;
        let tag: Arc<str> = Arc::from(format!("ctag-{conn}.{}", state.next_consumer));
        let (tx, rx) = mpsc::unbounded_channel();

        let queue: Arc<str> = Arc::from(queue);
        if let Some(q) = state.queues.get_mut(&queue) {
            q.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                conn,
                no_ack: opts.no_ack,
                tx,
            });
        }
        state.consumer_queues.insert(tag.clone(), queue.clone());
        state.dispatch(&queue);

        Ok(SubscriptionHandle {
            consumer_tag: tag,
            inbox: rx,
        })
    }

    fn cancel(&self, conn: ConnectionId, tag: &str) -> Result<()> {
        let mut state = self.lock();
        state.ensure_open(conn)?;
        state.remove_consumer(tag);
        Ok(())
    }

    fn delete(&self, conn: ConnectionId, queue: &str) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.ensure_open(conn)?;
        if state.queues.contains_key(queue) {
            state.check_access(conn, queue)?;
            state.remove_queue(queue);
        }
        Ok(())
    }

    fn ack(&self, conn: ConnectionId, delivery_tag: DeliveryTag) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.ensure_open(conn)?;
        let owned = state.unacked.get(&delivery_tag).map(|u| u.conn) == Some(conn);
        if !owned {
            return Err(RpcError::Transport(format!(
                "memory: unknown delivery tag {delivery_tag}"
            )));
        }
        state.unacked.remove(&delivery_tag);
        Ok(())
    }

    fn close(&self, conn: ConnectionId) {
        self.lock().close_connection(conn);
    }

    /// Names of all existing queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().map(|k| k.to_string()).collect();
        names.sort();
        names
    }

    /// Messages waiting for a consumer, or `None` if the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Consumers attached to `queue` (0 if it does not exist).
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Deliveries sent to manual-ack consumers and not yet acknowledged.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Broker-initiated cancellation of every consumer on `queue`.
    pub fn cancel_consumers(&self, queue: &str) {
        // ---
        let mut state = self.lock();
        let tags: Vec<Arc<str>> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default();
        for tag in tags {
            state.remove_consumer(&tag);
        }
    }

    /// Simulate a broker restart: every connection drops.
    ///
    /// All inboxes close, exclusive queues vanish, unacked deliveries are
    /// requeued, and later operations on old transports fail.
    pub fn drop_connections(&self) {
        // ---
        let mut state = self.lock();
        let conns: Vec<ConnectionId> = state.open.iter().copied().collect();
        for conn in conns {
            state.close_connection(conn);
        }
        log_info!("memory: all connections dropped");
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// One connection to a [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    conn: ConnectionId,
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<QueueRef> {
        self.hub.declare(self.conn, name, opts)
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        log_debug!("[{}] publish to {}", self.transport_id, env.address);
        self.hub.publish(self.conn, env)
    }

    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        log_debug!("[{}] consume {queue}", self.transport_id);
        self.hub.consume(self.conn, queue, opts)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.hub.cancel(self.conn, consumer_tag)
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        log_debug!("[{}] delete queue {name}", self.transport_id);
        self.hub.delete(self.conn, name)
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<()> {
        self.hub.ack(self.conn, delivery_tag)
    }

    /// Close this connection. Other connections on the hub are unaffected.
    async fn close(&self) -> Result<()> {
        log_debug!("[{}] closing memory transport", self.transport_id);
        self.hub.close(self.conn);
        Ok(())
    }
}

/// Create a new in-memory transport on the process-global hub.
///
/// All transports created with this function share one broker, like
/// processes connected to the same RabbitMQ.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport connected to `hub`.
///
/// Tests use a hub per case to stay isolated when run in parallel.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport_with_hub(
    config: &RpcConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    let conn = hub.connect();
    log_debug!("{}: memory connection {conn} opened", config.transport_id);

    Ok(Arc::new(MemoryTransport {
        transport_id: config.transport_id.clone(),
        conn,
        hub,
    }))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;

    async fn connect(hub: &Arc<MemoryHub>, id: &str) -> TransportPtr {
        create_memory_transport_with_hub(&RpcConfig::memory(id), hub.clone())
            .await
            .unwrap()
    }

    fn message(queue: &str, body: &'static [u8]) -> Envelope {
        Envelope::one_way(Address::from(queue), Bytes::from_static(body))
    }

    #[tokio::test]
    async fn test_anonymous_queue_gets_generated_name() {
        // ---
        let hub = MemoryHub::new();
        let t = connect(&hub, "a").await;

        let q1 = t.declare_queue("", QueueOptions::reply()).await.unwrap();
        let q2 = t.declare_queue("", QueueOptions::reply()).await.unwrap();

        assert!(q1.name.as_str().starts_with("amq.gen-"));
        assert_ne!(q1.name, q2.name);
    }

    #[tokio::test]
    async fn test_messages_buffer_until_consumed() {
        // ---
        let hub = MemoryHub::new();
        let t = connect(&hub, "a").await;
        t.declare_queue("jobs", QueueOptions::well_known()).await.unwrap();

        t.publish(message("jobs", b"1")).await.unwrap();
        t.publish(message("jobs", b"2")).await.unwrap();
        assert_eq!(hub.queue_depth("jobs"), Some(2));

        let mut sub = t
            .consume("jobs", ConsumeOptions { no_ack: true })
            .await
            .unwrap();
        assert_eq!(sub.inbox.recv().await.unwrap().envelope.payload, "1");
        assert_eq!(sub.inbox.recv().await.unwrap().envelope.payload, "2");
        assert_eq!(hub.queue_depth("jobs"), Some(0));
    }

    #[tokio::test]
    async fn test_publish_to_missing_queue_is_dropped() {
        // ---
        let hub = MemoryHub::new();
        let t = connect(&hub, "a").await;
        t.publish(message("nowhere", b"x")).await.unwrap();
        assert!(hub.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_queue_rejects_other_connections() {
        // ---
        let hub = MemoryHub::new();
        let owner = connect(&hub, "owner").await;
        let other = connect(&hub, "other").await;

        let q = owner.declare_queue("", QueueOptions::reply()).await.unwrap();
        let res = other.consume(q.name.as_str(), ConsumeOptions::default()).await;
        assert!(matches!(res, Err(RpcError::Transport(_))));

        // Publishing to it is still allowed.
        other.publish(message(q.name.as_str(), b"hi")).await.unwrap();
        assert_eq!(hub.queue_depth(q.name.as_str()), Some(1));
    }

    #[tokio::test]
    async fn test_close_requeues_unacked_and_drops_exclusive() {
        // ---
        let hub = MemoryHub::new();
        let server = connect(&hub, "server").await;
        let client = connect(&hub, "client").await;

        server.declare_queue("rpc", QueueOptions::well_known()).await.unwrap();
        let reply = client.declare_queue("", QueueOptions::reply()).await.unwrap();

        client.publish(message("rpc", b"req")).await.unwrap();
        let mut sub = server.consume("rpc", ConsumeOptions::default()).await.unwrap();
        let first = sub.inbox.recv().await.unwrap();
        assert!(!first.redelivered);
        assert_eq!(hub.unacked_count(), 1);

        server.close().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(hub.unacked_count(), 0);
        assert_eq!(hub.queue_depth("rpc"), Some(1));
        assert_eq!(hub.queue_depth(reply.name.as_str()), None);
        assert!(sub.inbox.recv().await.is_none());

        let again = connect(&hub, "server-2").await;
        let mut sub = again.consume("rpc", ConsumeOptions::default()).await.unwrap();
        let redelivery = sub.inbox.recv().await.unwrap();
        assert!(redelivery.redelivered);
        again.ack(redelivery.delivery_tag).await.unwrap();
        assert_eq!(hub.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_closes_inbox() {
        // ---
        let hub = MemoryHub::new();
        let t = connect(&hub, "a").await;
        let q = t.declare_queue("", QueueOptions::reply()).await.unwrap();
        let mut sub = t
            .consume(q.name.as_str(), ConsumeOptions { no_ack: true })
            .await
            .unwrap();

        t.delete_queue(q.name.as_str()).await.unwrap();
        assert!(sub.inbox.recv().await.is_none());
        assert!(hub.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        // ---
        let hub = MemoryHub::new();
        let t = connect(&hub, "a").await;
        t.declare_queue("work", QueueOptions::well_known()).await.unwrap();

        let mut a = t.consume("work", ConsumeOptions { no_ack: true }).await.unwrap();
        let mut b = t.consume("work", ConsumeOptions { no_ack: true }).await.unwrap();

        for _ in 0..4 {
            t.publish(message("work", b"m")).await.unwrap();
        }

        let mut got_a = 0;
        while a.inbox.try_recv().is_ok() {
            got_a += 1;
        }
        let mut got_b = 0;
        while b.inbox.try_recv().is_ok() {
            got_b += 1;
        }
        assert_eq!((got_a, got_b), (2, 2));
    }

    #[tokio::test]
    async fn test_cancel_auto_deletes_idle_queue() {
        // ---
        let hub = MemoryHub::new();
        let t = connect(&hub, "a").await;
        let q = t.declare_queue("", QueueOptions::reply()).await.unwrap();
        let sub = t
            .consume(q.name.as_str(), ConsumeOptions { no_ack: true })
            .await
            .unwrap();

        t.cancel(&sub.consumer_tag).await.unwrap();
        assert!(hub.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_keeps_unacked_delivery_ackable() {
        // ---
        let hub = MemoryHub::new();
        let t = connect(&hub, "a").await;
        t.declare_queue("jobs", QueueOptions::well_known()).await.unwrap();
        t.publish(message("jobs", b"1")).await.unwrap();

        let mut sub = t.consume("jobs", ConsumeOptions::default()).await.unwrap();
        let d = sub.inbox.recv().await.unwrap();

        t.cancel(&sub.consumer_tag).await.unwrap();
        assert_eq!(hub.unacked_count(), 1);
        assert_eq!(hub.queue_depth("jobs"), Some(0));

        t.ack(d.delivery_tag).await.unwrap();
        assert_eq!(hub.unacked_count(), 0);
        assert_eq!(hub.queue_depth("jobs"), Some(0));
    }

    #[tokio::test]
    async fn test_cancelled_unacked_delivery_requeued_on_close() {
        // ---
        let hub = MemoryHub::new();
        let worker = connect(&hub, "worker").await;
        let other = connect(&hub, "other").await;
        worker.declare_queue("jobs", QueueOptions::well_known()).await.unwrap();
        other.publish(message("jobs", b"1")).await.unwrap();

        let mut sub = worker.consume("jobs", ConsumeOptions::default()).await.unwrap();
        let _ = sub.inbox.recv().await.unwrap();
        hub.cancel_consumers("jobs");
        assert_eq!(hub.unacked_count(), 1);

        worker.close().await.unwrap();
        assert_eq!(hub.unacked_count(), 0);
        assert_eq!(hub.queue_depth("jobs"), Some(1));
    }

    #[tokio::test]
    async fn test_operations_fail_after_connection_drop() {
        // ---
        let hub = MemoryHub::new();
        let t = connect(&hub, "a").await;
        hub.drop_connections();

        let res = t.declare_queue("jobs", QueueOptions::well_known()).await;
        assert!(matches!(res, Err(RpcError::Transport(_))));
    }
}
