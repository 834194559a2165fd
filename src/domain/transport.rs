// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the queue-broker interface used by the client, the
//! publisher and the server. It intentionally avoids any reference to concrete
//! protocols or client libraries; the AMQP vocabulary (declare, consume, ack)
//! is used only because it names the operations every queue broker offers.
//!
//! The transport is responsible only for moving opaque envelopes between
//! named queues. Correlation, reply matching, timeouts and handler dispatch
//! are handled by the layers above.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::Result;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// A queue name.
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
/// An empty address asks the broker to name the queue on declaration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Borrow the queue name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Queue declaration flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive a broker restart.
    pub durable: bool,
    /// Usable only by the declaring connection; removed when it closes.
    pub exclusive: bool,
    /// Removed once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Private per-call reply queue: non-durable, exclusive, auto-delete.
    pub const fn reply() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Shared, agreed-upon queue such as an RPC request queue.
    pub const fn well_known() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Consumer registration flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged as soon as they are sent.
    pub no_ack: bool,
}

/// Result of a queue declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueRef {
    /// Queue name; broker-generated when the declared name was empty.
    pub name: Address,
    /// Messages ready for delivery at declaration time.
    pub message_count: u32,
    /// Consumers attached at declaration time.
    pub consumer_count: u32,
}

/// Broker-assigned identity of an unacknowledged delivery.
pub type DeliveryTag = u64;

/// An opaque message envelope.
///
/// The body travels as `payload`; `correlation_id` and `reply_to` are
/// message metadata (AMQP basic properties on a real broker), so routing never
/// depends on the business payload.
///
/// # Examples
///
/// ```
/// # use queue_rpc::{Envelope, Address};
/// # use bytes::Bytes;
/// # use std::sync::Arc;
/// let request = Envelope::request(
///     Address::from("rpc_queue:erxes-api"),
///     Bytes::from_static(br#"{"action":"ping","data":{}}"#),
///     Arc::from("correlation-123"),
///     Address::from("amq.gen-reply"),
/// );
/// assert_eq!(request.reply_to, Some(Address::from("amq.gen-reply")));
///
/// let reply = Envelope::response(
///     Address::from("amq.gen-reply"),
///     Bytes::from_static(br#"{"status":"success","data":{}}"#),
///     Arc::from("correlation-123"),
/// );
/// assert!(reply.reply_to.is_none());
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Destination queue.
    pub address: Address,

    /// Opaque payload bytes (JSON for everything this crate sends).
    pub payload: Bytes,

    /// Correlation token linking a request to its reply.
    pub correlation_id: Option<Arc<str>>,

    /// Queue the reply must be sent to. Set only on requests.
    pub reply_to: Option<Address>,

    /// Content type metadata; informational.
    pub content_type: Option<Arc<str>>,
}

const JSON: &str = "application/json";

impl Envelope {
    // ---
    /// Create a request envelope carrying correlation metadata.
    pub fn request(
        address: Address,
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Address,
    ) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(Arc::from(JSON)),
        }
    }

    /// Create a reply envelope tagged with the request's correlation token.
    pub fn response(address: Address, payload: Bytes, correlation_id: Arc<str>) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(Arc::from(JSON)),
        }
    }

    /// Create a one-way envelope with no correlation metadata.
    pub fn one_way(address: Address, payload: Bytes) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: None,
            reply_to: None,
            content_type: Some(Arc::from(JSON)),
        }
    }
}

/// A message handed to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// The published envelope.
    pub envelope: Envelope,
    /// Tag to pass to [`Transport::ack`] (ignored for `no_ack` consumers).
    pub delivery_tag: DeliveryTag,
    /// The broker delivered this message before without an ack.
    pub redelivered: bool,
}

/// Handle returned from a successful `consume()`.
///
/// `inbox` yields deliveries until the consumer is cancelled, its queue is
/// deleted, or the connection drops; the channel then closes and `recv()`
/// returns `None`. Callers treat that as broker-side cancellation.
pub struct SubscriptionHandle {
    // ---
    /// Broker consumer tag, for [`Transport::cancel`].
    pub consumer_tag: Arc<str>,

    /// Receiver channel for deliveries.
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Transport abstraction: one broker connection with one shared channel.
///
/// Every operation is issued on the same logical channel, so callers must not
/// assume call-level isolation; a broken channel closes every inbox handed out
/// by this transport.
///
/// Implementations must ensure that:
/// - once `consume()` returns, messages already queued and messages published
///   afterwards are deliverable to the returned inbox;
/// - `publish()` to a queue with no consumer buffers the message (or drops it
///   if the queue does not exist) and never waits for a consumer.
///
/// The in-memory transport is the reference implementation.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Treat the methods as plain `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this transport instance, used in logs.
    fn transport_id(&self) -> &str;

    /// Declare a queue. Idempotent for identical options. An empty `name`
    /// asks the broker to generate a unique one.
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<QueueRef>;

    /// Publish an envelope to the queue named by `env.address`.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Register a consumer on `queue`.
    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle>;

    /// Deregister a consumer. Its inbox closes.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Delete a queue, cancelling its consumers and dropping queued messages.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Acknowledge a delivery received by a manual-ack consumer.
    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<()>;

    /// Close the channel and the connection.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` is cheap and every clone shares the same connection; this is
/// the handle components borrow instead of a process-wide singleton.
pub type TransportPtr = Arc<dyn Transport>;
