//! Request/response RPC over message queues.
//!
//! A client publishes a request to a well-known queue with two pieces of
//! message metadata: a fresh `correlation_id` and the name of a private,
//! anonymous `reply_to` queue. A server consuming that well-known queue runs
//! the handler registered for the request's `action`, publishes the reply to
//! `reply_to` with the same `correlation_id`, and only then acks the request.
//! The client resolves its call with the first reply whose token matches,
//! or with a timeout, consumer cancellation or caller cancellation, and
//! always deletes its reply queue.
//!
//! Transports:
//! - in-memory hub (always available, reference semantics, used by tests)
//! - AMQP 0-9-1 via lapin (feature `transport_lapin`)
//!
//! # Example
//!
//! ```
//! use queue_rpc::{
//!     create_memory_transport_with_hub, MemoryHub, RpcClient, RpcConfig, RpcRequest,
//!     RpcServerBuilder,
//! };
//! use serde_json::{json, Value};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> queue_rpc::Result<()> {
//! let hub = MemoryHub::new();
//!
//! let server_transport =
//!     create_memory_transport_with_hub(&RpcConfig::memory("server"), hub.clone()).await?;
//! let server = RpcServerBuilder::new(server_transport)
//!     .queue("rpc_queue:erxes-api")
//!     .handler("ping", |data: Value| async move { Ok(Some(data)) })
//!     .build()?;
//! server.listen().await?;
//! let _task = server.spawn();
//!
//! let config = RpcConfig::memory("client");
//! let client_transport = create_memory_transport_with_hub(&config, hub).await?;
//! let client = RpcClient::with_transport(client_transport, config);
//!
//! let reply: Option<Value> = client
//!     .call(
//!         "rpc_queue:erxes-api",
//!         &RpcRequest::new("ping", json!({ "x": 1 })),
//!         Duration::from_secs(1),
//!     )
//!     .await?;
//! assert_eq!(reply, Some(json!({ "x": 1 })));
//! # Ok(())
//! # }
//! ```

// Macros first so every module below can use them.
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod client;
mod domain;
mod protocol;
mod publisher;
mod server;
mod transport;

mod correlation;
mod error;
mod retry;
mod rpc_config;

// --- public re-exports
pub use client::{RpcClient, DEFAULT_RPC_QUEUE};
pub use publisher::Publisher;
pub use server::{RpcServer, RpcServerBuilder, ServerState};

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};
pub use retry::RetryConfig;
pub use rpc_config::{RpcConfig, BROKER_ENV_VAR, DEFAULT_BROKER_URI};

pub use protocol::{ReplyStatus, RpcReply, RpcRequest};

pub use domain::{
    //
    Address,
    ConsumeOptions,
    Delivery,
    DeliveryTag,
    Envelope,
    QueueOptions,
    QueueRef,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

pub use transport::{
    // ---
    create_memory_transport,
    create_memory_transport_with_hub,
    create_transport,
    MemoryHub,
};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

#[cfg(feature = "transport_lapin")]
pub(crate) use retry::retry_with_backoff;
