// src/server/mod.rs
//! RPC server implementation.
//!
//! A server consumes one or more well-known request queues, routes each
//! request to the handler registered for its `action`, and publishes the
//! reply to the request's `reply_to` address tagged with the request's
//! `correlation_id`.
//!
//! A request is acked only after its reply was published. If publishing
//! fails the request stays unacked and the broker redelivers it once the
//! connection is re-established.

mod builder;
mod handler;
mod runner;

pub use builder::RpcServerBuilder;

use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    Delivery,
    Envelope,
    QueueOptions,
    Result,
    RpcError,
    TransportPtr,
};

use handler::HandlerRegistry;
use runner::DeliveryConsumer;

// Sent when a reply cannot be encoded, so the caller still gets an answer.
const ENCODE_FAILURE_REPLY: &[u8] =
    br#"{"status":"error","errorMessage":"failed to encode reply"}"#;

/// Lifecycle of an [`RpcServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Built, not consuming yet.
    Idle,
    /// Consumers are running on every configured queue.
    Listening,
}

/// RPC server.
///
/// Cheap to clone; clones share the same consumers and lifecycle. Build one
/// with [`RpcServer::builder`].
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    queues: Vec<String>,
    registry: Arc<HandlerRegistry>,
    state: Mutex<ServerState>,
    shutdown: CancellationToken,
    consumers: tokio::sync::Mutex<JoinSet<Result<()>>>,
    // Held for as long as a run() drives the consumers
    running: tokio::sync::Mutex<()>,
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RpcServer {
    /// Start building a server on `transport`.
    pub fn builder(transport: TransportPtr) -> RpcServerBuilder {
        RpcServerBuilder::new(transport)
    }

    fn new(transport: TransportPtr, queues: Vec<String>, registry: HandlerRegistry) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                transport,
                queues,
                registry: Arc::new(registry),
                state: Mutex::new(ServerState::Idle),
                shutdown: CancellationToken::new(),
                consumers: tokio::sync::Mutex::new(JoinSet::new()),
                running: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        *lock_ignore_poison(&self.inner.state)
    }

    /// Declare every request queue and start one consumer on each.
    ///
    /// Requests already waiting in the queues are processed as soon as this
    /// returns.
    ///
    /// # Errors
    ///
    /// - `RpcError::InvalidConfig` if the server is already listening or was
    ///   shut down
    /// - `RpcError::Transport` if a declare or consume fails; consumers
    ///   started before the failure are stopped
    pub async fn listen(&self) -> Result<()> {
        // ---
        let mut consumers = self.inner.consumers.lock().await;
        self.listen_locked(&mut consumers).await
    }

    async fn listen_locked(&self, consumers: &mut JoinSet<Result<()>>) -> Result<()> {
        // ---
        if self.state() == ServerState::Listening {
            return Err(RpcError::InvalidConfig("server is already listening".into()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::InvalidConfig("server was shut down".into()));
        }

        let transport = &self.inner.transport;

        for queue in &self.inner.queues {
            // ---
            let started = async {
                transport
                    .declare_queue(queue, QueueOptions::well_known())
                    .await?;

                let consumer: Arc<dyn DeliveryConsumer> = Arc::new(RequestConsumer {
                    transport: transport.clone(),
                    registry: self.inner.registry.clone(),
                });

                runner::start(
                    transport.clone(),
                    queue,
                    consumer,
                    self.inner.shutdown.child_token(),
                    consumers,
                )
                .await
            }
            .await;

            if let Err(err) = started {
                log_error!("[{}] cannot listen on {queue}: {err}", transport.transport_id());
                self.inner.shutdown.cancel();
                while consumers.join_next().await.is_some() {}
                return Err(err);
            }
        }

        *lock_ignore_poison(&self.inner.state) = ServerState::Listening;

        log_info!(
            "[{}] listening on {} (actions: {})",
            transport.transport_id(),
            self.inner.queues.join(", "),
            self.inner.registry.actions().join(", ")
        );

        Ok(())
    }

    /// Serve requests until [`shutdown`](Self::shutdown) is called or a
    /// consumer ends. Calls [`listen`](Self::listen) first when still idle.
    ///
    /// # Errors
    ///
    /// - `RpcError::ConsumerCancelled` if the broker ended a consumer (the
    ///   remaining consumers are stopped)
    /// - `RpcError::InvalidConfig` if another `run()` is already serving
    /// - errors from [`listen`](Self::listen)
    pub async fn run(&self) -> Result<()> {
        // ---
        let Ok(_running) = self.inner.running.try_lock() else {
            return Err(RpcError::InvalidConfig("server is already running".into()));
        };

        // Take the consumers out so listen() never waits on a running server.
        let mut consumers = {
            let mut guard = self.inner.consumers.lock().await;

            if self.state() == ServerState::Idle {
                if self.inner.shutdown.is_cancelled() {
                    return Ok(());
                }
                self.listen_locked(&mut guard).await?;
            }

            std::mem::take(&mut *guard)
        };

        let mut outcome = Ok(());

        while let Some(joined) = consumers.join_next().await {
            let res = match joined {
                Ok(res) => res,
                Err(join_err) => Err(RpcError::Transport(format!(
                    "consumer task failed: {join_err}"
                ))),
            };

            if let Err(err) = res {
                if outcome.is_ok() {
                    log_warn!("[{}] server stopping: {err}", self.inner.transport.transport_id());
                    self.inner.shutdown.cancel();
                    outcome = Err(err);
                }
            }
        }

        outcome
    }

    /// Run the server in a background task.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        // ---
        let server = self.clone();
        tokio::spawn(async move { server.run().await })
    }

    /// Stop consuming. [`run`](Self::run) returns `Ok(())` once every
    /// consumer has been cancelled.
    ///
    /// In-flight requests still publish their replies. The transport stays
    /// open; close it separately when it is no longer shared.
    pub fn shutdown(&self) {
        // ---
        log_debug!("[{}] shutdown requested", self.inner.transport.transport_id());
        self.inner.shutdown.cancel();
    }
}

/// Answers requests delivered from one request queue.
struct RequestConsumer {
    // ---
    transport: TransportPtr,
    registry: Arc<HandlerRegistry>,
}

#[async_trait::async_trait]
impl DeliveryConsumer for RequestConsumer {
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        // ---
        let Delivery {
            envelope,
            delivery_tag,
            redelivered: _redelivered,
        } = delivery;

        let (Some(reply_to), Some(correlation_id)) =
            (envelope.reply_to.clone(), envelope.correlation_id.clone())
        else {
            // Nobody to answer; drop it so it is not redelivered forever.
            self.transport.ack(delivery_tag).await?;
            return Err(RpcError::InvalidRequest(format!(
                "message on {} has no reply_to or correlation_id",
                envelope.address
            )));
        };

        log_debug!(
            "request on {} correlation_id={correlation_id} reply_to={reply_to} redelivered={_redelivered}",
            envelope.address
        );

        let transport = self.transport.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            // ---
            let reply = handler::dispatch(&registry, &envelope.payload).await;

            let body = match serde_json::to_vec(&reply) {
                Ok(b) => Bytes::from(b),
                Err(_err) => {
                    log_error!("correlation_id={correlation_id}: encode reply failed: {_err}");
                    Bytes::from_static(ENCODE_FAILURE_REPLY)
                }
            };

            let env = Envelope::response(reply_to, body, correlation_id.clone());
            if let Err(_err) = transport.publish(env).await {
                log_error!(
                    "correlation_id={correlation_id}: reply not published, request left unacked: {_err}"
                );
                return;
            }

            log_debug!("correlation_id={correlation_id}: replied {:?}", reply.status);

            if let Err(_err) = transport.ack(delivery_tag).await {
                log_warn!("correlation_id={correlation_id}: ack failed: {_err}");
            }
        });

        Ok(())
    }
}
