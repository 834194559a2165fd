// src/client/mod.rs
//! RPC client implementation.
//!
//! # Architecture
//!
//! Every call owns a private reply queue:
//!
//! 1. a fresh [`CorrelationId`] is generated;
//! 2. an anonymous, exclusive reply queue is declared and consumed *before*
//!    the request is published, so an early reply cannot be missed;
//! 3. the request is published with `correlation_id` and `reply_to` set as
//!    message metadata;
//! 4. the call waits for the matching reply, the deadline, broker-side
//!    cancellation of the consumer, or caller cancellation;
//! 5. the reply queue is deleted.
//!
//! There is no shared pending-request map: since reply queues are never
//! shared, concurrent calls cannot see each other's replies, and a queue name
//! is never reused after its call finishes.
//!
//! Calls are not retried. Retry policy belongs to the caller, who can tell
//! from the [`RpcError`] variant whether the answer never came or came back
//! as a failure.

mod reply_queue;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ReplyStatus, RpcReply, RpcRequest};
use crate::{
    // ---
    log_debug,
    Address,
    CorrelationId,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    TransportPtr,
};

use reply_queue::ReplyQueue;

/// Request queue used by the automation service's callers when none is given.
pub const DEFAULT_RPC_QUEUE: &str = "rpc_queue:erxes-automations";

/// RPC client.
///
/// Cheap to clone (internally `Arc`-backed); clones share the transport.
///
/// # Example
///
/// ```no_run
/// # use queue_rpc::{RpcClient, RpcConfig, RpcRequest, create_transport};
/// # use serde_json::{json, Value};
/// # use std::time::Duration;
/// # async fn example() -> queue_rpc::Result<()> {
/// let config = RpcConfig::from_env("automations");
/// let transport = create_transport(&config).await?;
/// let client = RpcClient::with_transport(transport, config);
///
/// let answer: Option<Value> = client
///     .call(
///         "rpc_queue:erxes-api",
///         &RpcRequest::new("ping", json!({ "x": 1 })),
///         Duration::from_secs(5),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    config: RpcConfig,
}

impl RpcClient {
    // ---
    /// Create a client on an existing transport.
    pub fn with_transport(transport: TransportPtr, config: RpcConfig) -> Self {
        Self {
            inner: Arc::new(Inner { transport, config }),
        }
    }

    /// Open the transport named by `config` and create a client on it.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Connection` or `RpcError::InvalidConfig` from
    /// [`create_transport`](crate::create_transport).
    pub async fn new(config: &RpcConfig) -> Result<Self> {
        // ---
        let transport = crate::create_transport(config).await?;
        Ok(Self::with_transport(transport, config.clone()))
    }

    /// The transport this client publishes on.
    pub fn transport(&self) -> &TransportPtr {
        &self.inner.transport
    }

    /// Call `action` on the service behind `queue` with the configured
    /// default timeout.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn request<TReq, TResp>(
        &self,
        queue: &str,
        action: &str,
        data: TReq,
    ) -> Result<Option<TResp>>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        let request = RpcRequest::new(action, data);
        self.call(queue, &request, self.inner.config.request_timeout)
            .await
    }

    /// Send `request` to `queue` and wait up to `timeout` for the reply.
    ///
    /// Returns `Ok(Some(data))` for `status: success` and `Ok(None)` for
    /// `status: notFound`.
    ///
    /// # Errors
    ///
    /// - `RpcError::Handler` - the server replied `status: error`; carries its
    ///   `errorMessage` verbatim
    /// - `RpcError::Timeout` - no matching reply before `timeout`
    /// - `RpcError::ConsumerCancelled` - the broker ended the reply consumer
    /// - `RpcError::InvalidReply` - the matching reply could not be decoded
    /// - `RpcError::Serialization` - request encoding or `data` decoding failed
    /// - `RpcError::Transport` - declaring, consuming or publishing failed
    pub async fn call<TReq, TResp>(
        &self,
        queue: &str,
        request: &RpcRequest<TReq>,
        timeout: Duration,
    ) -> Result<Option<TResp>>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        self.call_with_cancel(queue, request, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`call`](Self::call), but also gives up with
    /// `RpcError::Cancelled` once `cancel` fires.
    ///
    /// The reply queue is deleted on every outcome.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call), plus `RpcError::Cancelled`.
    pub async fn call_with_cancel<TReq, TResp>(
        &self,
        queue: &str,
        request: &RpcRequest<TReq>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<TResp>>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let body = Bytes::from(serde_json::to_vec(request)?);
        let token = CorrelationId::generate();
        let transport = &self.inner.transport;

        let mut reply_queue = ReplyQueue::open(transport).await?;

        let env = Envelope::request(
            Address::from(queue),
            body,
            Arc::from(&token),
            reply_queue.address().clone(),
        );

        log_debug!(
            "[{}] call {queue} action={} correlation_id={token} reply_to={}",
            transport.transport_id(),
            request.action,
            reply_queue.address()
        );

        if let Err(err) = transport.publish(env).await {
            reply_queue.release().await;
            return Err(err);
        }

        let outcome = reply_queue.wait_for(&token, timeout, cancel).await;
        reply_queue.release().await;

        match outcome {
            Ok(payload) => decode_reply(&payload),
            Err(err) => {
                log_debug!("[{}] call {queue} correlation_id={token} failed: {err}", transport.transport_id());
                Err(err)
            }
        }
    }
}

/// Turn a reply body into the caller's result.
fn decode_reply<TResp: DeserializeOwned>(payload: &[u8]) -> Result<Option<TResp>> {
    // ---
    let reply: RpcReply =
        serde_json::from_slice(payload).map_err(|e| RpcError::InvalidReply(e.to_string()))?;

    match reply.status {
        ReplyStatus::Success => {
            let data = reply.data.unwrap_or(Value::Null);
            Ok(Some(serde_json::from_value(data)?))
        }
        ReplyStatus::NotFound => Ok(None),
        ReplyStatus::Error => Err(RpcError::Handler(
            reply
                .error_message
                .unwrap_or_else(|| "remote handler reported an error".to_string()),
        )),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_returns_data() {
        // ---
        let got: Option<Value> =
            decode_reply(br#"{"status":"success","data":{"x":1}}"#).unwrap();
        assert_eq!(got, Some(json!({ "x": 1 })));
    }

    #[test]
    fn test_not_found_is_empty_not_error() {
        // ---
        let got: Option<Value> = decode_reply(br#"{"status":"notFound"}"#).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_error_keeps_message_verbatim() {
        // ---
        let err = decode_reply::<Value>(br#"{"status":"error","errorMessage":"Trigger 7: bad"}"#)
            .unwrap_err();
        match err {
            RpcError::Handler(msg) => assert_eq!(msg, "Trigger 7: bad"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_invalid_reply() {
        // ---
        let err = decode_reply::<Value>(b"not json").unwrap_err();
        assert!(matches!(err, RpcError::InvalidReply(_)));

        let err = decode_reply::<Value>(br#"{"status":"maybe"}"#).unwrap_err();
        assert!(matches!(err, RpcError::InvalidReply(_)));
    }
}
