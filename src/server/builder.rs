//! RPC server builder.
//!
//! Collects the well-known request queues and the action handler table.
//! Everything is checked in [`build`](RpcServerBuilder::build); the table
//! cannot change afterwards.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;

use super::handler::{wrap_handler, HandlerRegistry};
use super::RpcServer;
use crate::{Result, RpcError, TransportPtr};

/// Builder for [`RpcServer`].
///
/// # Example
///
/// ```
/// use queue_rpc::{create_memory_transport_with_hub, MemoryHub, RpcConfig, RpcServerBuilder};
/// use serde_json::Value;
///
/// # async fn example() -> queue_rpc::Result<()> {
/// let transport =
///     create_memory_transport_with_hub(&RpcConfig::memory("server"), MemoryHub::new()).await?;
///
/// let server = RpcServerBuilder::new(transport)
///     .queue("rpc_queue:erxes-api")
///     .handler("ping", |data: Value| async move { Ok(Some(data)) })
///     .build()?;
///
/// server.listen().await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcServerBuilder {
    // ---
    transport: TransportPtr,
    queues: Vec<String>,
    registry: HandlerRegistry,

    // First registration error, reported by build()
    error: Option<RpcError>,
}

impl RpcServerBuilder {
    pub fn new(transport: TransportPtr) -> Self {
        // ---
        Self {
            transport,
            queues: Vec::new(),
            registry: HandlerRegistry::default(),
            error: None,
        }
    }

    /// Add a well-known queue to consume requests from.
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queues.push(name.into());
        self
    }

    /// Register `handler` for requests whose `action` equals `action`.
    ///
    /// The request's `data` is decoded into `TReq`; a shape mismatch is
    /// answered with an `error` reply. Return `Ok(None)` for "nothing
    /// found" (`status: notFound`) and `Err(RpcError::handler(..))` to send
    /// an `error` reply with that message.
    pub fn handler<F, Fut, TReq, TResp>(mut self, action: &str, handler: F) -> Self
    where
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<TResp>>> + Send + 'static,
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
    {
        // ---
        if self.error.is_none() {
            if let Err(err) = self.registry.insert(action, wrap_handler(handler)) {
                self.error = Some(err);
            }
        }
        self
    }

    /// Validate and build the server (consumes self).
    ///
    /// # Errors
    ///
    /// `RpcError::InvalidConfig` for a duplicate or empty action, an empty or
    /// duplicate queue name, no queues, or no handlers.
    pub fn build(self) -> Result<RpcServer> {
        // ---
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.queues.is_empty() {
            return Err(RpcError::InvalidConfig("no request queue configured".into()));
        }
        if self.registry.is_empty() {
            return Err(RpcError::InvalidConfig("no handler registered".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for q in &self.queues {
            if q.trim().is_empty() {
                return Err(RpcError::InvalidConfig("empty queue name".into()));
            }
            if !seen.insert(q.as_str()) {
                return Err(RpcError::InvalidConfig(format!("duplicate queue '{q}'")));
            }
        }

        Ok(RpcServer::new(self.transport, self.queues, self.registry))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport_with_hub, MemoryHub, RpcConfig};
    use serde_json::Value;

    async fn transport() -> TransportPtr {
        create_memory_transport_with_hub(&RpcConfig::memory("builder"), MemoryHub::new())
            .await
            .unwrap()
    }

    fn echo(data: Value) -> impl Future<Output = Result<Option<Value>>> {
        async move { Ok(Some(data)) }
    }

    #[tokio::test]
    async fn test_valid_config_builds() {
        // ---
        let server = RpcServerBuilder::new(transport().await)
            .queue("rpc_queue:erxes-api")
            .queue("rpc_queue:erkhet")
            .handler("ping", echo)
            .build();
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_action_rejected() {
        // ---
        let res = RpcServerBuilder::new(transport().await)
            .queue("q")
            .handler("ping", echo)
            .handler("ping", echo)
            .build();
        assert!(matches!(res, Err(RpcError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_missing_queue_or_handler_rejected() {
        // ---
        let res = RpcServerBuilder::new(transport().await)
            .handler("ping", echo)
            .build();
        assert!(matches!(res, Err(RpcError::InvalidConfig(_))));

        let res = RpcServerBuilder::new(transport().await).queue("q").build();
        assert!(matches!(res, Err(RpcError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_bad_queue_names_rejected() {
        // ---
        let res = RpcServerBuilder::new(transport().await)
            .queue("q")
            .queue("q")
            .handler("ping", echo)
            .build();
        assert!(matches!(res, Err(RpcError::InvalidConfig(_))));

        let res = RpcServerBuilder::new(transport().await)
            .queue(" ")
            .handler("ping", echo)
            .build();
        assert!(matches!(res, Err(RpcError::InvalidConfig(_))));
    }
}
