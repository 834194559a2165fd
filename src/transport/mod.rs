//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait, exposed only through constructor functions. Broker
//! transports are hidden behind feature flags.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::create_lapin_transport;

pub use memory::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

use crate::{Result, RpcConfig, RpcError, TransportPtr};

/// Open the transport selected by the URI scheme of `config.broker_uri`.
///
/// - `memory://` → in-process [`MemoryHub`] shared by the whole process
/// - `amqp://`, `amqps://` → lapin (feature `transport_lapin`)
///
/// # Errors
///
/// - [`RpcError::InvalidConfig`] for an unknown scheme or a scheme whose
///   transport was not compiled in
/// - [`RpcError::Connection`] if the broker stays unreachable after the
///   configured connection retries
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    let uri = config.broker_uri.as_str();
    let scheme = uri.split_once("://").map(|(s, _)| s).unwrap_or_default();

    match scheme {
        "memory" => create_memory_transport(config).await,

        #[cfg(feature = "transport_lapin")]
        "amqp" | "amqps" => create_lapin_transport(config).await,

        #[cfg(not(feature = "transport_lapin"))]
        "amqp" | "amqps" => Err(RpcError::InvalidConfig(format!(
            "{uri}: AMQP support requires the `transport_lapin` feature"
        ))),

        _ => Err(RpcError::InvalidConfig(format!(
            "unsupported broker URI: {uri:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        // ---
        let config = RpcConfig::with_broker("mqtt://localhost:1883", "x");
        let res = create_transport(&config).await;
        assert!(matches!(res, Err(RpcError::InvalidConfig(_))));
    }

    #[cfg(not(feature = "transport_lapin"))]
    #[tokio::test]
    async fn test_amqp_without_feature_is_invalid_config() {
        // ---
        let config = RpcConfig::with_broker(crate::DEFAULT_BROKER_URI, "x");
        match create_transport(&config).await {
            Err(RpcError::InvalidConfig(msg)) => assert!(msg.contains("transport_lapin")),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("amqp transport created without the feature"),
        }
    }

    #[tokio::test]
    async fn test_memory_scheme_selects_memory_transport() {
        // ---
        let transport = create_transport(&RpcConfig::memory("mem")).await.unwrap();
        assert_eq!(transport.transport_id(), "mem");
        transport.close().await.unwrap();
    }
}
