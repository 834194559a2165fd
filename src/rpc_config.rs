//! Public, transport-agnostic RPC configuration.
//!
//! The only deployment setting the protocol needs is the broker endpoint.
//! Request timeouts and connection retry are tuning knobs with defaults.

use std::time::Duration;

use crate::RetryConfig;

/// Environment variable holding the broker endpoint.
pub const BROKER_ENV_VAR: &str = "RABBITMQ_HOST";

/// Broker endpoint used when nothing is configured.
pub const DEFAULT_BROKER_URI: &str = "amqp://localhost";

/// Transport connection parameters and client defaults.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Broker endpoint.
    ///
    /// `amqp://` and `amqps://` select the AMQP transport, `memory://` the
    /// in-process hub.
    pub broker_uri: String,

    /// Identifier of the transport instance, used for logging.
    pub transport_id: String,

    /// Reply deadline used by [`RpcClient::request`](crate::RpcClient::request).
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// Retry policy for establishing the broker connection.
    ///
    /// `None` means a single attempt. RPC calls themselves are never retried.
    pub connect_retry: Option<RetryConfig>,
}

impl RpcConfig {
    /// Create a config for the given broker URI.
    pub fn with_broker(broker_uri: impl Into<String>, transport_id: impl Into<String>) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            transport_id: transport_id.into(),
            request_timeout: Duration::from_secs(30),
            connect_retry: None,
        }
    }

    /// Create a memory transport config (no broker).
    pub fn memory(transport_id: impl Into<String>) -> Self {
        Self::with_broker("memory://", transport_id)
    }

    /// Read the broker endpoint from `RABBITMQ_HOST`, falling back to
    /// `amqp://localhost`.
    ///
    /// An `amqp://` or `amqps://` endpoint needs the `transport_lapin`
    /// feature; without it [`create_transport`](crate::create_transport)
    /// rejects the config with `RpcError::InvalidConfig`. Set
    /// `RABBITMQ_HOST=memory://` to run against the in-process hub instead.
    /// Connection retries ([`with_connect_retry`](Self::with_connect_retry))
    /// only apply to the AMQP transport.
    pub fn from_env(transport_id: impl Into<String>) -> Self {
        let uri = std::env::var(BROKER_ENV_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BROKER_URI.to_string());
        Self::with_broker(uri, transport_id)
    }

    /// Set the default reply deadline.
    ///
    /// # Example
    ///
    /// ```
    /// use queue_rpc::RpcConfig;
    /// use std::time::Duration;
    ///
    /// let config = RpcConfig::memory("client")
    ///     .with_request_timeout(Duration::from_secs(10));
    /// assert_eq!(config.request_timeout, Duration::from_secs(10));
    /// ```
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Retry the initial broker connection with exponential backoff.
    pub fn with_connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = Some(retry);
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_memory_defaults() {
        // ---
        let config = RpcConfig::memory("node");
        assert_eq!(config.broker_uri, "memory://");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.connect_retry.is_none());
    }

    #[test]
    fn test_from_env_falls_back_to_loopback() {
        // ---
        // Only asserts the shape; the variable may be set on a CI host.
        let config = RpcConfig::from_env("node");
        match std::env::var(BROKER_ENV_VAR) {
            Ok(v) if !v.trim().is_empty() => assert_eq!(config.broker_uri, v),
            _ => assert_eq!(config.broker_uri, DEFAULT_BROKER_URI),
        }
    }
}
