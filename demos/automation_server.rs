//! Automation RPC server.
//!
//! Answers `get-response-check-automation` on `rpc_queue:erxes-api` and
//! `rpc_queue:erkhet`.
//!
//! Run with: cargo run --example automation_server --features transport_lapin
//!
//! Requires: RabbitMQ reachable at `$RABBITMQ_HOST` (default `amqp://localhost`)
mod common;

use common::{check_trigger, CheckTrigger, AUTOMATION_QUEUES, CHECK_AUTOMATION};
use queue_rpc::{create_transport, RetryConfig, RpcConfig, RpcError, RpcServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    env_logger::init();

    let config = RpcConfig::from_env("automation-server").with_connect_retry(RetryConfig::default());
    println!("connecting to {}", config.broker_uri);

    let transport = create_transport(&config).await?;

    let mut builder = RpcServer::builder(transport.clone());
    for queue in AUTOMATION_QUEUES {
        builder = builder.queue(queue);
    }

    let server = builder
        .handler(CHECK_AUTOMATION, |req: CheckTrigger| async move {
            if req.target_id.is_empty() {
                return Err(RpcError::handler("targetId is required"));
            }
            Ok(check_trigger(&req))
        })
        .build()?;

    // Setup signal handling for graceful shutdown
    let server_clone = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Received Ctrl+C, shutting down...");
            server_clone.shutdown();
        }
    });

    // Blocks until shutdown() is called or the broker drops a consumer
    server.run().await?;

    transport.close().await?;
    Ok(())
}
