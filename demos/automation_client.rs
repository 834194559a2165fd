//! Automation RPC client.
//!
//! Asks the automation server whether a trigger fires, then sends a one-way
//! notification.
//!
//! Run with: cargo run --example automation_client --features transport_lapin -- deal 42
//!
//! Requires: RabbitMQ at `$RABBITMQ_HOST` and a running `automation_server`.
mod common;

use common::{CheckTrigger, TriggerResponse, AUTOMATION_QUEUES, CHECK_AUTOMATION};
use queue_rpc::{Publisher, RpcClient, RpcConfig, RpcError, RpcRequest};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let trigger_type = args.next().unwrap_or_else(|| "deal".to_string());
    let target_id = args.next().unwrap_or_else(|| "42".to_string());

    let config = RpcConfig::from_env("automation-client");
    let client = RpcClient::new(&config).await?;

    let request = RpcRequest::new(
        CHECK_AUTOMATION,
        CheckTrigger {
            trigger_type: trigger_type.clone(),
            target_id,
        },
    );

    let reply: queue_rpc::Result<Option<TriggerResponse>> = client
        .call(AUTOMATION_QUEUES[0], &request, Duration::from_secs(5))
        .await;

    match reply {
        Ok(Some(resp)) => println!("{trigger_type}: fires {:?}", resp.automation_ids),
        Ok(None) => println!("{trigger_type}: no automation listens"),
        Err(RpcError::Handler(msg)) => println!("{trigger_type}: server error: {msg}"),
        Err(RpcError::Timeout) => println!("{trigger_type}: no answer within 5s"),
        Err(err) => return Err(err.into()),
    }

    Publisher::new(client.transport().clone())
        .send("automations:trigger-checked", &serde_json::json!({ "type": trigger_type }))
        .await?;

    client.transport().close().await?;
    Ok(())
}
