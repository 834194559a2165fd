//! Client and server in one process over the in-memory broker.
//!
//! Run with: cargo run --example ping_memory
mod common;

use common::{check_trigger, CheckTrigger, TriggerResponse, CHECK_AUTOMATION};
use queue_rpc::{create_transport, RpcClient, RpcConfig, RpcServer, DEFAULT_RPC_QUEUE};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    env_logger::init();

    let config = RpcConfig::memory("ping");
    let transport = create_transport(&config).await?;

    let server = RpcServer::builder(transport.clone())
        .queue(DEFAULT_RPC_QUEUE)
        .handler("ping", |data: Value| async move { Ok(Some(data)) })
        .handler(CHECK_AUTOMATION, |req: CheckTrigger| async move {
            Ok(check_trigger(&req))
        })
        .build()?;

    server.listen().await?;
    let handle = server.spawn();

    let client = RpcClient::with_transport(transport.clone(), config);

    let pong: Option<Value> = client
        .request(DEFAULT_RPC_QUEUE, "ping", json!({ "x": 1 }))
        .await?;
    println!("ping -> {pong:?}");

    for kind in ["deal", "invoice"] {
        let check = CheckTrigger {
            trigger_type: kind.to_string(),
            target_id: "42".to_string(),
        };
        let resp: Option<TriggerResponse> = client
            .request(DEFAULT_RPC_QUEUE, CHECK_AUTOMATION, check)
            .await?;
        println!("{kind} -> {resp:?}");
    }

    server.shutdown();
    handle.await??;

    transport.close().await?;
    Ok(())
}
