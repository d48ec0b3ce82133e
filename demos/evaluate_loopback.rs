// Evaluate against an in-process fake engine
//
// The engine pauses once, answers every evaluate by echoing the bound handle of
// `a` plus one, and resumes on `continue`.

use anyhow::{anyhow, Result};
use jsdebug_client::transport::RemoteEndpoint;
use jsdebug_client::{AdditionalContext, ClientConfig, DebugSession, Transport};
use serde_json::json;

async fn fake_engine(mut remote: RemoteEndpoint) {
    remote
        .send_event(
            "break",
            json!({"details": {"callFrames": [{"id": 0, "functionName": "main", "line": 1}]}}),
        )
        .await;

    while let Some(request) = remote.recv_request().await {
        let seq = request["seq"].as_u64().unwrap_or_default();
        match request["command"].as_str() {
            Some("evaluate") => {
                let bound = request["arguments"]["additional_context"][0]["handle"]
                    .as_i64()
                    .unwrap_or_default();
                let value = bound + 1;
                remote
                    .respond_success(
                        seq,
                        json!({"handle": 100, "type": "number", "value": value, "text": value.to_string()}),
                    )
                    .await;
            }
            Some("continue") => {
                remote.respond_running(seq).await;
                break;
            }
            _ => {
                remote.respond_failure(seq, "Unsupported command").await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("jsdebug_client=debug")
        .init();

    let config = ClientConfig::from_env()?;
    let (transport, remote) = Transport::loopback(config.outgoing_buffer);
    let session = DebugSession::start(transport, config)?;
    let engine = tokio::spawn(fake_engine(remote));

    let context = session
        .wait_for_pause()
        .await
        .ok_or_else(|| anyhow!("engine never paused"))?;
    println!("✓ Paused with {} call frames", context.call_frames().len());

    let mut bindings = AdditionalContext::new();
    bindings.insert("a".to_string(), "123".to_string());

    let evaluator = context.global_evaluator();
    let variable = tokio::task::spawn_blocking(move || evaluator.evaluate_sync("a+1", Some(&bindings)))
        .await??;
    println!("✓ {} = {}", variable.name(), variable.display_value());

    session.resume().await?;
    println!("✓ Resumed, context live: {}", context.is_live());

    engine.await?;
    Ok(())
}
