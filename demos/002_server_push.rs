//! Server-initiated traffic.
//!
//! Demonstrates:
//! - A client exposing its own handlers
//! - The server calling a connected client
//! - Events, ephemeral events and system events
//! - Per-call timeouts
//!
//! Usage:
//!   cargo run --example 002_server_push
//!   cargo run --example 002_server_push -- --debug

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use common::Args;
use serde_json::json;
use xmn::router::{Handlers, handler};
use xmn::{DEFAULT_BIND_IP, Error, Peer, PeerOptions, Result, Router, Server};

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    common::init_logging(&args);

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    println!("=== 002: Server Push ===\n");

    println!("[1] Starting server and client...");

    // Deadlines are checked on each housekeeping pass
    let options = PeerOptions::new().with_housekeeping_interval(Duration::from_millis(50));
    let server = Server::bind(DEFAULT_BIND_IP, 0, Arc::new(Router::new()), options).await?;

    let client_api = Handlers::new()
        .with(
            "confirm",
            handler(|ctx, call| async move {
                println!("    [client] {} asked: {}", ctx.label(), call.data["question"]);
                Ok::<_, Error>(json!({"answer": "yes"}))
            }),
        )
        .with(
            "stall",
            handler(|_ctx, _call| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Error>(json!(null))
            }),
        )
        .with(
            "notice",
            handler(|ctx, call| async move {
                println!("    [client] {} -> {}", ctx.label(), call.data);
                Ok::<_, Error>(json!(null))
            }),
        );

    let mut client_router = Router::new();
    client_router.register("confirm", &client_api, "server")?;
    client_router.register("stall", &client_api, "server")?;
    client_router.register("notice", &client_api, "server")?;

    let client = Peer::builder()
        .router(Arc::new(client_router))
        .connect(&server.ws_url())?;
    client.wait_open().await?;

    // The server registers the peer right after the upgrade
    let server_side = loop {
        if let Some(peer) = server.peers().pop() {
            break peer;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    println!("    ✓ Peer {} connected\n", server_side.id());

    println!("[2] Server -> client request...");
    let reply = server_side
        .request("confirm", json!({"question": "proceed?"}))
        .await?;
    println!("    ✓ Reply: {reply}\n");

    println!("[3] Server -> client events...");
    server_side.event("notice", json!({"kind": "event"})).await?;
    server_side.ephemeral_event("notice", json!({"kind": "ephemeral"})).await?;
    server_side.system_event("notice", json!({"kind": "system"})).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!();

    println!("[4] Request with a 200ms deadline...");
    match server_side
        .request_with_timeout("stall", json!(null), Duration::from_millis(200))
        .await
    {
        Err(e) if e.is_timeout() => println!("    ✓ {e}"),
        other => println!("    unexpected {other:?}"),
    }

    println!("\n[5] Shutting down...");
    server.shutdown().await;
    client.closed().await;
    println!("    ✓ Done");

    Ok(())
}
