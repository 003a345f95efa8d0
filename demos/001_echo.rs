//! Request/response round trip between a server and a client.
//!
//! Demonstrates:
//! - Registering handlers on a router
//! - Serving on a random localhost port
//! - Queuing a request before the connection opens
//! - The handshake reaching the server-side context
//! - Structured errors for failures and unknown APIs
//!
//! Usage:
//!   cargo run --example 001_echo
//!   cargo run --example 001_echo -- --debug
//!   cargo run --example 001_echo -- --trace

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

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
    println!("=== 001: Echo ===\n");

    // ========================================================================
    // Server
    // ========================================================================

    println!("[1] Starting server...");

    let api = Handlers::new()
        .with(
            "echo",
            handler(|_ctx, call| async move { Ok::<_, Error>(call.data) }),
        )
        .with(
            "whoami",
            handler(|ctx, _call| async move {
                Ok::<_, Error>(json!({
                    "client": ctx.peer_info.as_ref().clone(),
                    "offset_ms": ctx.server.ms_offset,
                    "remote": ctx.remote_address.map(|a| a.to_string()),
                }))
            }),
        )
        .with(
            "divide",
            handler(|_ctx, call| async move {
                let a = call.data["a"].as_f64().unwrap_or_default();
                let b = call.data["b"].as_f64().unwrap_or_default();
                if b == 0.0 {
                    return Err(Error::handler("DIVISION_BY_ZERO", "cannot divide by zero"));
                }
                Ok(json!(a / b))
            }),
        );

    let mut router = Router::new();
    router.register("echo", &api, "public")?;
    router.register("whoami", &api, "public")?;
    router.register("divide", &api, "public")?;

    let server = Server::bind(DEFAULT_BIND_IP, 0, Arc::new(router), PeerOptions::new()).await?;
    println!("    ✓ Listening on {}\n", server.ws_url());

    // ========================================================================
    // Client
    // ========================================================================

    println!("[2] Connecting client...");

    let client = Peer::builder()
        .handshake(json!({"client": "001_echo", "version": 1}))
        .connect(&server.ws_url())?;

    // Queued until the socket opens
    let early = client.request("echo", json!({"queued": true}));
    client.wait_open().await?;
    println!("    ✓ Connected ({})", client.state());
    println!("    ✓ Early request answered: {}\n", early.await?);

    // ========================================================================
    // Calls
    // ========================================================================

    println!("[3] Calling APIs...");

    let me = client.request("whoami", json!(null)).await?;
    println!("    whoami  -> {me}");

    let quotient = client.request("divide", json!({"a": 22, "b": 7})).await?;
    println!("    divide  -> {quotient}");

    match client.request("divide", json!({"a": 1, "b": 0})).await {
        Err(Error::Remote { code, message }) => println!("    divide  -> {code}: {message}"),
        other => println!("    divide  -> unexpected {other:?}"),
    }

    match client.request("missing", json!(null)).await {
        Err(e) => println!("    missing -> {e}"),
        Ok(v) => println!("    missing -> unexpected {v}"),
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    println!("\n[4] Shutting down...");
    client.close();
    client.closed().await;
    server.shutdown().await;
    println!("    ✓ Done");

    Ok(())
}
