//! Codec and round-trip benchmark suite.
//!
//! - Frame encode/decode at different payload sizes
//! - Request round trips over a localhost WebSocket at different concurrency
//!
//! Run with: cargo bench --bench codec
//! Results saved to: target/criterion/

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Value, json};
use tokio::runtime::Runtime;

use xmn::protocol::{codec, now_ms};
use xmn::router::{Handlers, handler};
use xmn::{Call, DEFAULT_BIND_IP, Error, Peer, PeerOptions, Reply, Router, Seq, Server, WireMessage};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_ITEMS: &[usize] = &[0, 16, 256, 4096];
const CONCURRENCY: &[usize] = &[1, 16, 128];

// ============================================================================
// Helpers
// ============================================================================

fn payload(items: usize) -> Value {
    json!({
        "items": (0..items).map(|i| json!({"id": i, "label": format!("item-{i}")})).collect::<Vec<_>>(),
    })
}

fn request_frame(items: usize) -> WireMessage {
    WireMessage::Request(Call::new("getProfile", Seq::new(42), now_ms(), payload(items)))
}

// ============================================================================
// Benchmark: Codec
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for &items in PAYLOAD_ITEMS {
        let message = request_frame(items);
        let bytes = codec::encode(&message).map(|f| f.len()).unwrap_or_default();
        group.throughput(Throughput::Bytes(bytes as u64));
        group.bench_with_input(BenchmarkId::new("request", items), &message, |b, message| {
            b.iter(|| codec::encode(black_box(message)));
        });
    }

    let call = Call::new("getProfile", Seq::new(42), now_ms(), Value::Null);
    let reply = WireMessage::RequestResponse(Reply::failure(&call, &Error::unknown_api("getProfile")));
    group.bench_function("error_response", |b| {
        b.iter(|| codec::encode(black_box(&reply)));
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for &items in PAYLOAD_ITEMS {
        let Ok(frame) = codec::encode(&request_frame(items)) else {
            continue;
        };
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::new("request", items), &frame, |b, frame| {
            b.iter(|| codec::decode(black_box(frame)));
        });
    }

    let unknown = r#"{"type":"BOGUS","name":"x","seq":1,"ts":0,"data":null}"#;
    group.bench_function("unknown_type", |b| {
        b.iter(|| codec::decode(black_box(unknown)));
    });

    group.finish();
}

// ============================================================================
// Benchmark: Round Trip
// ============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");

    let (server, client) = rt.block_on(async {
        let echo = Handlers::new().with(
            "echo",
            handler(|_ctx, call| async move { Ok::<_, Error>(call.data) }),
        );
        let mut router = Router::new();
        router.register("echo", &echo, "bench").expect("register");

        let server = Server::bind(DEFAULT_BIND_IP, 0, Arc::new(router), PeerOptions::new())
            .await
            .expect("bind");
        let client = Peer::builder().connect(&server.ws_url()).expect("connect");
        client.wait_open().await.expect("open");
        (server, client)
    });

    let mut group = c.benchmark_group("round_trip");
    group.measurement_time(Duration::from_secs(10));

    for &concurrency in CONCURRENCY {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("requests", concurrency),
            &concurrency,
            |b, &n| {
                b.to_async(&rt).iter(|| {
                    let client = client.clone();
                    async move {
                        let calls: Vec<_> = (0..n).map(|i| client.request("echo", json!(i))).collect();
                        futures_util::future::try_join_all(calls).await
                    }
                });
            },
        );
    }

    group.finish();
    rt.block_on(server.shutdown());
}

criterion_group!(benches, bench_encode, bench_decode, bench_round_trip);
criterion_main!(benches);
