//! End-to-end client-server benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use graphwire_client::{Client, ConnectionConfig};
use graphwire_protocol::Request;
use graphwire_server::{ExecutionMode, LoopbackSession, Server, ServerConfig, TransportConfig};
use serde_json::Map;
use std::sync::Arc;
use tokio::runtime::Runtime;

struct TestSetup {
    server: Arc<Server>,
    client: Client,
}

impl Drop for TestSetup {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn setup_server_and_client(rt: &Runtime, execution: ExecutionMode) -> TestSetup {
    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = ServerConfig::new(addr).with_transport(TransportConfig {
            execution,
            ..TransportConfig::default()
        });
        let server = Arc::new(Server::new(config, LoopbackSession::factory()));
        let running = server.clone();
        tokio::spawn(async move {
            let _ = running.serve(listener).await;
        });

        let client = Client::new(ConnectionConfig::new(addr).with_client_name("bench"));
        client.connect().await.unwrap();
        client.init(None).await.unwrap();

        TestSetup { server, client }
    })
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("e2e_round_trip");
    group.throughput(Throughput::Elements(1));

    for (name, execution) in [("inline", ExecutionMode::Inline), ("worker", ExecutionMode::Worker)] {
        let setup = setup_server_and_client(&rt, execution);
        group.bench_function(name, |b| {
            b.to_async(&rt)
                .iter(|| async { black_box(setup.client.reset().await.unwrap()) });
        });
    }

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt, ExecutionMode::Worker);

    let mut group = c.benchmark_group("e2e_query");
    group.throughput(Throughput::Elements(1));

    group.bench_function("run_pull_all", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                setup
                    .client
                    .query("MATCH (n) RETURN n", Map::new())
                    .await
                    .unwrap(),
            )
        });
    });

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt, ExecutionMode::Worker);

    let mut group = c.benchmark_group("e2e_pipeline");

    for depth in [1, 10, 100] {
        let requests: Vec<Request> = (0..depth)
            .flat_map(|i| [Request::run(format!("RETURN {}", i)), Request::PullAll])
            .collect();

        group.throughput(Throughput::Elements(requests.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &requests, |b, requests| {
            b.to_async(&rt)
                .iter(|| async { black_box(setup.client.pipeline(requests).await.unwrap()) });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_query, bench_pipeline);

criterion_main!(benches);
