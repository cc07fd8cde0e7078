//! Load driver: runs a mixed read/write workload through the batching
//! engine against an in-memory backend and prints the metrics snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use opbatch_core::{Document, MetricsSnapshot, OperationError};
use opbatch_server::logging::{init_tracing, LogFormat};
use opbatch_server::{
    BatchEngine, CacheAdapter, CacheClient, DocumentAdapter, DocumentClient, EngineConfig,
    MemoryCacheStore, MemoryDocumentStore,
};
use rand::Rng;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Cache,
    Document,
}

#[derive(Debug, Parser)]
#[command(name = "opbatch-driver", about = "Drive a batched workload and report engine metrics")]
struct Args {
    /// Backend variant to exercise.
    #[arg(long, value_enum, default_value = "cache", env = "OPBATCH_BACKEND")]
    backend: Backend,

    /// Total operations to issue.
    #[arg(long, default_value_t = 10_000, env = "OPBATCH_OPERATIONS")]
    operations: usize,

    /// Concurrent callers.
    #[arg(long, default_value_t = 32, env = "OPBATCH_CONCURRENCY")]
    concurrency: usize,

    /// Share of operations that are reads, 0.0 to 1.0.
    #[arg(long, default_value_t = 0.7)]
    read_ratio: f64,

    /// Number of distinct keys or documents the workload touches.
    #[arg(long, default_value_t = 1_000)]
    keyspace: u64,

    #[arg(long, default_value_t = 10, env = "OPBATCH_FAST_INTERVAL_MS")]
    fast_interval_ms: u64,

    #[arg(long, default_value_t = 50, env = "OPBATCH_SLOW_INTERVAL_MS")]
    slow_interval_ms: u64,

    #[arg(long, default_value_t = 100, env = "OPBATCH_MAX_READ_BATCH")]
    max_read_batch_size: usize,

    #[arg(long, default_value_t = 500, env = "OPBATCH_MAX_WRITE_BATCH")]
    max_write_batch_size: usize,

    /// Disable metrics collection.
    #[arg(long)]
    no_metrics: bool,

    /// Simulated backend round-trip latency in milliseconds.
    #[arg(long, default_value_t = 1)]
    store_latency_ms: u64,

    /// Serve Prometheus metrics on this address while the workload runs.
    #[arg(long, env = "OPBATCH_PROMETHEUS_ADDR")]
    prometheus: Option<SocketAddr>,

    #[arg(long, value_enum, default_value = "pretty", env = "OPBATCH_LOG_FORMAT")]
    log_format: LogFormat,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            fast_interval_ms: self.fast_interval_ms,
            slow_interval_ms: self.slow_interval_ms,
            max_read_batch_size: self.max_read_batch_size,
            max_write_batch_size: self.max_write_batch_size,
            metrics_enabled: !self.no_metrics,
            ..EngineConfig::default()
        }
    }

    fn latency(&self) -> Option<Duration> {
        (self.store_latency_ms > 0).then(|| Duration::from_millis(self.store_latency_ms))
    }

    /// Operations each caller issues; the first callers take the remainder.
    fn share(&self, caller: usize) -> usize {
        let base = self.operations / self.concurrency;
        base + usize::from(caller < self.operations % self.concurrency)
    }
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: u64,
    failed: u64,
}

impl Tally {
    fn record<T>(&mut self, result: Result<T, OperationError>) {
        match result {
            Ok(_) => self.succeeded += 1,
            Err(err) => {
                self.failed += 1;
                warn!(error = %err, "operation failed");
            }
        }
    }

    fn merge(&mut self, other: Tally) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

fn document(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}

async fn run_cache(args: &Args) -> anyhow::Result<(Tally, MetricsSnapshot)> {
    let store = Arc::new(MemoryCacheStore::new());
    store.set_latency(args.latency());
    let engine = Arc::new(BatchEngine::start(
        CacheAdapter::new(store),
        args.engine_config(),
    )?);
    let client = CacheClient::new(Arc::clone(&engine), "driver");

    let mut callers = JoinSet::new();
    for caller in 0..args.concurrency {
        let client = client.clone();
        let count = args.share(caller);
        let (read_ratio, keyspace) = (args.read_ratio, args.keyspace);
        callers.spawn(async move {
            let mut tally = Tally::default();
            for _ in 0..count {
                let (roll, key, delete) = {
                    let mut rng = rand::rng();
                    (
                        rng.random::<f64>(),
                        rng.random_range(0..keyspace),
                        rng.random_bool(0.1),
                    )
                };
                let key = format!("k{key}");
                let pending = if roll < read_ratio {
                    client.get(key)
                } else if delete {
                    client.delete(key)
                } else {
                    client.set(key, json!({ "caller": caller, "at": roll }))
                };
                match pending {
                    Ok(pending) => tally.record(pending.await),
                    Err(err) => tally.record::<()>(Err(err)),
                }
            }
            tally
        });
    }

    let tally = join_callers(callers).await?;
    engine.shutdown().await.context("cache store close failed")?;
    Ok((tally, engine.metrics()))
}

async fn run_document(args: &Args) -> anyhow::Result<(Tally, MetricsSnapshot)> {
    let store = Arc::new(MemoryDocumentStore::new());
    store.set_latency(args.latency());
    let config = args.engine_config();
    let engine = Arc::new(BatchEngine::start(
        DocumentAdapter::new(store, config.readiness_timeout()),
        config,
    )?);
    let client = DocumentClient::new(Arc::clone(&engine), "items");

    let mut callers = JoinSet::new();
    for caller in 0..args.concurrency {
        let client = client.clone();
        let count = args.share(caller);
        let (read_ratio, keyspace) = (args.read_ratio, args.keyspace);
        callers.spawn(async move {
            let mut tally = Tally::default();
            for _ in 0..count {
                let (roll, sku, write) = {
                    let mut rng = rand::rng();
                    (
                        rng.random::<f64>(),
                        rng.random_range(0..keyspace),
                        rng.random_range(0..10u8),
                    )
                };
                let filter = document(json!({ "sku": sku }));
                let pending = if roll < read_ratio {
                    client.select(filter)
                } else {
                    match write {
                        0 => client.delete(filter),
                        1..=3 => client.insert(document(
                            json!({ "sku": sku, "qty": 1, "caller": caller }),
                        )),
                        _ => client.upsert(filter, document(json!({ "$inc": { "qty": 1 } }))),
                    }
                };
                match pending {
                    Ok(pending) => tally.record(pending.await),
                    Err(err) => tally.record::<()>(Err(err)),
                }
            }
            tally
        });
    }

    let tally = join_callers(callers).await?;
    engine.shutdown().await.context("document store close failed")?;
    Ok((tally, engine.metrics()))
}

async fn join_callers(mut callers: JoinSet<Tally>) -> anyhow::Result<Tally> {
    let mut total = Tally::default();
    while let Some(joined) = callers.join_next().await {
        total.merge(joined.context("caller task panicked")?);
    }
    Ok(total)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format, "info")?;
    anyhow::ensure!(args.concurrency > 0, "--concurrency must be at least 1");
    anyhow::ensure!(args.keyspace > 0, "--keyspace must be at least 1");
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.read_ratio),
        "--read-ratio must be between 0.0 and 1.0"
    );

    if let Some(addr) = args.prometheus {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "serving Prometheus metrics");
    }

    info!(
        backend = ?args.backend,
        operations = args.operations,
        concurrency = args.concurrency,
        "starting workload"
    );
    let started = Instant::now();
    let (tally, snapshot) = match args.backend {
        Backend::Cache => run_cache(&args).await?,
        Backend::Document => run_document(&args).await?,
    };
    let elapsed = started.elapsed();

    info!(
        succeeded = tally.succeeded,
        failed = tally.failed,
        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        batches = snapshot.total_batches,
        average_batch_size = snapshot.average_batch_size,
        "workload finished"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
