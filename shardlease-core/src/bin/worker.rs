//! Lease worker demo binary
//!
//! Runs several workers in one process over an in-memory lease table and
//! serves the lease table and metrics over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use shardlease_core::discovery::StaticShardDiscovery;
use shardlease_core::store::{InMemoryLeaseStore, LeaseRecord, LeaseStore, LeaseSummary};
use shardlease_core::worker::{RecordingProcessor, Worker};
use shardlease_core::WorkerConfig;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    store: Arc<InMemoryLeaseStore>,
    workers: Arc<Vec<Worker>>,
}

async fn leases(State(state): State<AppState>) -> Json<Vec<LeaseSummary>> {
    match state.store.scan().await {
        Ok(rows) => Json(rows),
        Err(e) => {
            warn!("Lease scan failed: {}", e);
            Json(Vec::new())
        }
    }
}

async fn lease(
    State(state): State<AppState>,
    Path(shard_id): Path<String>,
) -> Result<Json<LeaseRecord>, StatusCode> {
    let Some(worker) = state.workers.first() else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    match worker.lease(&shard_id).await {
        Ok(record) => Ok(Json(record)),
        Err(e) if e.is_missing_entry() => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(shard_id = %shard_id, "Lease lookup failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting shardlease worker");

    let base = WorkerConfig::from_env()?;
    let shard_count: usize = env_or("SHARDLEASE_SHARDS", 8);
    let worker_count: usize = env_or("SHARDLEASE_WORKERS", 3).max(1);
    let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9100".into())
        .parse()?;

    let discovery = Arc::new(StaticShardDiscovery::with_count("shard", shard_count));
    let store = Arc::new(InMemoryLeaseStore::with_shards(discovery.shard_ids()));

    let mut workers = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let config = WorkerConfig {
            worker_id: format!("{}-{}", base.worker_id, i),
            ..base.clone()
        };
        let worker = Worker::new(config, store.clone(), Arc::new(RecordingProcessor::new()))?
            .with_discovery(discovery.clone());
        worker.start()?;
        workers.push(worker);
    }
    info!(workers = worker_count, shards = shard_count, "Workers running");

    let workers = Arc::new(workers);
    let state = AppState {
        store: store.clone(),
        workers: workers.clone(),
    };
    let app = Router::new()
        .route("/leases", get(leases))
        .route("/leases/:shard_id", get(lease))
        .route("/metrics", get(|| async { shardlease_core::metrics::gather_system_metrics() }))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("HTTP API listening on {}", bind_addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    });
    if let Err(e) = server.await {
        warn!("HTTP server error: {}", e);
    }

    info!("Shutting down workers");
    let results = futures::future::join_all(workers.iter().map(|w| w.shutdown())).await;
    for (worker, result) in workers.iter().zip(results) {
        if let Err(e) = result {
            error!(worker_id = worker.worker_id(), "Shutdown failed: {}", e);
        }
    }

    Ok(())
}
