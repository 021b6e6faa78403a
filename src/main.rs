//! sensor-stream - streaming sensor pipeline
//!
//! Ingests readings, keeps rolling statistics and anomaly flags per sensor,
//! aggregates trailing windows and fans coalesced frames out over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Built-in simulator (10 sensors at 100 Hz), hub on 0.0.0.0:8080
//! cargo run --release
//!
//! # JSON lines from stdin
//! ./producer | ./sensor-stream --stdin
//!
//! # Durable storage, no network surface
//! ./sensor-stream --storage sled --no-server
//! ```
//!
//! # Environment Variables
//!
//! - `SENSOR_STREAM_CONFIG`: Path to a TOML config file
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sensor_stream::broadcast::websocket::{self, StreamHubState};
use sensor_stream::config::{self, defaults, StorageBackend, StreamConfig};
use sensor_stream::pipeline::{run_producer, ProcessingLoop};
use sensor_stream::storage::StorageError;
use sensor_stream::{
    AggregationEngine, BroadcastCoalescer, InMemoryStore, IngestionQueue, PassThroughAcknowledger,
    PersistenceDispatcher, SimulatedSource, SledStore, StdinSource, StorageSink,
    SubscriptionRegistry,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "sensor-stream")]
#[command(about = "Streaming sensor pipeline with rolling statistics and coalesced fan-out")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML config file (overrides the standard search order)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Read JSON readings from stdin (one per line) instead of the simulator
    #[arg(long)]
    stdin: bool,

    /// Number of simulated sensors
    #[arg(long)]
    sensors: Option<usize>,

    /// Simulator ticks per second (one reading per sensor per tick)
    #[arg(long)]
    rate: Option<u32>,

    /// Stream hub bind address (default: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Do not start the WebSocket stream hub
    #[arg(long)]
    no_server: bool,

    /// Storage backend
    #[arg(long, value_enum)]
    storage: Option<StorageBackend>,

    /// Emit logs as JSON
    #[arg(long, env = "SENSOR_STREAM_JSON_LOGS")]
    json_logs: bool,
}

impl CliArgs {
    /// Apply command-line overrides on top of the loaded config.
    fn apply(&self, config: &mut StreamConfig) {
        if let Some(sensors) = self.sensors {
            config.simulator.sensors = sensors;
        }
        if let Some(rate) = self.rate {
            config.simulator.rate_hz = rate;
        }
        if let Some(addr) = &self.addr {
            config.server.addr.clone_from(addr);
        }
        if self.no_server {
            config.server.enabled = false;
        }
        if let Some(backend) = self.storage {
            config.storage.backend = backend;
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    Producer,
    AggregationEngine,
    Coalescer,
    PersistenceWorker,
    Housekeeping,
    StreamServer,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Producer => write!(f, "Producer"),
            Self::AggregationEngine => write!(f, "AggregationEngine"),
            Self::Coalescer => write!(f, "Coalescer"),
            Self::PersistenceWorker => write!(f, "PersistenceWorker"),
            Self::Housekeeping => write!(f, "Housekeeping"),
            Self::StreamServer => write!(f, "StreamServer"),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Concrete backend kept alongside the trait object for periodic pruning.
#[derive(Clone)]
enum Storage {
    Memory(Arc<InMemoryStore>),
    Sled(Arc<SledStore>),
}

impl Storage {
    fn open(config: &StreamConfig) -> Result<Self> {
        let storage = &config.storage;
        match storage.backend {
            StorageBackend::Memory => Ok(Self::Memory(Arc::new(InMemoryStore::new(
                storage.ttl(),
                storage.max_list_len,
            )))),
            StorageBackend::Sled => {
                if let Some(parent) = storage.path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create storage directory {}", parent.display())
                    })?;
                }
                let store = SledStore::open(&storage.path, storage.ttl()).with_context(|| {
                    format!("Failed to open sled store at {}", storage.path.display())
                })?;
                Ok(Self::Sled(Arc::new(store)))
            }
        }
    }

    fn sink(&self) -> Arc<dyn StorageSink> {
        match self {
            Self::Memory(store) => store.clone(),
            Self::Sled(store) => store.clone(),
        }
    }

    fn prune(&self) -> Result<usize, StorageError> {
        match self {
            Self::Memory(store) => Ok(store.purge_expired()),
            Self::Sled(store) => store.prune_expired(),
        }
    }
}

// ============================================================================
// Task Spawners
// ============================================================================

/// Prune on the blocking pool; sled scans and removes synchronously.
async fn prune_storage(storage: &Storage) -> Result<usize> {
    let pruner = storage.clone();
    let removed = tokio::task::spawn_blocking(move || pruner.prune())
        .await
        .context("storage prune task panicked")??;
    Ok(removed)
}

/// Periodic storage pruning and cleanup of subscriber groups nobody joined.
fn spawn_housekeeping(
    task_set: &mut JoinSet<Result<TaskName>>,
    storage: Storage,
    registry: Arc<SubscriptionRegistry>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[Housekeeping] Task starting");
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    match prune_storage(&storage).await {
                        Ok(0) => {}
                        Ok(n) => info!(removed = n, "Pruned expired storage entries"),
                        Err(e) => warn!(error = %e, "Storage prune failed"),
                    }
                    let groups = registry.prune_empty();
                    if groups > 0 {
                        info!(groups, "Removed empty subscriber groups");
                    }
                }
            }
        }
        Ok(TaskName::Housekeeping)
    });
}

/// Bind the stream hub and spawn it into the JoinSet.
async fn spawn_stream_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    addr: &str,
    state: StreamHubState,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(addr = %addr, path = websocket::STREAM_PATH, "Stream hub listening");

    let app = websocket::router(state);
    task_set.spawn(async move {
        info!("[StreamServer] Task starting");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[StreamServer] Received shutdown signal");
            })
            .await
            .context("stream hub server error")?;
        info!("[StreamServer] Graceful shutdown complete");
        Ok(TaskName::StreamServer)
    });
    Ok(())
}

/// Monitor tasks until cancellation or the first failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: &CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                return Ok(());
            }
            result = task_set.join_next() => match result {
                Some(Ok(Ok(task_name))) => {
                    info!(task = %task_name, "Supervisor: task completed normally");
                }
                Some(Ok(Err(e))) => {
                    error!(error = %e, "Supervisor: task failed");
                    cancel_token.cancel();
                    return Err(e);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Supervisor: task panicked");
                    cancel_token.cancel();
                    return Err(anyhow::anyhow!("task panicked: {e}"));
                }
                None => {
                    info!("Supervisor: all tasks completed");
                    return Ok(());
                }
            }
        }
    }
}

/// Give cancelled tasks a bounded window to flush and report.
async fn drain_tasks(task_set: &mut JoinSet<Result<TaskName>>) {
    let grace = Duration::from_secs(defaults::SHUTDOWN_GRACE_SECS);
    let drained = tokio::time::timeout(grace, async {
        while let Some(result) = task_set.join_next().await {
            match result {
                Ok(Ok(task_name)) => info!(task = %task_name, "Task stopped"),
                Ok(Err(e)) => warn!(error = %e, "Task stopped with error"),
                Err(e) => warn!(error = %e, "Task aborted"),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = task_set.len(), "Shutdown grace period elapsed, aborting tasks");
        task_set.abort_all();
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.json_logs);

    let mut stream_config = match &args.config {
        Some(path) => StreamConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StreamConfig::load(),
    };
    args.apply(&mut stream_config);
    stream_config.validate().context("Invalid configuration")?;
    config::init(stream_config);
    let cfg = config::get();

    info!(
        queue_capacity = cfg.queue.capacity,
        max_batch_size = cfg.engine.max_batch_size,
        flush_interval_ms = cfg.broadcast.flush_interval_ms,
        storage = ?cfg.storage.backend,
        "Starting sensor-stream"
    );

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    let queue = Arc::new(IngestionQueue::new(cfg.queue.capacity));
    let storage = Storage::open(cfg)?;
    let (dispatcher, persistence_handle) = PersistenceDispatcher::spawn(
        storage.sink(),
        cfg.storage.dispatch_capacity,
        cancel_token.clone(),
    );
    let registry = Arc::new(SubscriptionRegistry::new(cfg.broadcast.group_capacity));
    let coalescer = Arc::new(BroadcastCoalescer::new(
        registry.clone(),
        cfg.broadcast.flush_interval(),
    ));
    let engine = AggregationEngine::new(coalescer.clone(), &cfg.engine.windows)
        .with_persistence(dispatcher.clone());

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task: Persistence Worker
    task_set.spawn(async move {
        persistence_handle
            .await
            .context("persistence worker panicked")?;
        Ok(TaskName::PersistenceWorker)
    });

    // Task: Aggregation Engine
    let processing_loop =
        ProcessingLoop::new(engine, Arc::clone(&queue), &cfg.engine, cancel_token.clone());
    task_set.spawn(async move {
        info!("[AggregationEngine] Task starting");
        processing_loop.run().await;
        Ok(TaskName::AggregationEngine)
    });

    // Task: Broadcast Coalescer
    let coalescer_task = Arc::clone(&coalescer);
    let coalescer_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[Coalescer] Task starting");
        coalescer_task.run(coalescer_cancel).await;
        Ok(TaskName::Coalescer)
    });

    // Task: Housekeeping
    spawn_housekeeping(
        &mut task_set,
        storage,
        Arc::clone(&registry),
        Duration::from_secs(cfg.storage.prune_interval_secs.max(1)),
        cancel_token.clone(),
    );

    // Task: Stream Server
    if cfg.server.enabled {
        let state = StreamHubState::new(
            Arc::clone(&registry),
            Arc::new(PassThroughAcknowledger),
            defaults::WS_OUTBOUND_BUFFER,
        );
        spawn_stream_server(&mut task_set, &cfg.server.addr, state, cancel_token.clone()).await?;
    } else {
        info!("Stream hub disabled");
    }

    // Task: Producer
    let producer_queue = Arc::clone(&queue);
    let producer_cancel = cancel_token.clone();
    if args.stdin {
        info!("Input: stdin (JSON readings)");
        task_set.spawn(async move {
            run_producer(StdinSource::new(), producer_queue, producer_cancel).await?;
            Ok(TaskName::Producer)
        });
    } else {
        info!(
            sensors = cfg.simulator.sensors,
            rate_hz = cfg.simulator.rate_hz,
            "Input: simulator"
        );
        let source = SimulatedSource::new(&cfg.simulator)?;
        task_set.spawn(async move {
            run_producer(source, producer_queue, producer_cancel).await?;
            Ok(TaskName::Producer)
        });
    }

    let outcome = run_supervisor(&mut task_set, &cancel_token).await;
    cancel_token.cancel();
    drain_tasks(&mut task_set).await;

    let queue_stats = queue.stats();
    let persistence = dispatcher.stats();
    let frames = coalescer.stats();
    info!(
        enqueued = queue_stats.enqueued,
        queue_dropped = queue_stats.dropped,
        frames_sent = frames.frames_sent,
        points_sent = frames.points_sent,
        send_errors = frames.send_errors,
        persisted = persistence.stored,
        persist_dropped = persistence.dropped,
        persist_failed = persistence.failed,
        "sensor-stream shutdown complete"
    );

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prune_storage_on_blocking_pool() {
        let sled = SledStore::temporary(Duration::from_secs(3600)).expect("temporary sled store");
        let storage = Storage::Sled(Arc::new(sled));
        let reading = sensor_stream::Reading::now("s1", 1.0).expect("valid");
        storage.sink().store_reading(&reading).await.expect("store");

        // Fresh records survive a prune pass
        assert_eq!(prune_storage(&storage).await.expect("prune"), 0);

        let memory = Storage::Memory(Arc::new(InMemoryStore::default()));
        assert_eq!(prune_storage(&memory).await.expect("prune"), 0);
    }

    #[test]
    fn test_cli_overrides_apply() {
        let args = CliArgs::parse_from(["sensor-stream", "--no-server", "--storage", "sled", "--rate", "5"]);
        let mut config = StreamConfig::default();
        args.apply(&mut config);
        assert!(!config.server.enabled);
        assert_eq!(config.storage.backend, StorageBackend::Sled);
        assert_eq!(config.simulator.rate_hz, 5);
    }
}
