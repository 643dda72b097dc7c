//! Chain indexer daemon
//!
//! Follows the chain head, backfills missing blocks, verifies stored blocks
//! against a trusted node and indexes contract events, until Ctrl+C.

use anyhow::{Context, Result};
use chainkeeper::cache::{Cache, MemoryCache, RocksCache};
use chainkeeper::chain::{ChainClient, RpcChainClient};
use chainkeeper::config::{load_validator_names, PipelineConfig};
use chainkeeper::events::EventProcessor;
use chainkeeper::tracker::{HandlerRegistry, TransferHandler};
use chainkeeper::{
    BackfillSettings, BackfillWorker, Importer, Listener, Metrics, RetryPolicy, RocksStore, Store,
    VerifierWorker,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Chain indexer daemon
#[derive(Parser)]
#[command(name = "keeper")]
#[command(about = "Index blocks, transactions and events of an EVM chain")]
struct Args {
    /// Load-balanced RPC endpoint URL, repeat for several
    #[arg(short, long = "rpc-url", default_value = "http://127.0.0.1:8545")]
    rpc_urls: Vec<String>,

    /// Trusted RPC endpoint used for verification (defaults to the first --rpc-url)
    #[arg(long)]
    canonical_url: Option<String>,

    /// Path to the RocksDB store directory
    #[arg(short, long, default_value = "./keeper_db")]
    db_path: PathBuf,

    /// Path to the RocksDB cache directory
    #[arg(short, long, default_value = "./keeper_cache")]
    cache_path: PathBuf,

    /// Keep queues and counters in memory instead of RocksDB
    #[arg(long)]
    memory_cache: bool,

    /// Path to a validator names file (one `address name` per line)
    #[arg(short, long)]
    validators: Option<PathBuf>,

    /// Listener poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    listen_interval_ms: u64,

    /// Backfill poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    backfill_interval_ms: u64,

    /// Verifier poll interval in milliseconds
    #[arg(long, default_value_t = 5000)]
    verify_interval_ms: u64,

    /// Ancestors checked behind every new head
    #[arg(long, default_value_t = 10)]
    ancestor_window: u64,

    /// Heights drained from a queue per tick
    #[arg(long, default_value_t = 10)]
    batch_size: usize,

    /// Consecutive failures before a height is skipped
    #[arg(long, default_value_t = 3)]
    skip_threshold: u32,

    /// Do not mirror imported head blocks into the cache
    #[arg(long)]
    no_mirror: bool,

    /// Seconds between metrics snapshots in the log
    #[arg(long, default_value_t = 60)]
    metrics_interval_secs: u64,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            listen_interval: Duration::from_millis(self.listen_interval_ms),
            backfill_interval: Duration::from_millis(self.backfill_interval_ms),
            verify_interval: Duration::from_millis(self.verify_interval_ms),
            ancestor_window: self.ancestor_window,
            batch_size: self.batch_size,
            skip_threshold: self.skip_threshold,
            mirror_blocks: !self.no_mirror,
            ..PipelineConfig::default()
        }
    }
}

async fn log_metrics(metrics: Arc<Metrics>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = tokio::time::sleep(interval) => {
                match serde_json::to_string(&metrics.snapshot()) {
                    Ok(snapshot) => info!(%snapshot, "Metrics"),
                    Err(e) => warn!("Failed to serialize metrics: {}", e),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.pipeline_config();

    info!("Starting chain indexer");
    info!("RPC URLs: {:?}", args.rpc_urls);
    info!("Database: {:?}", args.db_path);

    let canonical_url = match &args.canonical_url {
        Some(url) => url.clone(),
        None => args
            .rpc_urls
            .first()
            .cloned()
            .context("At least one --rpc-url is required")?,
    };
    let chain: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(
        args.rpc_urls.clone(),
        canonical_url,
        RetryPolicy::default(),
    )?);

    let store: Arc<dyn Store> = Arc::new(
        RocksStore::open(&args.db_path)
            .with_context(|| format!("Failed to open database at {:?}", args.db_path))?,
    );
    let cache: Arc<dyn Cache> = if args.memory_cache {
        Arc::new(MemoryCache::new())
    } else {
        Arc::new(
            RocksCache::open(&args.cache_path)
                .with_context(|| format!("Failed to open cache at {:?}", args.cache_path))?,
        )
    };

    if let Some(path) = &args.validators {
        let validators = load_validator_names(path)?;
        for validator in &validators {
            store.upsert_validator(validator)?;
        }
        info!(count = validators.len(), "Loaded validator names");
    }

    let metrics = Arc::new(Metrics::new());
    let importer = Arc::new(
        Importer::new(store.clone(), cache.clone(), chain.clone(), metrics.clone())
            .with_mirroring(config.mirror_blocks),
    );

    let listener = Listener::new(
        chain.clone(),
        store.clone(),
        cache.clone(),
        importer.clone(),
        metrics.clone(),
        config.listen_interval,
        config.ancestor_window,
        config.mirror_blocks,
    );
    let backfill = BackfillWorker::new(
        chain.clone(),
        store.clone(),
        cache.clone(),
        importer.clone(),
        metrics.clone(),
        BackfillSettings {
            interval: config.backfill_interval,
            batch_size: config.batch_size,
            skip_threshold: config.skip_threshold,
            max_backoff: config.max_backoff,
        },
    );
    let verifier = VerifierWorker::new(
        chain.clone(),
        store.clone(),
        cache.clone(),
        importer,
        metrics.clone(),
        config.verify_interval,
        config.batch_size,
    );

    let mut registry = HandlerRegistry::new();
    registry.register(Box::new(TransferHandler::new()));
    let events = EventProcessor::new(chain, store, cache, registry, metrics.clone());

    let cancel = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(listener.run(cancel.clone())),
        tokio::spawn(backfill.run(cancel.clone())),
        tokio::spawn(verifier.run(cancel.clone())),
        tokio::spawn(events.run(cancel.clone())),
        tokio::spawn(log_metrics(
            metrics.clone(),
            Duration::from_secs(args.metrics_interval_secs.max(1)),
            cancel.clone(),
        )),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down gracefully...");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Worker task panicked: {}", e);
        }
    }

    info!(snapshot = ?metrics.snapshot(), "Indexer stopped");
    Ok(())
}
