use std::{env, sync::Arc};

use anyhow::{bail, Result};
use energy_ingestion::{
    config::AppConfig,
    differential::{CounterStore, Differencer},
    ingest::{IngestionAdapter, ShardedIngestSink, TopicMap},
    observability,
    pipeline::Source,
    sources::ReplayFileSource,
    storage,
};

/// Feed recorded `{topic, payload}` NDJSON lines through the same ingestion
/// path the MQTT listener uses. The counter store starts empty, so the first
/// message per location only sets a baseline.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: replay_messages <ndjson_file_path>");
    }
    let file_path = &args[1];

    // ENERGY_CONFIG can point at a replay-specific file.
    let cfg = AppConfig::load()?;
    let store = storage::connect(&cfg.storage).await?;

    let adapter = Arc::new(IngestionAdapter::new(
        TopicMap::new(cfg.mqtt.topics.clone()),
        Arc::new(Differencer::new(CounterStore::new(cfg.locations()))),
        store,
    ));

    let source = ReplayFileSource::new(file_path);
    let sink = ShardedIngestSink::new(adapter, cfg.ingest.workers, cfg.ingest.queue_capacity);
    let stats = sink.run_with_stats(source.stream().await).await?;

    tracing::info!(
        file = %file_path,
        persisted = stats.persisted,
        baselines = stats.baselines,
        dropped = stats.dropped,
        "replay finished"
    );
    Ok(())
}
