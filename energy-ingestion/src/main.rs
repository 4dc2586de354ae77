use std::sync::Arc;

use anyhow::Result;
use energy_ingestion::{
    aggregate::{AggregationJob, Aggregator},
    anomaly::AnomalyHook,
    api::{self, ApiState},
    config::AppConfig,
    differential::{CounterStore, Differencer},
    ingest::{IngestionAdapter, ShardedIngestSink, TopicMap},
    metrics_server,
    notify::Notifier,
    observability,
    pipeline::Pipeline,
    scheduler::{self, Schedule},
    sources::{MqttSource, TransportMessage},
    storage,
};
use time::UtcOffset;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store = storage::connect(&cfg.storage).await?;

    let differencer = Arc::new(Differencer::new(CounterStore::new(cfg.locations())));
    tracing::info!(locations = differencer.store().len(), "counter store initialized");

    let adapter = Arc::new(IngestionAdapter::new(
        TopicMap::new(cfg.mqtt.topics.clone()),
        differencer,
        store.clone(),
    ));

    let notifier = match &cfg.notifications {
        Some(n) => Some(Arc::new(Notifier::from_config(n, store.clone())?)),
        None => None,
    };

    let anomaly = match &cfg.anomaly {
        Some(a) => Some(AnomalyHook::from_config(a, cfg.locations(), store.clone(), notifier.clone())?),
        None => None,
    };

    let shutdown = CancellationToken::new();

    let pipeline = Pipeline {
        source: MqttSource::connect(&cfg.mqtt, shutdown.clone()),
        sink: ShardedIngestSink::new(adapter, cfg.ingest.workers, cfg.ingest.queue_capacity),
    };

    let job = AggregationJob {
        aggregator: Aggregator::from_config(&cfg.aggregation, store.clone()),
        anomaly,
    };
    let schedule = Schedule::from_config(&cfg.aggregation);

    let api_state = ApiState {
        store,
        notifier,
        display_offset: UtcOffset::from_whole_seconds(cfg.api.display_utc_offset_secs)?,
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
            }
            shutdown.cancel();
        });
    }

    let ingest = async { pipeline.run::<TransportMessage>().await.map_err(anyhow::Error::from) };
    let aggregation = async {
        scheduler::run(schedule, shutdown.clone(), |tick| job.run(tick)).await;
        Ok::<_, anyhow::Error>(())
    };
    let serve_api = api::serve(&cfg.api.bind_addr, api_state, shutdown.clone());

    tokio::try_join!(ingest, aggregation, serve_api)?;

    tracing::info!("service stopped");
    Ok(())
}
