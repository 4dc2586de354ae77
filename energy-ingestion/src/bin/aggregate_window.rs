use std::{env, sync::Arc};

use anyhow::Result;
use energy_ingestion::{
    aggregate::{AggregationJob, Aggregator},
    anomaly::AnomalyHook,
    config::AppConfig,
    notify::Notifier,
    observability, storage,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Run a single aggregation tick, now or at the RFC 3339 time given as the
/// first argument, followed by the anomaly hook when configured.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let tick = match env::args().nth(1) {
        Some(raw) => OffsetDateTime::parse(&raw, &Rfc3339)
            .map_err(|e| anyhow::anyhow!("invalid tick '{raw}': {e}"))?,
        None => OffsetDateTime::now_utc(),
    };

    let cfg = AppConfig::load()?;
    let store = storage::connect(&cfg.storage).await?;

    let notifier = match &cfg.notifications {
        Some(n) => Some(Arc::new(Notifier::from_config(n, store.clone())?)),
        None => None,
    };
    let anomaly = match &cfg.anomaly {
        Some(a) => Some(AnomalyHook::from_config(a, cfg.locations(), store.clone(), notifier)?),
        None => None,
    };

    let job = AggregationJob {
        aggregator: Aggregator::from_config(&cfg.aggregation, store),
        anomaly,
    };
    job.run(tick).await;

    Ok(())
}
