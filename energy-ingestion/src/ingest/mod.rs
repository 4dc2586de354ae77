//! Glue between the transport and the differencer.
//!
//! Nothing here propagates an error to the transport: every message ends in
//! an [`IngestOutcome`] that is logged and counted, and callers can assert on
//! it in tests.

mod workers;

pub use workers::{shard_index, IngestStats, ShardedIngestSink};

use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

use energy_client::domain::SensorRecord;

use crate::{
    differential::{CoreError, DeltaOutcome, Differencer},
    pipeline::Envelope,
    sources::TransportMessage,
    storage::{EnergyStore, StorageError},
    transform::{decode_payload, DecodeError},
};

/// Static transport topic -> location mapping.
#[derive(Debug, Clone, Default)]
pub struct TopicMap {
    topics: BTreeMap<String, String>,
}

impl TopicMap {
    pub fn new(topics: BTreeMap<String, String>) -> Self {
        Self { topics }
    }

    pub fn resolve(&self, topic: &str) -> Option<&str> {
        self.topics.get(topic).map(String::as_str)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TopicMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("no location mapped for topic '{0}'")]
    UnknownTopic(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Config(#[from] CoreError),
    #[error("failed to persist differential record: {0}")]
    Persist(#[source] StorageError),
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// A differential record was computed and written.
    Persisted(SensorRecord),
    /// First reading for the location; stored as baseline only.
    Baseline { location: String },
    Dropped(IngestError),
}

pub struct IngestionAdapter {
    topics: TopicMap,
    differencer: Arc<Differencer>,
    store: Arc<dyn EnergyStore>,
}

impl IngestionAdapter {
    pub fn new(topics: TopicMap, differencer: Arc<Differencer>, store: Arc<dyn EnergyStore>) -> Self {
        Self {
            topics,
            differencer,
            store,
        }
    }

    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    pub fn differencer(&self) -> &Differencer {
        &self.differencer
    }

    pub async fn handle(&self, env: Envelope<TransportMessage>) -> IngestOutcome {
        let received_at = env.received_at;
        let outcome = self.process(env.payload).await;
        record_outcome(&outcome, received_at);
        outcome
    }

    async fn process(&self, msg: TransportMessage) -> IngestOutcome {
        let Some(location) = self.topics.resolve(&msg.topic) else {
            return IngestOutcome::Dropped(IngestError::UnknownTopic(msg.topic));
        };

        let reading = match decode_payload(&msg.payload) {
            Ok(r) => r,
            Err(e) => return IngestOutcome::Dropped(e.into()),
        };

        // The baseline lock is released before the write below.
        let record = match self.differencer.compute_delta(location, reading) {
            Ok(DeltaOutcome::Delta(record)) => record.into_sensor_record(location),
            Ok(DeltaOutcome::NoPreviousReading) => {
                return IngestOutcome::Baseline {
                    location: location.to_string(),
                }
            }
            Err(e) => return IngestOutcome::Dropped(e.into()),
        };

        match self.store.save_sensor_record(&record).await {
            Ok(()) => IngestOutcome::Persisted(record),
            Err(e) => IngestOutcome::Dropped(IngestError::Persist(e)),
        }
    }
}

fn record_outcome(outcome: &IngestOutcome, received_at: SystemTime) {
    match outcome {
        IngestOutcome::Persisted(record) => {
            metrics::counter!("ingest_persisted_total").increment(1);
            if record.usage.values().iter().any(|v| *v < 0.0) {
                metrics::counter!("differential_negative_delta_total").increment(1);
                tracing::warn!(
                    location = %record.location,
                    reading_time = %record.reading_time,
                    "negative differential persisted (meter reset or out-of-order delivery)"
                );
            }
            if let Ok(dur) = SystemTime::now().duration_since(received_at) {
                metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
            }
            tracing::info!(location = %record.location, "differential data saved");
        }
        IngestOutcome::Baseline { location } => {
            metrics::counter!("ingest_baseline_total").increment(1);
            tracing::info!(location = %location, "first reading stored as baseline");
        }
        IngestOutcome::Dropped(IngestError::Persist(e)) => {
            metrics::counter!("ingest_persist_errors_total").increment(1);
            tracing::error!(error = %e, "error saving differential data; interval lost");
        }
        IngestOutcome::Dropped(e) => {
            metrics::counter!("ingest_decode_errors_total").increment(1);
            tracing::warn!(error = %e, "error processing message; dropped");
        }
    }
}
