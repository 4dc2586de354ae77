use std::{
    hash::{Hash, Hasher},
    ops::AddAssign,
    sync::Arc,
};

use futures::StreamExt;
use tokio::sync::mpsc;

use super::{IngestOutcome, IngestionAdapter};
use crate::{
    pipeline::{Envelope, PipelineError, Sink},
    sources::TransportMessage,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub persisted: u64,
    pub baselines: u64,
    pub dropped: u64,
}

impl IngestStats {
    fn count(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Persisted(_) => self.persisted += 1,
            IngestOutcome::Baseline { .. } => self.baselines += 1,
            IngestOutcome::Dropped(_) => self.dropped += 1,
        }
    }
}

impl AddAssign for IngestStats {
    fn add_assign(&mut self, rhs: Self) {
        self.persisted += rhs.persisted;
        self.baselines += rhs.baselines;
        self.dropped += rhs.dropped;
    }
}

pub fn shard_index(key: &str, workers: usize) -> usize {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

/// Fans messages out to a fixed set of workers keyed by location.
///
/// All messages for one location land on the same worker and are handled in
/// arrival order; different locations are processed in parallel.
pub struct ShardedIngestSink {
    adapter: Arc<IngestionAdapter>,
    workers: usize,
    queue_capacity: usize,
}

impl ShardedIngestSink {
    pub fn new(adapter: Arc<IngestionAdapter>, workers: usize, queue_capacity: usize) -> Self {
        Self {
            adapter,
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub async fn run_with_stats<S>(&self, mut input: S) -> Result<IngestStats, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<TransportMessage>, PipelineError>> + Send + Unpin,
    {
        let mut txs = Vec::with_capacity(self.workers);
        let mut joins = Vec::with_capacity(self.workers);

        for _ in 0..self.workers {
            let (tx, mut rx) = mpsc::channel::<Envelope<TransportMessage>>(self.queue_capacity);
            txs.push(tx);

            let adapter = self.adapter.clone();
            joins.push(tokio::spawn(async move {
                let mut stats = IngestStats::default();
                while let Some(env) = rx.recv().await {
                    let outcome = adapter.handle(env).await;
                    stats.count(&outcome);
                }
                stats
            }));
        }

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream source for ShardedIngestSink");
                    continue;
                }
            };

            // Unknown topics still need a worker to log and count the drop.
            let key = self
                .adapter
                .topics()
                .resolve(&env.payload.topic)
                .unwrap_or(&env.payload.topic)
                .to_string();
            let idx = shard_index(&key, self.workers);
            if txs[idx].send(env).await.is_err() {
                return Err(PipelineError::Sink("ingest worker channel closed".to_string()));
            }
        }

        drop(txs);

        let mut total = IngestStats::default();
        for j in joins {
            match j.await {
                Ok(stats) => total += stats,
                Err(e) => return Err(PipelineError::Sink(format!("ingest worker join error: {e}"))),
            }
        }

        tracing::info!(
            persisted = total.persisted,
            baselines = total.baselines,
            dropped = total.dropped,
            "ingestion stream finished"
        );
        Ok(total)
    }
}

#[async_trait::async_trait]
impl Sink<TransportMessage> for ShardedIngestSink {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<TransportMessage>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        self.run_with_stats(input).await.map(|_| ())
    }
}
