use std::{pin::Pin, time::SystemTime};

use futures::Stream;

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

pub struct Pipeline<S, K> {
    pub source: S,
    pub sink: K,
}

impl<S, K> Pipeline<S, K> {
    pub async fn run<T>(self) -> Result<(), PipelineError>
    where
        T: Send + 'static,
        S: Source<T> + Send + Sync + 'static,
        K: Sink<T> + Send + Sync + 'static,
    {
        let stream = self.source.stream().await;
        self.sink.run(stream).await
    }
}
