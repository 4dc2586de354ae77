use std::path::PathBuf;

use async_stream::try_stream;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use super::TransportMessage;
use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// Replays transport messages recorded as NDJSON.
///
/// Each line is `{"topic": "...", "payload": ...}`. A string payload is sent
/// verbatim; any other JSON value is re-serialized, so both
/// `{"payload": "{\"data\": ...}"}` and `{"payload": {"data": ...}}` work.
pub struct ReplayFileSource {
    path: PathBuf,
}

#[derive(serde::Deserialize)]
struct RecordedMessage {
    topic: String,
    payload: serde_json::Value,
}

impl From<RecordedMessage> for TransportMessage {
    fn from(r: RecordedMessage) -> Self {
        let payload = match r.payload {
            serde_json::Value::String(s) => s.into_bytes(),
            other => other.to_string().into_bytes(),
        };
        TransportMessage {
            topic: r.topic,
            payload,
        }
    }
}

impl ReplayFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Source<TransportMessage> for ReplayFileSource {
    async fn stream(&self) -> EnvelopeStream<TransportMessage> {
        let path = self.path.clone();
        let s = try_stream! {
            let file = File::open(&path).await.map_err(|e| {
                PipelineError::Source(format!("failed to open replay file: {e}"))
            })?;
            let reader = BufReader::new(file);
            let mut lines = reader.lines();

            while let Some(line) = lines.next_line().await.map_err(|e| {
                PipelineError::Source(format!("failed to read replay line: {e}"))
            })? {
                if line.trim().is_empty() {
                    continue;
                }
                let recorded: RecordedMessage = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        metrics::counter!("replay_parse_errors_total").increment(1);
                        tracing::warn!(error = %e, "skipping unparseable replay line");
                        continue;
                    }
                };
                yield Envelope::now(TransportMessage::from(recorded));
            }
        };

        Box::pin(s)
    }
}
