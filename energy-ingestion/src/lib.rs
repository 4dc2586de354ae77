pub mod aggregate;
pub mod anomaly;
pub mod api;
pub mod config;
pub mod differential;
pub mod ingest;
pub mod metrics_server;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod sources;
pub mod storage;
pub mod transform;

pub use differential::{CounterStore, DeltaOutcome, Differencer};
pub use pipeline::{Envelope, Pipeline};
