//! Hooks into an external anomaly-prediction service.
//!
//! After each aggregation tick the latest hourly active-import averages of
//! every location are posted to that location's model endpoint. The model is
//! opaque; a response of `{"anomaly": true, ...}` marks an anomaly.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::future::join_all;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    config::AnomalyConfig,
    notify::{Notifier, PushMessage},
    storage::{EnergyStore, StorageError},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub body: serde_json::Value,
}

impl Prediction {
    pub fn is_anomaly(&self) -> bool {
        matches!(self.body.get("anomaly"), Some(serde_json::Value::Bool(true)))
    }

    pub fn anomaly_type(&self) -> Option<&str> {
        self.body.get("anomaly_type").and_then(|v| v.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("no prediction endpoint for location '{0}'")]
    NoEndpoint(String),
    #[error("no hourly usage recorded yet for location '{0}'")]
    NoHistory(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("prediction request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("prediction service returned status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait::async_trait]
pub trait PredictionClient: Send + Sync {
    /// Whether a model is configured for `location`.
    fn serves(&self, _location: &str) -> bool {
        true
    }

    async fn predict(&self, location: &str, features: &[f64]) -> Result<Prediction, PredictionError>;
}

#[derive(serde::Serialize)]
struct PredictionRequest<'a> {
    features: &'a [f64],
}

pub struct HttpPredictionClient {
    http: reqwest::Client,
    endpoints: BTreeMap<String, String>,
}

impl HttpPredictionClient {
    pub fn from_config(cfg: &AnomalyConfig) -> Result<Self, PredictionError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            endpoints: cfg.endpoints.clone(),
        })
    }
}

#[async_trait::async_trait]
impl PredictionClient for HttpPredictionClient {
    fn serves(&self, location: &str) -> bool {
        self.endpoints.contains_key(location)
    }

    async fn predict(&self, location: &str, features: &[f64]) -> Result<Prediction, PredictionError> {
        let url = self
            .endpoints
            .get(location)
            .ok_or_else(|| PredictionError::NoEndpoint(location.to_string()))?;

        let resp = self
            .http
            .post(url)
            .json(&PredictionRequest { features })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PredictionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Prediction {
            body: resp.json().await?,
        })
    }
}

#[derive(Debug)]
pub struct PredictionOutcome {
    pub location: String,
    pub result: Result<Prediction, PredictionError>,
}

pub struct AnomalyHook {
    store: Arc<dyn EnergyStore>,
    client: Arc<dyn PredictionClient>,
    locations: Vec<String>,
    features_len: usize,
    notifier: Option<Arc<Notifier>>,
}

impl AnomalyHook {
    pub fn new(
        store: Arc<dyn EnergyStore>,
        client: Arc<dyn PredictionClient>,
        locations: Vec<String>,
        features_len: usize,
    ) -> Self {
        Self {
            store,
            client,
            locations,
            features_len,
            notifier: None,
        }
    }

    /// Predicts for every tracked location; a location without an endpoint
    /// yields [`PredictionError::NoEndpoint`] on each tick. The notifier is
    /// only attached when `notify_on_anomaly` is set.
    pub fn from_config<I>(
        cfg: &AnomalyConfig,
        locations: I,
        store: Arc<dyn EnergyStore>,
        notifier: Option<Arc<Notifier>>,
    ) -> Result<Self, PredictionError>
    where
        I: IntoIterator<Item = String>,
    {
        let client = HttpPredictionClient::from_config(cfg)?;
        let hook = Self::new(
            store,
            Arc::new(client),
            locations.into_iter().collect(),
            cfg.features_len,
        );
        Ok(match notifier {
            Some(n) if cfg.notify_on_anomaly => hook.with_notifier(n),
            _ => hook,
        })
    }

    /// Push a notification whenever a prediction reports an anomaly.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Predict every location concurrently. One location failing never
    /// affects the others.
    pub async fn run(&self, tick: OffsetDateTime) -> Vec<PredictionOutcome> {
        let outcomes = join_all(self.locations.iter().map(|l| self.predict_location(l))).await;

        for outcome in &outcomes {
            match &outcome.result {
                Ok(prediction) => {
                    tracing::info!(location = %outcome.location, prediction = %prediction.body, "prediction received");
                    if prediction.is_anomaly() {
                        metrics::counter!("anomalies_detected_total").increment(1);
                        self.notify(&outcome.location, tick, prediction).await;
                    }
                }
                Err(e) => {
                    metrics::counter!("prediction_errors_total").increment(1);
                    tracing::error!(location = %outcome.location, error = %e, "anomaly prediction failed");
                }
            }
        }

        outcomes
    }

    async fn predict_location(&self, location: &str) -> PredictionOutcome {
        let result = async {
            if !self.client.serves(location) {
                return Err(PredictionError::NoEndpoint(location.to_string()));
            }
            let features = self.store.recent_active_import(location, self.features_len).await?;
            if features.is_empty() {
                return Err(PredictionError::NoHistory(location.to_string()));
            }
            self.client.predict(location, &features).await
        }
        .await;

        PredictionOutcome {
            location: location.to_string(),
            result,
        }
    }

    async fn notify(&self, location: &str, tick: OffsetDateTime, prediction: &Prediction) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let mut data = BTreeMap::new();
        data.insert("location".to_string(), location.to_string());
        data.insert(
            "timestamp".to_string(),
            tick.format(&Rfc3339).unwrap_or_else(|_| tick.to_string()),
        );
        data.insert(
            "anomaly".to_string(),
            prediction.anomaly_type().unwrap_or("energy usage").to_string(),
        );

        if let Err(e) = notifier.notify(&PushMessage::anomaly(data), tick.date()).await {
            tracing::warn!(location = %location, error = %e, "anomaly notification not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{notify::tests::RecordingSink, storage::MemoryStore};
    use energy_client::domain::{EnergyCounters, HourlyUsage};
    use std::sync::Mutex;
    use time::macros::{date, datetime};

    /// Flags an anomaly for "Chiller" and fails for "Broken".
    #[derive(Default)]
    struct ScriptedClient {
        seen: Mutex<Vec<(String, Vec<f64>)>>,
    }

    #[async_trait::async_trait]
    impl PredictionClient for ScriptedClient {
        async fn predict(&self, location: &str, features: &[f64]) -> Result<Prediction, PredictionError> {
            self.seen.lock().unwrap().push((location.to_string(), features.to_vec()));
            match location {
                "Broken" => Err(PredictionError::NoEndpoint(location.to_string())),
                "Chiller" => Ok(Prediction {
                    body: serde_json::json!({ "anomaly": true, "anomaly_type": "spike" }),
                }),
                _ => Ok(Prediction {
                    body: serde_json::json!({ "anomaly": false }),
                }),
            }
        }
    }

    async fn seed(store: &MemoryStore, location: &str, hours: i64) {
        let rows: Vec<HourlyUsage> = (0..hours)
            .map(|h| HourlyUsage {
                reading_time: datetime!(2024-01-01 00:05:00 UTC) + time::Duration::hours(h),
                location: location.to_string(),
                meter_type: "PM2120".to_string(),
                meter_serial_number: "SN-1".to_string(),
                usage: EnergyCounters {
                    active_energy_import: h as f64,
                    ..Default::default()
                },
            })
            .collect();
        store.insert_hourly_usage(&rows).await.unwrap();
    }

    #[test]
    fn anomaly_flag_must_be_boolean_true() {
        let p = |v| Prediction { body: v };
        assert!(p(serde_json::json!({ "anomaly": true })).is_anomaly());
        assert!(!p(serde_json::json!({ "anomaly": "true" })).is_anomaly());
        assert!(!p(serde_json::json!({ "score": 0.9 })).is_anomaly());
    }

    #[tokio::test]
    async fn sends_latest_window_and_isolates_failures() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "Lift", 30).await;
        seed(&store, "Broken", 2).await;
        let client = Arc::new(ScriptedClient::default());

        let hook = AnomalyHook::new(
            store.clone(),
            client.clone(),
            vec!["Lift".into(), "Broken".into(), "Empty".into()],
            24,
        );
        let outcomes = hook.run(datetime!(2024-01-02 07:05:00 UTC)).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(PredictionError::NoEndpoint(_))));
        assert!(matches!(outcomes[2].result, Err(PredictionError::NoHistory(_))));

        let seen = client.seen.lock().unwrap();
        let lift = seen.iter().find(|(l, _)| l == "Lift").unwrap();
        assert_eq!(lift.1.len(), 24);
        assert_eq!(lift.1.first(), Some(&6.0));
        assert_eq!(lift.1.last(), Some(&29.0));
    }

    #[tokio::test]
    async fn configured_location_without_endpoint_reports_no_endpoint() {
        let cfg = AnomalyConfig {
            endpoints: [("Lift_OPMC".to_string(), "http://127.0.0.1:9/predict".to_string())].into(),
            timeout_ms: 100,
            features_len: 24,
            notify_on_anomaly: false,
        };
        let hook = AnomalyHook::from_config(
            &cfg,
            ["AHU_Lantai_2".to_string(), "Lift_OPMC".to_string()],
            Arc::new(MemoryStore::new()),
            None,
        )
        .unwrap();

        let outcomes = hook.run(datetime!(2024-01-01 03:05:00 UTC)).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].location, "AHU_Lantai_2");
        assert!(matches!(&outcomes[0].result, Err(PredictionError::NoEndpoint(l)) if l == "AHU_Lantai_2"));
        assert_eq!(outcomes[1].location, "Lift_OPMC");
        assert!(matches!(outcomes[1].result, Err(PredictionError::NoHistory(_))));
    }

    #[tokio::test]
    async fn anomaly_triggers_notification() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "Chiller", 3).await;
        seed(&store, "Lift", 3).await;
        store.save_token("device-1", date!(2024-01-01)).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(Notifier::new(store.clone(), sink.clone(), 270));

        let hook = AnomalyHook::new(
            store,
            Arc::new(ScriptedClient::default()),
            vec!["Chiller".into(), "Lift".into()],
            24,
        )
        .with_notifier(notifier);
        hook.run(datetime!(2024-01-01 03:05:00 UTC)).await;

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (tokens, msg) = &sent[0];
        assert_eq!(tokens, &vec!["device-1".to_string()]);
        assert_eq!(msg.data["location"], "Chiller");
        assert_eq!(msg.data["anomaly"], "spike");
        assert_eq!(msg.data["timestamp"], "2024-01-01T03:05:00Z");
    }
}
