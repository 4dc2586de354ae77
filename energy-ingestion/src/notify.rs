//! Push notifications to registered app tokens.
//!
//! Delivery itself is delegated to a relay behind [`NotificationSink`]; this
//! module picks recipients and shapes the message.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::{
    config::NotificationConfig,
    storage::{EnergyStore, StorageError},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

impl PushMessage {
    pub fn anomaly(data: BTreeMap<String, String>) -> Self {
        Self {
            title: "Anomaly Notification".to_string(),
            body: "Anomaly on energy usage".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub success_count: u64,
    pub failure_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    NoRecipients,
    Sent(DeliveryReport),
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to load recipient tokens: {0}")]
    Storage(#[from] StorageError),
    #[error("push relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push relay rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, tokens: &[String], message: &PushMessage) -> Result<DeliveryReport, NotifyError>;
}

#[derive(Serialize)]
struct RelayNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    tokens: &'a [String],
    notification: RelayNotification<'a>,
    data: &'a BTreeMap<String, String>,
}

/// Multicast through an HTTP push relay.
pub struct HttpPushSink {
    http: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpPushSink {
    pub fn from_config(cfg: &NotificationConfig) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            bearer_token: cfg.bearer_token.clone(),
        })
    }
}

#[async_trait::async_trait]
impl NotificationSink for HttpPushSink {
    async fn send(&self, tokens: &[String], message: &PushMessage) -> Result<DeliveryReport, NotifyError> {
        let body = RelayRequest {
            tokens,
            notification: RelayNotification {
                title: &message.title,
                body: &message.body,
            },
            data: &message.data,
        };

        let mut req = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await?;
        Ok(parse_delivery_report(&text, tokens.len()))
    }
}

/// Relays that answer without both counters count every recipient as
/// delivered.
fn parse_delivery_report(body: &str, recipients: usize) -> DeliveryReport {
    serde_json::from_str(body).unwrap_or(DeliveryReport {
        success_count: recipients as u64,
        failure_count: 0,
    })
}

/// Earliest registration day still considered valid.
pub fn token_cutoff(today: Date, max_age_days: i64) -> Date {
    today
        .checked_sub(time::Duration::days(max_age_days.max(0)))
        .unwrap_or(Date::MIN)
}

pub struct Notifier {
    store: Arc<dyn EnergyStore>,
    sink: Arc<dyn NotificationSink>,
    max_token_age_days: i64,
}

impl Notifier {
    pub fn new(store: Arc<dyn EnergyStore>, sink: Arc<dyn NotificationSink>, max_token_age_days: i64) -> Self {
        Self {
            store,
            sink,
            max_token_age_days,
        }
    }

    pub fn from_config(cfg: &NotificationConfig, store: Arc<dyn EnergyStore>) -> Result<Self, NotifyError> {
        let sink = HttpPushSink::from_config(cfg)?;
        Ok(Self::new(store, Arc::new(sink), cfg.token_max_age_days))
    }

    pub async fn notify(&self, message: &PushMessage, today: Date) -> Result<NotifyOutcome, NotifyError> {
        let cutoff = token_cutoff(today, self.max_token_age_days);
        let tokens: Vec<String> = match self.store.tokens_since(cutoff).await {
            Ok(rows) => rows.into_iter().map(|t| t.token).collect(),
            Err(e) => {
                metrics::counter!("notification_errors_total").increment(1);
                tracing::error!(error = %e, title = %message.title, "failed to load notification tokens");
                return Err(NotifyError::Storage(e));
            }
        };

        if tokens.is_empty() {
            tracing::info!("no valid tokens found; notification skipped");
            return Ok(NotifyOutcome::NoRecipients);
        }

        match self.sink.send(&tokens, message).await {
            Ok(report) => {
                metrics::counter!("notifications_sent_total").increment(report.success_count);
                tracing::info!(
                    success = report.success_count,
                    failure = report.failure_count,
                    title = %message.title,
                    "notification sent"
                );
                Ok(NotifyOutcome::Sent(report))
            }
            Err(e) => {
                metrics::counter!("notification_errors_total").increment(1);
                tracing::error!(error = %e, "failed to send notification");
                Err(e)
            }
        }
    }

    pub async fn notify_now(&self, message: &PushMessage) -> Result<NotifyOutcome, NotifyError> {
        self.notify(message, OffsetDateTime::now_utc().date()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Mutex;
    use time::macros::date;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<(Vec<String>, PushMessage)>>,
    }

    #[async_trait::async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, tokens: &[String], message: &PushMessage) -> Result<DeliveryReport, NotifyError> {
            self.sent.lock().unwrap().push((tokens.to_vec(), message.clone()));
            Ok(DeliveryReport {
                success_count: tokens.len() as u64,
                failure_count: 0,
            })
        }
    }

    #[test]
    fn cutoff_is_max_age_days_back() {
        assert_eq!(token_cutoff(date!(2024-10-01), 270), date!(2024-01-05));
        assert_eq!(token_cutoff(date!(2024-10-01), 0), date!(2024-10-01));
    }

    #[test]
    fn anomaly_message_has_fixed_title_and_body() {
        let mut data = BTreeMap::new();
        data.insert("location".to_string(), "Lift_OPMC".to_string());
        let msg = PushMessage::anomaly(data);
        assert_eq!(msg.title, "Anomaly Notification");
        assert_eq!(msg.body, "Anomaly on energy usage");
        assert_eq!(msg.data["location"], "Lift_OPMC");
    }

    #[test]
    fn delivery_report_reads_relay_counters() {
        let r = parse_delivery_report(r#"{"successCount":2,"failureCount":1,"responses":[]}"#, 3);
        assert_eq!(r, DeliveryReport { success_count: 2, failure_count: 1 });
    }

    #[test]
    fn relay_body_without_counters_counts_all_recipients() {
        let full = DeliveryReport { success_count: 3, failure_count: 0 };
        assert_eq!(parse_delivery_report(r#"{"ok":true}"#, 3), full);
        assert_eq!(parse_delivery_report(r#"{"successCount":1}"#, 3), full);
        assert_eq!(parse_delivery_report("accepted", 3), full);
    }

    /// Every query fails, as with a lost database connection.
    struct UnreachableStore;

    fn down() -> StorageError {
        StorageError::Backend(anyhow::anyhow!("connection refused"))
    }

    #[async_trait::async_trait]
    impl EnergyStore for UnreachableStore {
        async fn save_sensor_record(&self, _: &energy_client::domain::SensorRecord) -> Result<(), StorageError> {
            Err(down())
        }
        async fn readings_between(
            &self,
            _: OffsetDateTime,
            _: OffsetDateTime,
        ) -> Result<Vec<energy_client::domain::SensorRecord>, StorageError> {
            Err(down())
        }
        async fn insert_hourly_usage(&self, _: &[energy_client::domain::HourlyUsage]) -> Result<u64, StorageError> {
            Err(down())
        }
        async fn recent_active_import(&self, _: &str, _: usize) -> Result<Vec<f64>, StorageError> {
            Err(down())
        }
        async fn historical_readings(
            &self,
            _: &str,
            _: Option<OffsetDateTime>,
            _: Option<OffsetDateTime>,
        ) -> Result<Vec<energy_client::domain::StoredSensorRecord>, StorageError> {
            Err(down())
        }
        async fn last_two_readings(&self, _: &str) -> Result<Vec<energy_client::domain::StoredSensorRecord>, StorageError> {
            Err(down())
        }
        async fn anomalies(&self) -> Result<Vec<energy_client::domain::AnomalySummary>, StorageError> {
            Err(down())
        }
        async fn anomaly_detail(&self, _: i64) -> Result<Option<energy_client::domain::AnomalyDetail>, StorageError> {
            Err(down())
        }
        async fn save_token(&self, _: &str, _: Date) -> Result<(), StorageError> {
            Err(down())
        }
        async fn tokens_since(&self, _: Date) -> Result<Vec<energy_client::domain::UserToken>, StorageError> {
            Err(down())
        }
    }

    #[tokio::test]
    async fn token_lookup_failure_is_reported_and_nothing_is_sent() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(Arc::new(UnreachableStore), sink.clone(), 270);

        let err = notifier
            .notify(&PushMessage::anomaly(BTreeMap::new()), date!(2024-10-01))
            .await
            .unwrap_err();

        assert!(matches!(err, NotifyError::Storage(_)));
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_valid_tokens_means_no_send() {
        let store = Arc::new(MemoryStore::new());
        store.save_token("stale", date!(2023-01-01)).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(store, sink.clone(), 270);

        let out = notifier
            .notify(&PushMessage::anomaly(BTreeMap::new()), date!(2024-10-01))
            .await
            .unwrap();

        assert_eq!(out, NotifyOutcome::NoRecipients);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sends_to_fresh_tokens_only() {
        let store = Arc::new(MemoryStore::new());
        store.save_token("stale", date!(2023-01-01)).await.unwrap();
        store.save_token("fresh", date!(2024-09-01)).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(store, sink.clone(), 270);

        let out = notifier
            .notify(&PushMessage::anomaly(BTreeMap::new()), date!(2024-10-01))
            .await
            .unwrap();

        assert_eq!(out, NotifyOutcome::Sent(DeliveryReport { success_count: 1, failure_count: 0 }));
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].0, vec!["fresh".to_string()]);
    }
}
