use std::sync::{Arc, Mutex};

use energy_ingestion::{
    aggregate::{AggregationJob, Aggregator},
    anomaly::{AnomalyHook, Prediction, PredictionClient, PredictionError},
    differential::{CounterStore, Differencer},
    ingest::{IngestionAdapter, TopicMap},
    notify::{DeliveryReport, NotificationSink, Notifier, NotifyError, PushMessage},
    pipeline::Envelope,
    sources::TransportMessage,
    storage::{EnergyStore, MemoryStore},
};
use time::{macros::datetime, Duration};

fn message(topic: &str, ts: &str, import: f64) -> Envelope<TransportMessage> {
    let reading = serde_json::json!({
        "reading_time": ts,
        "meter_type": "PM2120",
        "meter_serial_number": "SN-0001",
        "active_energy_import": import,
        "active_energy_export": 0.0,
        "reactive_energy_import": 0.0,
        "reactive_energy_export": 0.0,
        "apparent_energy_import": 0.0,
        "apparent_energy_export": 0.0
    });
    let payload = serde_json::json!({ "data": reading.to_string() });
    Envelope::now(TransportMessage::new(topic, payload.to_string()))
}

/// Reports an anomaly whenever the latest feature exceeds 5.
#[derive(Default)]
struct ThresholdModel {
    calls: Mutex<Vec<(String, Vec<f64>)>>,
}

#[async_trait::async_trait]
impl PredictionClient for ThresholdModel {
    async fn predict(&self, location: &str, features: &[f64]) -> Result<Prediction, PredictionError> {
        self.calls.lock().unwrap().push((location.to_string(), features.to_vec()));
        let latest = features.last().copied().unwrap_or_default();
        Ok(Prediction {
            body: serde_json::json!({ "anomaly": latest > 5.0, "anomaly_type": "high usage" }),
        })
    }
}

#[derive(Default)]
struct CapturingSink {
    sent: Mutex<Vec<PushMessage>>,
}

#[async_trait::async_trait]
impl NotificationSink for CapturingSink {
    async fn send(&self, tokens: &[String], message: &PushMessage) -> Result<DeliveryReport, NotifyError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(DeliveryReport {
            success_count: tokens.len() as u64,
            failure_count: 0,
        })
    }
}

#[tokio::test]
async fn ingested_deltas_are_averaged_predicted_and_notified() {
    let store = Arc::new(MemoryStore::new());
    let topics: TopicMap = [("energy/lift", "Lift_OPMC"), ("energy/chiller", "Chiller")]
        .into_iter()
        .collect();
    let adapter = IngestionAdapter::new(
        topics,
        Arc::new(Differencer::new(CounterStore::new(["Lift_OPMC", "Chiller"]))),
        store.clone(),
    );

    // Lift uses 1, 2, 3 per interval; Chiller uses 10 per interval.
    let lift = [100.0, 101.0, 103.0, 106.0];
    let chiller = [0.0, 10.0, 20.0];
    for (i, v) in lift.iter().enumerate() {
        adapter
            .handle(message("energy/lift", &format!("2024-11-28 09:{:02}:00", i * 10), *v))
            .await;
    }
    for (i, v) in chiller.iter().enumerate() {
        adapter
            .handle(message("energy/chiller", &format!("2024-11-28 09:{:02}:00", i * 15), *v))
            .await;
    }
    assert_eq!(store.sensor_rows().len(), 5);

    store
        .save_token("device-1", datetime!(2024-11-28 00:00:00 UTC).date())
        .await
        .unwrap();
    let sink = Arc::new(CapturingSink::default());
    let notifier = Arc::new(Notifier::new(store.clone(), sink.clone(), 270));
    let model = Arc::new(ThresholdModel::default());

    let job = AggregationJob {
        aggregator: Aggregator::new(store.clone(), Duration::hours(1), Duration::ZERO),
        anomaly: Some(
            AnomalyHook::new(
                store.clone(),
                model.clone(),
                vec!["Lift_OPMC".to_string(), "Chiller".to_string()],
                24,
            )
            .with_notifier(notifier),
        ),
    };
    let tick = datetime!(2024-11-28 10:05:00 UTC);
    job.run(tick).await;

    let hourly = store.hourly_rows();
    assert_eq!(hourly.len(), 2);
    let by_location = |l: &str| {
        hourly
            .iter()
            .find(|h| h.hourly.location == l)
            .map(|h| (h.hourly.reading_time, h.hourly.usage.active_energy_import))
    };
    assert_eq!(by_location("Lift_OPMC"), Some((tick, 2.0)));
    assert_eq!(by_location("Chiller"), Some((tick, 10.0)));

    let calls = model.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().any(|(l, f)| l == "Lift_OPMC" && f == &vec![2.0]));

    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data["location"], "Chiller");
}

#[tokio::test]
async fn rerunning_a_tick_inserts_again() {
    let store = Arc::new(MemoryStore::new());
    let adapter = IngestionAdapter::new(
        [("energy/lift", "Lift_OPMC")].into_iter().collect(),
        Arc::new(Differencer::new(CounterStore::new(["Lift_OPMC"]))),
        store.clone(),
    );
    adapter.handle(message("energy/lift", "2024-11-28 09:10:00", 1.0)).await;
    adapter.handle(message("energy/lift", "2024-11-28 09:20:00", 3.0)).await;

    let aggregator = Aggregator::new(store.clone(), Duration::hours(1), Duration::ZERO);
    let tick = datetime!(2024-11-28 10:05:00 UTC);
    aggregator.run_tick(tick).await.unwrap();
    aggregator.run_tick(tick).await.unwrap();

    assert_eq!(store.hourly_rows().len(), 2);
}
