//! Read-only REST API over stored readings and anomalies, plus push-token
//! registration. All routes live under `/api`.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use energy_client::domain::{
    reading_time::{format_reading_time, parse_reading_time},
    AnomalyDetail, AnomalySummary, EnergyCounters, StoredSensorRecord,
};
use serde::{Deserialize, Serialize};
use time::{macros::format_description, Date, OffsetDateTime, UtcOffset};
use tokio_util::sync::CancellationToken;

use crate::{
    notify::{Notifier, PushMessage},
    storage::{EnergyStore, StorageError},
};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn EnergyStore>,
    pub notifier: Option<Arc<Notifier>>,
    pub display_offset: UtcOffset,
}

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/fetch_data/anomaly", get(list_anomalies))
        .route("/fetch_data/anomaly/:id", get(anomaly_detail))
        .route("/fetch_data/:location/last_history", get(last_history))
        .route("/fetch_data/:location/:range", get(historical))
        .route("/add_notification_token", post(add_notification_token))
        .route("/send-notification", post(send_notification))
        .with_state(state);

    Router::new().nest("/api", api)
}

pub async fn serve(bind_addr: &str, state: ApiState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api bind addr: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "REST API listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("REST API stopped");
    Ok(())
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        tracing::error!(error = %e, "storage error while serving request");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ReadingResponse {
    pub id: i64,
    pub reading_time: String,
    pub position: String,
    pub meter_type: String,
    pub meter_serial_number: String,
    #[serde(flatten)]
    pub usage: EnergyCounters,
}

impl ReadingResponse {
    fn new(row: StoredSensorRecord, offset: UtcOffset) -> Self {
        Self {
            id: row.id,
            reading_time: format_reading_time(row.record.reading_time, offset),
            position: row.record.location,
            meter_type: row.record.meter_type,
            meter_serial_number: row.record.meter_serial_number,
            usage: row.record.usage,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AnomalyResponse {
    pub id: i64,
    pub position: String,
    pub reading_time: String,
    pub anomaly_type: String,
}

impl AnomalyResponse {
    fn new(row: AnomalySummary, offset: UtcOffset) -> Self {
        Self {
            id: row.id,
            position: row.location,
            reading_time: format_reading_time(row.reading_time, offset),
            anomaly_type: row.anomaly_type,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AnomalyDetailResponse {
    pub reading_time: String,
    pub position: String,
    pub meter_type: String,
    pub meter_serial_number: String,
    #[serde(flatten)]
    pub usage: EnergyCounters,
    pub anomaly_type: String,
    pub predicted_energy: Option<f64>,
}

impl AnomalyDetailResponse {
    fn new(row: AnomalyDetail, offset: UtcOffset) -> Self {
        let hourly = row.usage.hourly;
        Self {
            reading_time: format_reading_time(hourly.reading_time, offset),
            position: hourly.location,
            meter_type: hourly.meter_type,
            meter_serial_number: hourly.meter_serial_number,
            usage: hourly.usage,
            anomaly_type: row.anomaly_type,
            predicted_energy: row.predicted_energy,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Range bounds accept RFC 3339, a naive `YYYY-MM-DD HH:MM:SS` reading
/// time, or a bare date (midnight). An empty bound is open.
fn parse_bound(raw: &str) -> Result<Option<OffsetDateTime>, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(ts) = parse_reading_time(raw) {
        return Ok(Some(ts));
    }
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map(|d| Some(d.midnight().assume_utc()))
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid date '{raw}'")))
}

fn parse_range(range: &str) -> Result<(Option<OffsetDateTime>, Option<OffsetDateTime>), ApiError> {
    let (start, end) = range.split_once('&').ok_or_else(|| {
        ApiError::new(StatusCode::BAD_REQUEST, "expected '<start>&<end>' date range")
    })?;
    Ok((parse_bound(start)?, parse_bound(end)?))
}

async fn historical(
    State(state): State<ApiState>,
    Path((location, range)): Path<(String, String)>,
) -> Result<Json<Vec<ReadingResponse>>, ApiError> {
    let (start, end) = parse_range(&range)?;
    let rows = state.store.historical_readings(&location, start, end).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| ReadingResponse::new(r, state.display_offset))
            .collect(),
    ))
}

async fn last_history(
    State(state): State<ApiState>,
    Path(location): Path<String>,
) -> Result<Json<Vec<ReadingResponse>>, ApiError> {
    let rows = state.store.last_two_readings(&location).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| ReadingResponse::new(r, state.display_offset))
            .collect(),
    ))
}

async fn list_anomalies(State(state): State<ApiState>) -> Result<Json<Vec<AnomalyResponse>>, ApiError> {
    let rows = state.store.anomalies().await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| AnomalyResponse::new(r, state.display_offset))
            .collect(),
    ))
}

async fn anomaly_detail(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AnomalyDetailResponse>>, ApiError> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid ID format"));
    }
    // All digits but too large for an id cannot exist.
    let Ok(id) = id.parse::<i64>() else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Anomaly not found"));
    };

    match state.store.anomaly_detail(id).await? {
        Some(detail) => Ok(Json(vec![AnomalyDetailResponse::new(detail, state.display_offset)])),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "Anomaly not found")),
    }
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    token: Option<String>,
}

async fn add_notification_token(
    State(state): State<ApiState>,
    body: Option<Json<TokenRequest>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let token = body
        .and_then(|Json(b)| b.token)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "token is required"))?;

    state
        .store
        .save_token(&token, OffsetDateTime::now_utc().date())
        .await?;
    metrics::counter!("notification_tokens_registered_total").increment(1);
    tracing::info!("notification token registered");

    Ok(Json(MessageResponse {
        message: "token saved".to_string(),
    }))
}

async fn send_notification(State(state): State<ApiState>) -> Result<Json<MessageResponse>, ApiError> {
    let notifier = state.notifier.as_ref().ok_or_else(|| {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "notifications are not configured")
    })?;

    let mut data = BTreeMap::new();
    data.insert("timestamp".to_string(), "2024-11-28 15:30:00".to_string());
    data.insert("anomaly".to_string(), "Overheating detected".to_string());
    data.insert("location".to_string(), "Jakarta".to_string());

    notifier
        .notify_now(&PushMessage::anomaly(data))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(MessageResponse {
        message: "notification sent".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn range_bounds_accept_several_forms() {
        let (s, e) = parse_range("2024-01-01&2024-01-02 12:00:00").unwrap();
        assert_eq!(s, Some(datetime!(2024-01-01 00:00:00 UTC)));
        assert_eq!(e, Some(datetime!(2024-01-02 12:00:00 UTC)));

        let (s, e) = parse_range("&2024-01-02T00:00:00+07:00").unwrap();
        assert_eq!(s, None);
        assert_eq!(e, Some(datetime!(2024-01-01 17:00:00 UTC)));

        assert_eq!(parse_range("&").unwrap(), (None, None));
    }

    #[test]
    fn bad_ranges_are_client_errors() {
        assert_eq!(parse_range("2024-01-01").unwrap_err().status, StatusCode::BAD_REQUEST);
        assert_eq!(parse_range("soon&later").unwrap_err().status, StatusCode::BAD_REQUEST);
    }
}
