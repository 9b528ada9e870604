use crate::errors::Error;
use crate::ingest::Gateway;
use crate::metrics::{INVALID_REQUESTS_TOTAL, REQUESTS_TOTAL};
use crate::model::{
    ActuatorData, DeviceId, SensorData, Sent, SnapshotResponse, StatusData, Submission,
    TelemetryRecord,
};
use crate::snapshot::Snapshot;
use crate::{validate, ws};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
}

pub fn create_router(gateway: Gateway) -> Router {
    let state = AppState { gateway };

    Router::new()
        .route("/api/v1/telemetry/sensor", post(submit_sensor))
        .route("/api/v1/telemetry/status", post(submit_status))
        .route("/api/v1/telemetry/actuator", post(submit_actuator))
        .route("/api/v1/devices/:device_id/snapshot", get(get_snapshot))
        .route("/ws/sensor/:device_id", get(ws::subscribe))
        .route("/ws/sensor/:device_id/", get(ws::subscribe))
        .with_state(state)
}

async fn submit_sensor(
    State(state): State<AppState>,
    payload: Result<Json<Submission<SensorData>>, JsonRejection>,
) -> Result<Json<Sent>, AppError> {
    accept(&state, payload, validate::sensor_reading).await
}

async fn submit_status(
    State(state): State<AppState>,
    payload: Result<Json<Submission<StatusData>>, JsonRejection>,
) -> Result<Json<Sent>, AppError> {
    accept(&state, payload, validate::device_status).await
}

async fn submit_actuator(
    State(state): State<AppState>,
    payload: Result<Json<Submission<ActuatorData>>, JsonRejection>,
) -> Result<Json<Sent>, AppError> {
    accept(&state, payload, validate::actuator_event).await
}

/// Shared ingestion path: parse, validate, persist, publish.
async fn accept<D>(
    state: &AppState,
    payload: Result<Json<Submission<D>>, JsonRejection>,
    build: fn(Submission<D>, DateTime<Utc>) -> crate::errors::Result<TelemetryRecord>,
) -> Result<Json<Sent>, AppError> {
    REQUESTS_TOTAL.inc();

    let record = payload
        .map_err(|rejection| Error::Validation(rejection.body_text()))
        .and_then(|Json(submission)| build(submission, Utc::now()))
        .map_err(|e| {
            INVALID_REQUESTS_TOTAL.inc();
            warn!("Rejected telemetry: {}", e);
            e
        })?;

    let ingested = state.gateway.ingest(record).await?;
    debug!(
        persisted = ingested.persisted,
        published = ingested.published.is_ok(),
        "telemetry accepted"
    );
    Ok(Json(Sent::new()))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<SnapshotResponse>, AppError> {
    let device_id = DeviceId::new(device_id);
    let snapshot = Snapshot::load(state.gateway.store().as_ref(), &device_id).await?;

    Ok(Json(SnapshotResponse {
        device_id,
        records: snapshot.into_records(),
    }))
}

pub struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            error!("API error: {}", self.0);
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::model::Category;
    use crate::store::{InMemoryTelemetryStore, TelemetryStore};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Harness {
        store: Arc<InMemoryTelemetryStore>,
        broker: Arc<Broker>,
        router: Router,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryTelemetryStore::new());
        let broker = Arc::new(Broker::new(8));
        let gateway = Gateway::new(store.clone(), broker.clone(), false);
        Harness {
            store,
            broker,
            router: create_router(gateway),
        }
    }

    async fn post(router: &Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_sensor_post_persists_first_present_metric() {
        let h = harness();
        let device = DeviceId::new("1");
        let mut sub = h.broker.subscribe(device.clone()).unwrap();

        let (status, body) = post(
            &h.router,
            "/api/v1/telemetry/sensor",
            r#"{"device_id": 1, "data": {"humidity": 10, "temperature": 20}}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "sent"}));

        let rows = h.store.records(&device, Category::Sensor).await;
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            TelemetryRecord::Sensor(r) => {
                assert_eq!(r.fields.humidity, Some(10.0));
                assert!(r.fields.temperature.is_none());
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert_eq!(sub.recv().await.unwrap(), rows[0]);
    }

    #[tokio::test]
    async fn test_sensor_post_without_timestamp_uses_ingestion_clock() {
        let h = harness();
        let before = Utc::now();

        let (status, _) = post(
            &h.router,
            "/api/v1/telemetry/sensor",
            r#"{"device_id": "2", "data": {"temperature": 18.5}}"#,
        )
        .await;
        let after = Utc::now();

        assert_eq!(status, StatusCode::OK);
        let rows = h.store.records(&DeviceId::new("2"), Category::Sensor).await;
        let ts = rows[0].timestamp();
        assert!(ts >= before && ts <= after);
    }

    #[tokio::test]
    async fn test_missing_device_id_rejected_without_side_effects() {
        let h = harness();
        let device = DeviceId::new("1");
        let mut sub = h.broker.subscribe(device.clone()).unwrap();

        let (status, body) = post(
            &h.router,
            "/api/v1/telemetry/sensor",
            r#"{"data": {"humidity": 10}}"#,
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("device_id"));
        assert_eq!(h.store.count(&device, Category::Sensor).await, 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_returns_json_error() {
        let h = harness();

        let (status, body) = post(&h.router, "/api/v1/telemetry/status", "{not json").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_status_post() {
        let h = harness();

        let (status, _) = post(
            &h.router,
            "/api/v1/telemetry/status",
            r#"{"device_id": 4, "data": {"online": false, "cpu_usage": 12.5, "additional_info": {"fw": "1.2"}}}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let rows = h.store.records(&DeviceId::new("4"), Category::Status).await;
        match &rows[..] {
            [TelemetryRecord::Status(r)] => {
                assert!(!r.online);
                assert_eq!(r.cpu_usage, Some(12.5));
                assert_eq!(r.additional_info, Some(json!({"fw": "1.2"})));
            }
            other => panic!("unexpected rows {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_actuator_post_publishes_only() {
        let h = harness();
        let device = DeviceId::new("5");
        let mut sub = h.broker.subscribe(device.clone()).unwrap();

        let (status, _) = post(
            &h.router,
            "/api/v1/telemetry/actuator",
            r#"{"device_id": 5, "data": {"action": "irrigate", "duration": 30}}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.store.count(&device, Category::Actuator).await, 0);
        assert_eq!(sub.recv().await.unwrap().category(), Category::Actuator);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_server_error() {
        struct DownStore;

        #[async_trait]
        impl TelemetryStore for DownStore {
            async fn insert(&self, _record: &TelemetryRecord) -> crate::errors::Result<()> {
                Err(Error::Database(sqlx::Error::PoolClosed))
            }

            async fn latest(
                &self,
                _device_id: &DeviceId,
                _category: Category,
            ) -> crate::errors::Result<Option<TelemetryRecord>> {
                Ok(None)
            }
        }

        let broker = Arc::new(Broker::new(8));
        let router = create_router(Gateway::new(Arc::new(DownStore), broker.clone(), false));
        let mut sub = broker.subscribe(DeviceId::new("1")).unwrap();

        let (status, body) = post(
            &router,
            "/api/v1/telemetry/sensor",
            r#"{"device_id": 1, "data": {"humidity": 10}}"#,
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_broker_down_still_acknowledges() {
        let h = harness();
        h.broker.close();

        let (status, body) = post(
            &h.router,
            "/api/v1/telemetry/sensor",
            r#"{"device_id": 1, "data": {"ph_level": 6.8}}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        assert_eq!(h.store.count(&DeviceId::new("1"), Category::Sensor).await, 1);
    }

    #[tokio::test]
    async fn test_implausible_values_are_persisted_and_published() {
        let h = harness();
        let device = DeviceId::new("1");
        let mut sub = h.broker.subscribe(device.clone()).unwrap();

        for (uri, body) in [
            ("/api/v1/telemetry/sensor", r#"{"device_id": 1, "data": {"temperature": -60}}"#),
            (
                "/api/v1/telemetry/sensor",
                r#"{"device_id": 1, "data": {"humidity": 40, "battery_level": 101}}"#,
            ),
            ("/api/v1/telemetry/status", r#"{"device_id": 1, "data": {"online": true, "cpu_usage": 150}}"#),
        ] {
            let (status, body) = post(&h.router, uri, body).await;
            assert_eq!(status, StatusCode::OK, "{} rejected: {}", uri, body);
            assert!(sub.try_recv().is_some());
        }

        assert_eq!(h.store.count(&device, Category::Sensor).await, 2);
        assert_eq!(h.store.count(&device, Category::Status).await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_route() {
        let h = harness();
        post(
            &h.router,
            "/api/v1/telemetry/sensor",
            r#"{"device_id": 9, "data": {"soil_moisture": 27, "timestamp": "2025-05-04T03:02:01Z"}}"#,
        )
        .await;
        post(
            &h.router,
            "/api/v1/telemetry/status",
            r#"{"device_id": 9, "data": {"online": true}}"#,
        )
        .await;

        let (status, body) = get_json(&h.router, "/api/v1/devices/9/snapshot").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device_id"], "9");
        let records = body["records"].as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["type"], "send_sensor_data");
        assert_eq!(records[0]["data"]["timestamp"], "04.05.2025 03:02:01");
        assert_eq!(records[1]["type"], "device_status_data");
    }
}
