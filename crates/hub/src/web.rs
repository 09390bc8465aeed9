//! Read-only HTTP query surface over the hub's in-memory state and database.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{LatestState, LatestStateCache};
use crate::db::{Db, MaintenanceRecord};
use crate::maintenance::{MaintenanceStatus, MaintenanceTracker};
use crate::registry::DeviceRegistry;
use crate::state::SharedState;
use crate::weather::LightQualityState;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(e) => {
                error!("api request failed: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub cache: Arc<LatestStateCache>,
    pub maintenance: Arc<MaintenanceTracker>,
    pub light: Arc<LightQualityState>,
    pub registry: Arc<DeviceRegistry>,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/plants", get(list_plants))
        .route("/api/thingies", get(list_thingies))
        .route("/live", get(live_all))
        .route("/live/{thingy_id}", get(live_one))
        .route("/maintenance/{thingy_id}", get(maintenance_status))
        .route("/maintenance/{thingy_id}/history", get(maintenance_history))
        .route("/light-quality/{plant_id}", get(light_quality))
        .route("/weather/{plant_id}", get(current_weather))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn live_all(State(state): State<AppState>) -> Json<BTreeMap<String, LatestState>> {
    Json(state.cache.all().await)
}

async fn live_one(
    State(state): State<AppState>,
    Path(thingy_id): Path<String>,
) -> ApiResult<LatestState> {
    state
        .cache
        .get(&thingy_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("thingy '{thingy_id}'")))
}

#[derive(Serialize)]
struct MaintenanceView {
    thingy_id: String,
    maintenance_status: MaintenanceStatus,
}

async fn maintenance_status(
    State(state): State<AppState>,
    Path(thingy_id): Path<String>,
) -> ApiResult<MaintenanceView> {
    match state.maintenance.status(&thingy_id).await? {
        Some(status) => Ok(Json(MaintenanceView {
            thingy_id,
            maintenance_status: status,
        })),
        None => Err(ApiError::NotFound(format!("thingy '{thingy_id}'"))),
    }
}

async fn maintenance_history(
    State(state): State<AppState>,
    Path(thingy_id): Path<String>,
) -> ApiResult<MaintenanceRecord> {
    state
        .maintenance
        .history(&thingy_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("thingy '{thingy_id}'")))
}

#[derive(Serialize)]
struct LightView {
    plant_id: String,
    level: u8,
    cloud_cover: f64,
}

async fn light_quality(
    State(state): State<AppState>,
    Path(plant_id): Path<String>,
) -> ApiResult<LightView> {
    match state.light.plant_light(&plant_id).await {
        Some(l) => Ok(Json(LightView {
            plant_id,
            level: l.level,
            cloud_cover: l.cloud_cover,
        })),
        None => Err(not_found_for_plant(&state.db, &plant_id, "light quality").await),
    }
}

/// Distinguish an unknown plant from one with nothing computed yet.
async fn not_found_for_plant(db: &Db, plant_id: &str, what: &str) -> ApiError {
    match db.get_plant(plant_id).await {
        Ok(Some(_)) => ApiError::NotFound(format!("{what} for plant '{plant_id}'")),
        Ok(None) => ApiError::NotFound(format!("plant '{plant_id}'")),
        Err(e) => ApiError::Internal(e),
    }
}

async fn current_weather(
    State(state): State<AppState>,
    Path(plant_id): Path<String>,
) -> ApiResult<Value> {
    match state.light.current_weather(&plant_id).await {
        Some(raw) => Ok(Json(raw)),
        None => Err(not_found_for_plant(&state.db, &plant_id, "weather").await),
    }
}

#[derive(Serialize)]
struct PlantView {
    #[serde(flatten)]
    plant: crate::db::Plant,
    light_quality: Option<u8>,
}

async fn list_plants(State(state): State<AppState>) -> ApiResult<Vec<PlantView>> {
    let plants = state.db.load_plants().await?;
    let mut out = Vec::with_capacity(plants.len());
    for plant in plants {
        let light_quality = state.light.light_quality(&plant.id).await;
        out.push(PlantView {
            plant,
            light_quality,
        });
    }
    Ok(Json(out))
}

#[derive(Serialize)]
struct ThingyView {
    name: String,
    last_seen: i64,
}

async fn list_thingies(State(state): State<AppState>) -> Json<Vec<ThingyView>> {
    let thingies = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(|(name, last_seen)| ThingyView { name, last_seen })
        .collect();
    Json(thingies)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("http api stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::tests::RecordingActuator;
    use crate::db::tests::{memory_db, test_plant};
    use crate::state::SystemState;
    use crate::weather::{WeatherError, WeatherPoller, WeatherReport, WeatherSource};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    struct Overcast;

    #[async_trait]
    impl WeatherSource for Overcast {
        async fn current(&self, _lat: f64, _lng: f64) -> Result<WeatherReport, WeatherError> {
            WeatherReport::from_json(json!({ "clouds": { "all": 75 }, "name": "Yverdon" }))
        }
    }

    async fn test_state() -> AppState {
        let db = memory_db().await;
        AppState {
            shared: SystemState::shared(),
            cache: Arc::new(LatestStateCache::new()),
            maintenance: Arc::new(MaintenanceTracker::new(db.clone())),
            light: Arc::new(LightQualityState::new()),
            registry: Arc::new(DeviceRegistry::load(db.clone()).await.unwrap()),
            db,
        }
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
        let resp = router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_reports_events() {
        let state = test_state().await;
        state
            .shared
            .write()
            .await
            .record_system("hub started".to_string());

        let (status, body) = get_json(state, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mqtt_connected"], json!(false));
        assert_eq!(body["events"][0]["kind"], json!("system"));
    }

    #[tokio::test]
    async fn live_state_by_thingy() {
        let state = test_state().await;
        state
            .cache
            .record("orange-1", Some("HUMID"), &json!("43"))
            .await;

        let (status, body) = get_json(state.clone(), "/live/orange-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "humidity": "43" }));

        let (_, all) = get_json(state, "/live").await;
        assert_eq!(all, json!({ "orange-1": { "humidity": "43" } }));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let state = test_state().await;
        for uri in [
            "/live/nope",
            "/maintenance/nope",
            "/maintenance/nope/history",
            "/light-quality/nope",
            "/weather/nope",
        ] {
            let (status, body) = get_json(state.clone(), uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert!(body["error"].as_str().unwrap().contains("not found"));
        }
    }

    #[tokio::test]
    async fn plant_without_weather_yet() {
        let state = test_state().await;
        state.db.upsert_plant(&test_plant("p1", "orange-1")).await.unwrap();

        let (status, body) = get_json(state, "/light-quality/p1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("light quality for plant 'p1' not found"));
    }

    #[tokio::test]
    async fn maintenance_status_and_history() {
        let state = test_state().await;
        state.maintenance.toggle("orange-1").await.unwrap();

        let (status, body) = get_json(state.clone(), "/maintenance/orange-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["maintenance_status"], json!("IN_MAINTENANCE"));

        let (_, history) = get_json(state, "/maintenance/orange-1/history").await;
        assert_eq!(history["maintenance_start"].as_array().unwrap().len(), 1);
        assert!(history["maintenance_end"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plants_carry_light_quality() {
        let state = test_state().await;
        state.db.upsert_plant(&test_plant("p1", "orange-1")).await.unwrap();

        let (_, before) = get_json(state.clone(), "/api/plants").await;
        assert_eq!(before[0]["id"], json!("p1"));
        assert_eq!(before[0]["light_quality"], Value::Null);

        let poller = WeatherPoller::new(
            state.db.clone(),
            Arc::new(Overcast),
            Arc::new(RecordingActuator::default()),
            state.light.clone(),
            state.shared.clone(),
        );
        poller.refresh().await.unwrap();

        let (_, after) = get_json(state.clone(), "/api/plants").await;
        assert_eq!(after[0]["light_quality"], json!(3));

        let (status, light) = get_json(state.clone(), "/light-quality/p1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(light["level"], json!(3));

        let (_, weather) = get_json(state, "/weather/p1").await;
        assert_eq!(weather["name"], json!("Yverdon"));
    }

    #[tokio::test]
    async fn thingies_listed_with_last_seen() {
        let state = test_state().await;
        state.registry.observe("orange-1", 1_700_000_000).await.unwrap();

        let (_, body) = get_json(state, "/api/thingies").await;
        assert_eq!(
            body,
            json!([{ "name": "orange-1", "last_seen": 1_700_000_000 }])
        );
    }
}
