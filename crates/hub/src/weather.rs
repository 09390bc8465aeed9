//! Weather poller: fetches current conditions for every plant, turns cloud
//! cover into a light-quality level and tells the plant's thingy to change
//! its LED color when that level moves.
//!
//! ## Light quality (lower is better)
//!
//! ```text
//! cloud cover   0-20   21-40   41-60   61-80   81-100
//! level           0      1       2       3       4
//! color        00FF00  7FFF00  FFFF00  FFA500  FF0000
//! ```
//!
//! A plant whose fetch fails keeps its previous weather for the cycle, so its
//! level is re-derived from stale data and nothing is published for it.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actuation::Actuator;
use crate::db::{Db, Plant};
use crate::state::SharedState;

/// Default time between two polling cycles.
pub const DEFAULT_POLL_SEC: u64 = 120;

// ---------------------------------------------------------------------------
// Light quality
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightQuality {
    pub level: u8,
    pub color: &'static str,
}

impl LightQuality {
    pub fn from_cloud_cover(cloud_cover: f64) -> Self {
        let (level, color) = if cloud_cover >= 81.0 {
            (4, "FF0000")
        } else if cloud_cover >= 61.0 {
            (3, "FFA500")
        } else if cloud_cover >= 41.0 {
            (2, "FFFF00")
        } else if cloud_cover >= 21.0 {
            (1, "7FFF00")
        } else {
            (0, "00FF00")
        };
        Self { level, color }
    }
}

// ---------------------------------------------------------------------------
// Weather source
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("weather api returned status {0}")]
    Status(u16),

    #[error("response has no clouds.all field")]
    MissingCloudCover,
}

/// One weather API response, kept whole for the weather endpoint.
#[derive(Debug, Clone)]
pub struct WeatherReport {
    pub raw: Value,
    pub cloud_cover: f64,
}

impl WeatherReport {
    pub fn from_json(raw: Value) -> Result<Self, WeatherError> {
        let cloud_cover = raw
            .pointer("/clouds/all")
            .and_then(Value::as_f64)
            .ok_or(WeatherError::MissingCloudCover)?;
        Ok(Self { raw, cloud_cover })
    }
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn current(&self, lat: f64, lng: f64) -> Result<WeatherReport, WeatherError>;
}

/// Per-request timeout for the weather API.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// OpenWeatherMap current-weather endpoint.
pub struct OpenWeatherClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenWeatherClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, WeatherError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/weather", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl WeatherSource for OpenWeatherClient {
    async fn current(&self, lat: f64, lng: f64) -> Result<WeatherReport, WeatherError> {
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lng.to_string()),
                ("units", "metric".to_string()),
                ("appid", self.api_key.clone()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(WeatherError::Status(status.as_u16()));
        }
        WeatherReport::from_json(resp.json::<Value>().await?)
    }
}

// ---------------------------------------------------------------------------
// Shared light-quality state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlantLight {
    pub cloud_cover: f64,
    pub level: u8,
}

#[derive(Default)]
struct LightInner {
    weather: HashMap<String, WeatherReport>,
    light: HashMap<String, PlantLight>,
}

/// Latest weather and light level per plant. Written only by the poller.
#[derive(Default)]
pub struct LightQualityState {
    inner: RwLock<LightInner>,
}

impl LightQualityState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn light_quality(&self, plant_id: &str) -> Option<u8> {
        self.inner.read().await.light.get(plant_id).map(|l| l.level)
    }

    pub async fn plant_light(&self, plant_id: &str) -> Option<PlantLight> {
        self.inner.read().await.light.get(plant_id).copied()
    }

    pub async fn current_weather(&self, plant_id: &str) -> Option<Value> {
        self.inner
            .read()
            .await
            .weather
            .get(plant_id)
            .map(|w| w.raw.clone())
    }

    async fn store_weather(&self, plant_id: &str, report: WeatherReport) {
        self.inner
            .write()
            .await
            .weather
            .insert(plant_id.to_string(), report);
    }

    async fn cloud_cover(&self, plant_id: &str) -> Option<f64> {
        self.inner
            .read()
            .await
            .weather
            .get(plant_id)
            .map(|w| w.cloud_cover)
    }

    /// Store the plant's light. Returns `true` when the level differs from
    /// the stored one (or none was stored).
    async fn update_light(&self, plant_id: &str, light: PlantLight) -> bool {
        let mut inner = self.inner.write().await;
        let changed = inner
            .light
            .get(plant_id)
            .map_or(true, |prev| prev.level != light.level);
        inner.light.insert(plant_id.to_string(), light);
        changed
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub plants: usize,
    pub failed: usize,
    pub published: usize,
}

#[derive(Clone)]
pub struct WeatherPoller {
    db: Db,
    source: Arc<dyn WeatherSource>,
    actuator: Arc<dyn Actuator>,
    light: Arc<LightQualityState>,
    shared: SharedState,
}

impl WeatherPoller {
    pub fn new(
        db: Db,
        source: Arc<dyn WeatherSource>,
        actuator: Arc<dyn Actuator>,
        light: Arc<LightQualityState>,
        shared: SharedState,
    ) -> Self {
        Self {
            db,
            source,
            actuator,
            light,
            shared,
        }
    }

    /// One polling cycle. Only fails when the plant list cannot be read.
    pub async fn refresh(&self) -> Result<CycleSummary> {
        let plants = self.db.load_plants().await?;
        let mut summary = CycleSummary {
            plants: plants.len(),
            ..Default::default()
        };

        for plant in &plants {
            match self.source.current(plant.lat, plant.lng).await {
                Ok(report) => self.light.store_weather(&plant.id, report).await,
                Err(e) => {
                    summary.failed += 1;
                    warn!(plant = %plant.id, "weather fetch failed, keeping previous: {e}");
                }
            }
        }

        for plant in &plants {
            if self.apply_light(plant).await {
                summary.published += 1;
            }
        }

        Ok(summary)
    }

    /// Re-derive the plant's level; publish the new color if it changed.
    async fn apply_light(&self, plant: &Plant) -> bool {
        let Some(cloud_cover) = self.light.cloud_cover(&plant.id).await else {
            return false;
        };
        let quality = LightQuality::from_cloud_cover(cloud_cover);
        let changed = self
            .light
            .update_light(
                &plant.id,
                PlantLight {
                    cloud_cover,
                    level: quality.level,
                },
            )
            .await;
        if !changed {
            return false;
        }

        info!(
            plant = %plant.id,
            thingy = %plant.thingy_id,
            level = quality.level,
            color = quality.color,
            "light quality changed"
        );
        self.actuator
            .publish_led_color(&plant.thingy_id, quality.color)
            .await;
        {
            let mut st = self.shared.write().await;
            st.record_actuation(format!(
                "{}: light level {} → LED {}",
                plant.thingy_id, quality.level, quality.color
            ));
        }
        true
    }
}

/// Run the poller until `cancel` fires: one cycle right away, then one per
/// `period`. A cycle still in flight when `cancel` fires is abandoned.
pub async fn run(poller: WeatherPoller, period: Duration, cancel: CancellationToken) {
    info!(period_sec = period.as_secs(), "weather poller started");

    tokio::select! {
        _ = cancel.cancelled() => {
            info!("weather poller stopped");
            return;
        }
        res = poller.refresh() => match res {
            Ok(summary) => info!(?summary, "initial weather cycle done"),
            Err(e) => poller.cycle_failed(e).await,
        }
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = poller.refresh() => {
                        if let Err(e) = res {
                            poller.cycle_failed(e).await;
                        }
                    }
                }
            }
        }
    }

    info!("weather poller stopped");
}

impl WeatherPoller {
    async fn cycle_failed(&self, e: anyhow::Error) {
        error!("weather cycle failed: {e:#}");
        let mut st = self.shared.write().await;
        st.record_error(format!("weather cycle failed: {e}"));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
