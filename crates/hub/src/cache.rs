//! Latest-known value per thingy for the handful of metrics the live view
//! shows. Written only by the ingestion pipeline.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CachedMetric {
    Humidity,
    Pressure,
    Light,
}

impl CachedMetric {
    pub fn from_app_id(app_id: &str) -> Option<Self> {
        match app_id {
            "HUMID" => Some(Self::Humidity),
            "AIR_PRESS" => Some(Self::Pressure),
            "LIGHT" => Some(Self::Light),
            _ => None,
        }
    }
}

pub type LatestState = BTreeMap<CachedMetric, Value>;

#[derive(Default)]
pub struct LatestStateCache {
    inner: RwLock<HashMap<String, LatestState>>,
}

impl LatestStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure an entry exists for `thingy_id` and overwrite the mapped metric,
    /// if any. Unmapped app ids only create the (possibly empty) entry.
    pub async fn record(&self, thingy_id: &str, app_id: Option<&str>, data: &Value) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(thingy_id.to_string()).or_default();
        if let Some(metric) = app_id.and_then(CachedMetric::from_app_id) {
            entry.insert(metric, data.clone());
        }
    }

    pub async fn get(&self, thingy_id: &str) -> Option<LatestState> {
        self.inner.read().await.get(thingy_id).cloned()
    }

    pub async fn all(&self) -> BTreeMap<String, LatestState> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
