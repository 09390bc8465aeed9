//! Mirrors numeric telemetry into InfluxDB. Each point carries the thingy as
//! its `location` tag and the reading as its single `value` field. Light
//! readings arrive as four space-separated channels and become four points.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::db::now_unix;

/// App ids worth keeping in the time-series store.
pub const TIME_SERIES_APP_IDS: &[&str] =
    &["AIR_PRESS", "AIR_QUAL", "CO2_EQUIV", "HUMID", "LIGHT", "RSRP", "TEMP"];

/// Per-request timeout for writes to the store.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Measurement names for the light channels, in payload order.
const LIGHT_CHANNELS: [&str; 4] = ["RED", "GREEN", "BLUE", "INFRARED"];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("non-numeric value for {measurement}: {value}")]
    InvalidValue { measurement: String, value: String },

    #[error("light payload must carry 4 channels, got {0}")]
    LightChannels(usize),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("write rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub location: String,
    pub value: f64,
    /// Unix seconds.
    pub ts: i64,
}

impl Point {
    /// InfluxDB line protocol, second precision.
    pub fn to_line(&self) -> String {
        format!(
            "{},location={} value={} {}",
            escape_key(&self.measurement),
            escape_key(&self.location),
            self.value,
            self.ts
        )
    }
}

/// Escapes commas, spaces and equals signs for measurement and tag positions.
fn escape_key(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | ' ' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn is_time_series(app_id: &str) -> bool {
    TIME_SERIES_APP_IDS.contains(&app_id)
}

fn numeric(measurement: &str, raw: &str) -> Result<f64, SinkError> {
    raw.trim().parse::<f64>().map_err(|_| SinkError::InvalidValue {
        measurement: measurement.to_string(),
        value: raw.to_string(),
    })
}

/// Turn one telemetry payload into the points to write.
pub fn points_for(app_id: &str, thingy_id: &str, data: &Value, ts: i64) -> Result<Vec<Point>, SinkError> {
    let point = |measurement: &str, value: f64| Point {
        measurement: measurement.to_string(),
        location: thingy_id.to_string(),
        value,
        ts,
    };

    if app_id == "LIGHT" {
        let raw = match data {
            Value::String(s) => s.as_str(),
            other => {
                return Err(SinkError::InvalidValue {
                    measurement: app_id.to_string(),
                    value: other.to_string(),
                })
            }
        };
        let channels: Vec<&str> = raw.split_whitespace().collect();
        if channels.len() != LIGHT_CHANNELS.len() {
            return Err(SinkError::LightChannels(channels.len()));
        }
        return LIGHT_CHANNELS
            .iter()
            .zip(channels)
            .map(|(label, raw)| Ok(point(*label, numeric(*label, raw)?)))
            .collect();
    }

    let value = match data {
        Value::Number(n) => n.as_f64().ok_or_else(|| SinkError::InvalidValue {
            measurement: app_id.to_string(),
            value: n.to_string(),
        })?,
        Value::String(s) => numeric(app_id, s)?,
        other => {
            return Err(SinkError::InvalidValue {
                measurement: app_id.to_string(),
                value: other.to_string(),
            })
        }
    };
    Ok(vec![point(app_id, value)])
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PointWriter: Send + Sync {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError>;
}

/// InfluxDB v2 `/api/v2/write` client.
pub struct InfluxWriter {
    http: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxWriter {
    pub fn new(base_url: &str, org: &str, bucket: &str, token: &str) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            write_url: format!("{}/api/v2/write", base_url.trim_end_matches('/')),
            org: org.to_string(),
            bucket: bucket.to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl PointWriter for InfluxWriter {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        let body = points
            .iter()
            .map(Point::to_line)
            .collect::<Vec<_>>()
            .join("\n");

        let resp = self
            .http
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TimeSeriesSink {
    writer: Option<Arc<dyn PointWriter>>,
}

impl TimeSeriesSink {
    pub fn new(writer: Arc<dyn PointWriter>) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Sink that accepts and drops everything (no store configured).
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    /// Write one telemetry reading. Never fails: problems are logged.
    pub async fn write(&self, app_id: &str, thingy_id: &str, data: &Value) {
        let Some(writer) = &self.writer else {
            debug!(thingy = %thingy_id, app_id, "time-series sink disabled — skipping");
            return;
        };

        let points = match points_for(app_id, thingy_id, data, now_unix()) {
            Ok(p) => p,
            Err(e) => {
                error!(thingy = %thingy_id, app_id, "time-series: {e}");
                return;
            }
        };

        if let Err(e) = writer.write(&points).await {
            error!(thingy = %thingy_id, app_id, points = points.len(), "time-series write failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
