//! Runtime settings from the environment, plus TOML config file loading,
//! validation, and database seeding for plants.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::db::{Db, Plant};
use crate::weather::DEFAULT_POLL_SEC;

/// Optional dotenv file read before the environment is consulted.
pub const ENV_FILE: &str = "environments/api.env";

// ---------------------------------------------------------------------------
// Environment settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub db_url: String,
    pub config_path: String,
    pub data_dir: String,
    pub backup_queue: usize,
    pub influx: Option<InfluxSettings>,
    pub weather_api_url: String,
    pub weather_api_key: String,
    pub weather_poll: Duration,
    pub web_port: u16,
}

#[derive(Debug, Clone)]
pub struct InfluxSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Read settings from the process environment, loading `ENV_FILE` first
    /// when it exists.
    pub fn from_env() -> Self {
        if Path::new(ENV_FILE).exists() {
            if let Err(e) = dotenvy::from_filename(ENV_FILE) {
                tracing::warn!("failed to load {ENV_FILE}: {e}");
            }
        }

        let influx = env::var("INFLUXDB_URL").ok().map(|url| InfluxSettings {
            url,
            org: var_or("INFLUXDB_ORG", "default"),
            bucket: var_or("INFLUXDB_BUCKET", "default"),
            token: var_or("INFLUXDB_TOKEN", ""),
        });

        Self {
            mqtt_host: var_or("MQTT_HOST", "127.0.0.1"),
            mqtt_port: parsed_or("MQTT_PORT", 1883),
            mqtt_username: env::var("MQTT_USERNAME").ok(),
            mqtt_password: env::var("MQTT_PASSWORD").ok(),
            db_url: var_or("DB_URL", "sqlite:thingy.db?mode=rwc"),
            config_path: var_or("CONFIG_PATH", "config.toml"),
            data_dir: var_or("DATA_DIR", "data"),
            backup_queue: parsed_or("BACKUP_QUEUE", 1024),
            influx,
            weather_api_url: var_or(
                "WEATHER_API_URL",
                "https://api.openweathermap.org/data/2.5/",
            ),
            weather_api_key: var_or("WEATHER_API_KEY", "default"),
            weather_poll: Duration::from_secs(parsed_or("WEATHER_POLL_SEC", DEFAULT_POLL_SEC).max(1)),
            web_port: parsed_or("WEB_PORT", 8000),
        }
    }
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PlantEntry {
    pub id: String,
    pub friendly_name: String,
    pub thingy_id: String,
    pub lat: f64,
    pub lng: f64,
    pub locality: Option<String>,
    pub max_power: Option<f64>,
    pub nr_panels: Option<i64>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.id.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&p.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }

            if p.friendly_name.trim().is_empty() {
                errors.push(format!("{}: friendly_name is empty", ctx()));
            }

            // thingy ids end up in MQTT topics and file paths.
            if p.thingy_id.trim().is_empty() {
                errors.push(format!("{}: thingy_id is empty", ctx()));
            } else if p.thingy_id.contains(['/', '+', '#']) || p.thingy_id.contains("..") {
                errors.push(format!(
                    "{}: thingy_id '{}' contains a reserved character",
                    ctx(),
                    p.thingy_id
                ));
            }

            // ── Coordinates ─────────────────────────────────────
            if !(-90.0..=90.0).contains(&p.lat) {
                errors.push(format!("{}: lat {} out of range [-90, 90]", ctx(), p.lat));
            }
            if !(-180.0..=180.0).contains(&p.lng) {
                errors.push(format!("{}: lng {} out of range [-180, 180]", ctx(), p.lng));
            }

            // ── Installation ────────────────────────────────────
            if let Some(power) = p.max_power {
                if power < 0.0 {
                    errors.push(format!("{}: max_power must not be negative, got {power}", ctx()));
                }
            }
            if let Some(n) = p.nr_panels {
                if n < 0 {
                    errors.push(format!("{}: nr_panels must not be negative, got {n}", ctx()));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields an
/// empty config.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found — no plants seeded");
        return Ok(Config { plants: Vec::new() });
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all plants from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for p in &config.plants {
        db.upsert_plant(&Plant {
            id: p.id.clone(),
            friendly_name: p.friendly_name.clone(),
            thingy_id: p.thingy_id.clone(),
            locality: p.locality.clone(),
            lat: p.lat,
            lng: p.lng,
            max_power: p.max_power,
            nr_panels: p.nr_panels,
        })
        .await
        .with_context(|| format!("failed to upsert plant '{}'", p.id))?;
    }

    tracing::info!(plants = config.plants.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
