//! Per-thingy maintenance state machine driven by the thingy's button.
//!
//! ```text
//! NOT_IN_MAINTENANCE ──[toggle: append start]──▶ IN_MAINTENANCE
//!          ▲                                          │
//!          └──────[toggle / reset_all: append end]────┘
//! ```
//!
//! The database holds the authoritative status. Toggles for the same thingy
//! are serialized in-process so two quick presses cannot both read the same
//! status and double-start.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::db::{now_unix, Db, MaintenanceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaintenanceStatus {
    InMaintenance,
    NotInMaintenance,
}

impl From<bool> for MaintenanceStatus {
    fn from(in_maintenance: bool) -> Self {
        if in_maintenance {
            Self::InMaintenance
        } else {
            Self::NotInMaintenance
        }
    }
}

pub struct MaintenanceTracker {
    db: Db,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MaintenanceTracker {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, thingy_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(thingy_id.to_string()).or_default())
    }

    /// Flip the thingy's status and append the matching history entry.
    pub async fn toggle(&self, thingy_id: &str) -> Result<MaintenanceStatus> {
        let lock = self.lock_for(thingy_id).await;
        let _guard = lock.lock().await;

        let status = MaintenanceStatus::from(self.db.toggle_maintenance(thingy_id, now_unix()).await?);
        info!(thingy = %thingy_id, ?status, "maintenance toggled");
        Ok(status)
    }

    /// End maintenance for every thingy still marked in maintenance. Run once
    /// at startup to clear state left behind by a crash.
    pub async fn reset_all(&self) -> Result<Vec<String>> {
        let reset = self.db.reset_maintenance(now_unix()).await?;
        if !reset.is_empty() {
            info!(count = reset.len(), thingies = ?reset, "maintenance reset");
        }
        Ok(reset)
    }

    /// `None` when the thingy has never been seen.
    pub async fn status(&self, thingy_id: &str) -> Result<Option<MaintenanceStatus>> {
        Ok(self
            .db
            .maintenance_status(thingy_id)
            .await?
            .map(MaintenanceStatus::from))
    }

    pub async fn history(&self, thingy_id: &str) -> Result<Option<MaintenanceRecord>> {
        self.db.maintenance_history(thingy_id).await
    }
}
