//! Known thingies and when each was last heard from. The database is the
//! authority on first contact; the in-memory map mirrors last-seen times for
//! cheap reads.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    FirstContact,
    Known,
}

pub struct DeviceRegistry {
    db: Db,
    seen: RwLock<HashMap<String, i64>>,
}

impl DeviceRegistry {
    /// Build the registry, preloading every thingy already in the database.
    pub async fn load(db: Db) -> Result<Self> {
        let seen = db
            .list_thingies()
            .await?
            .into_iter()
            .map(|t| (t.name, t.updated_at))
            .collect();
        Ok(Self {
            db,
            seen: RwLock::new(seen),
        })
    }

    /// Record that `thingy_id` was heard from at `now` (unix seconds).
    pub async fn observe(&self, thingy_id: &str, now: i64) -> Result<Observation> {
        let first = self.db.register_thingy(thingy_id, now).await?;
        self.seen.write().await.insert(thingy_id.to_string(), now);
        Ok(if first {
            Observation::FirstContact
        } else {
            Observation::Known
        })
    }

    pub async fn last_seen(&self, thingy_id: &str) -> Option<i64> {
        self.seen.read().await.get(thingy_id).copied()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, i64> {
        self.seen
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}
