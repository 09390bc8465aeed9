//! Per-message ingestion: classify one shadow update and fan it out to the
//! registry, the latest-state cache, the backup log, the time-series sink and
//! the maintenance tracker.
//!
//! Nothing here fails the caller. Every message is consumed whether or not
//! its sinks succeed.
//!
//! The [`Dispatcher`] gives each thingy its own bounded queue and worker, so
//! one thingy's messages are applied in arrival order while different
//! thingies proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup::BackupHandle;
use crate::cache::LatestStateCache;
use crate::db::now_unix;
use crate::maintenance::MaintenanceTracker;
use crate::mqtt::{extract_thingy_id, parse_message};
use crate::registry::{DeviceRegistry, Observation};
use crate::state::SharedState;
use crate::timeseries::{is_time_series, TimeSeriesSink};

#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<DeviceRegistry>,
    cache: Arc<LatestStateCache>,
    maintenance: Arc<MaintenanceTracker>,
    sink: TimeSeriesSink,
    backup: BackupHandle,
    shared: SharedState,
}

impl Pipeline {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        cache: Arc<LatestStateCache>,
        maintenance: Arc<MaintenanceTracker>,
        sink: TimeSeriesSink,
        backup: BackupHandle,
        shared: SharedState,
    ) -> Self {
        Self {
            registry,
            cache,
            maintenance,
            sink,
            backup,
            shared,
        }
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) {
        let Some(thingy_id) = extract_thingy_id(topic) else {
            warn!(%topic, "unhandled topic — dropped");
            return;
        };

        // Raw bytes are kept even when they fail to parse.
        self.backup.submit(thingy_id, payload);

        let msg = match parse_message(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(thingy = %thingy_id, "bad telemetry json: {e}");
                let mut st = self.shared.write().await;
                st.record_error(format!("{thingy_id}: bad telemetry json: {e}"));
                return;
            }
        };

        match self.registry.observe(thingy_id, now_unix()).await {
            Ok(Observation::FirstContact) => info!(thingy = %thingy_id, "new thingy registered"),
            Ok(Observation::Known) => {}
            Err(e) => error!(thingy = %thingy_id, "registry update failed: {e:#}"),
        }

        if msg.is_button_press() {
            self.toggle_maintenance(thingy_id).await;
            return;
        }

        let app_id = msg.app_id.as_deref();
        debug!(thingy = %thingy_id, app_id, data = %msg.data, "telemetry");

        self.cache.record(thingy_id, app_id, &msg.data).await;
        {
            let mut st = self.shared.write().await;
            st.record_telemetry(thingy_id, app_id);
        }

        if let Some(app_id) = app_id.filter(|a| is_time_series(a)) {
            self.sink.write(app_id, thingy_id, &msg.data).await;
        }
    }

    async fn toggle_maintenance(&self, thingy_id: &str) {
        match self.maintenance.toggle(thingy_id).await {
            Ok(status) => {
                let mut st = self.shared.write().await;
                st.record_maintenance(format!("{thingy_id}: {status:?}"));
            }
            Err(e) => {
                error!(thingy = %thingy_id, "maintenance toggle failed: {e:#}");
                let mut st = self.shared.write().await;
                st.record_error(format!("{thingy_id}: maintenance toggle failed: {e}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-thingy dispatch
// ---------------------------------------------------------------------------

/// Default depth of each thingy's queue.
pub const THINGY_QUEUE: usize = 256;

struct Inbound {
    topic: String,
    payload: Vec<u8>,
}

struct Worker {
    tx: mpsc::Sender<Inbound>,
    task: JoinHandle<()>,
}

pub struct Dispatcher {
    pipeline: Pipeline,
    capacity: usize,
    workers: Mutex<HashMap<String, Worker>>,
}

impl Dispatcher {
    pub fn new(pipeline: Pipeline, capacity: usize) -> Self {
        Self {
            pipeline,
            capacity: capacity.max(1),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Queue one inbound publish behind earlier ones for the same thingy.
    /// Never waits on handling: a full queue drops the message.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let Some(thingy_id) = extract_thingy_id(topic) else {
            warn!(%topic, "unhandled topic — dropped");
            return;
        };
        let msg = Inbound {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };

        let mut workers = self.workers.lock().await;
        let msg = match workers.get(thingy_id) {
            Some(w) => match w.tx.try_send(msg) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    warn!(thingy = %thingy_id, "thingy queue full — message dropped");
                    return;
                }
                Err(TrySendError::Closed(msg)) => {
                    warn!(thingy = %thingy_id, "thingy worker gone — restarting");
                    msg
                }
            },
            None => msg,
        };

        let worker = self.spawn_worker();
        if worker.tx.try_send(msg).is_err() {
            warn!(thingy = %thingy_id, "new thingy worker refused message — dropped");
        }
        workers.insert(thingy_id.to_string(), worker);
    }

    fn spawn_worker(&self) -> Worker {
        let (tx, mut rx) = mpsc::channel::<Inbound>(self.capacity);
        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(async move {
            while let Some(m) = rx.recv().await {
                pipeline.handle(&m.topic, &m.payload).await;
            }
        });
        Worker { tx, task }
    }

    /// Close every queue and wait until what was already queued is handled.
    pub async fn shutdown(&self) {
        let workers: Vec<(String, Worker)> = self.workers.lock().await.drain().collect();
        let tasks: Vec<(String, JoinHandle<()>)> = workers
            .into_iter()
            .map(|(id, Worker { tx, task })| {
                drop(tx);
                (id, task)
            })
            .collect();
        for (id, task) in tasks {
            if let Err(e) = task.await {
                error!(thingy = %id, "thingy worker failed: {e}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{spawn_writer, BackupLog};
    use crate::cache::CachedMetric;
    use crate::db::tests::memory_db;
    use crate::db::Db;
    use crate::maintenance::MaintenanceStatus;
    use crate::state::{EventKind, SystemState};
    use crate::timeseries::tests::RecordingWriter;
    use serde_json::json;
    use time::OffsetDateTime;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    const TOPIC: &str = "things/orange-1/shadow/update";

    struct Fixture {
        pipeline: Pipeline,
        cache: Arc<LatestStateCache>,
        registry: Arc<DeviceRegistry>,
        maintenance: Arc<MaintenanceTracker>,
        writer: Arc<RecordingWriter>,
        shared: SharedState,
        log: BackupLog,
        cancel: CancellationToken,
        backup_task: JoinHandle<()>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        /// Stop the backup writer and return today's backup for `thingy_id`.
        async fn backup_contents(self, thingy_id: &str) -> Option<String> {
            self.cancel.cancel();
            self.backup_task.await.unwrap();
            let today = OffsetDateTime::now_utc().date();
            std::fs::read_to_string(self.log.path_for(thingy_id, today)).ok()
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(memory_db().await).await
    }

    async fn fixture_with(db: Db) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = BackupLog::new(dir.path().join("data"));
        let cancel = CancellationToken::new();
        let (backup, backup_task) = spawn_writer(log.clone(), 64, cancel.clone());

        let registry = Arc::new(DeviceRegistry::load(db.clone()).await.unwrap());
        let cache = Arc::new(LatestStateCache::new());
        let maintenance = Arc::new(MaintenanceTracker::new(db));
        let writer = Arc::new(RecordingWriter::default());
        let shared = SystemState::shared();

        let pipeline = Pipeline::new(
            registry.clone(),
            cache.clone(),
            maintenance.clone(),
            TimeSeriesSink::new(writer.clone()),
            backup,
            shared.clone(),
        );

        Fixture {
            pipeline,
            cache,
            registry,
            maintenance,
            writer,
            shared,
            log,
            cancel,
            backup_task,
            dir,
        }
    }

    // -- Telemetry ----------------------------------------------------------

    #[tokio::test]
    async fn cache_reflects_most_recent_value_per_metric() {
        let f = fixture().await;
        for payload in [
            r#"{"appId":"HUMID","data":"40"}"#,
            r#"{"appId":"AIR_PRESS","data":"98.2"}"#,
            r#"{"appId":"HUMID","data":"41"}"#,
            r#"{"appId":"TEMP","data":"22.5"}"#,
            r#"{"appId":"HUMID","data":"43"}"#,
        ] {
            f.pipeline.handle(TOPIC, payload.as_bytes()).await;
        }

        let st = f.cache.get("orange-1").await.unwrap();
        assert_eq!(st.len(), 2);
        assert_eq!(st[&CachedMetric::Humidity], json!("43"));
        assert_eq!(st[&CachedMetric::Pressure], json!("98.2"));
        assert_eq!(f.writer.points().len(), 5);
        assert!(f.registry.last_seen("orange-1").await.is_some());
    }

    #[tokio::test]
    async fn light_payload_writes_four_points() {
        let f = fixture().await;
        f.pipeline
            .handle(TOPIC, br#"{"appId":"LIGHT","data":"10 20 30 40"}"#)
            .await;

        let pts = f.writer.points();
        let labels: Vec<&str> = pts.iter().map(|p| p.measurement.as_str()).collect();
        assert_eq!(labels, vec!["RED", "GREEN", "BLUE", "INFRARED"]);
        assert!(pts.iter().all(|p| p.location == "orange-1" && p.ts == pts[0].ts));
        assert_eq!(
            f.cache.get("orange-1").await.unwrap()[&CachedMetric::Light],
            json!("10 20 30 40")
        );
    }

    #[tokio::test]
    async fn non_metric_app_id_skips_time_series() {
        let f = fixture().await;
        f.pipeline
            .handle(TOPIC, br#"{"appId":"FLIP","data":"UPSIDE_DOWN"}"#)
            .await;

        assert!(f.writer.points().is_empty());
        assert!(f.cache.get("orange-1").await.unwrap().is_empty());
    }

    // -- Button -------------------------------------------------------------

    #[tokio::test]
    async fn button_press_toggles_maintenance_only() {
        let f = fixture().await;
        f.pipeline
            .handle(TOPIC, br#"{"appId":"BUTTON","data":"1"}"#)
            .await;

        assert!(f.cache.get("orange-1").await.is_none());
        assert!(f.writer.points().is_empty());
        assert_eq!(
            f.maintenance.status("orange-1").await.unwrap(),
            Some(MaintenanceStatus::InMaintenance)
        );

        f.pipeline
            .handle(TOPIC, br#"{"appId":"BUTTON","data":"1"}"#)
            .await;
        let rec = f.maintenance.history("orange-1").await.unwrap().unwrap();
        assert!(!rec.maintenance_status);
        assert_eq!(rec.maintenance_start.len(), 1);
        assert_eq!(rec.maintenance_end.len(), 1);
    }

    #[tokio::test]
    async fn button_release_is_plain_telemetry() {
        let f = fixture().await;
        f.pipeline
            .handle(TOPIC, br#"{"appId":"BUTTON","data":"0"}"#)
            .await;

        assert_eq!(
            f.maintenance.status("orange-1").await.unwrap(),
            Some(MaintenanceStatus::NotInMaintenance)
        );
        assert!(f.cache.get("orange-1").await.is_some());
        assert!(f.writer.points().is_empty());
    }

    #[tokio::test]
    async fn button_press_is_still_backed_up() {
        let f = fixture().await;
        f.pipeline
            .handle(TOPIC, br#"{"appId":"BUTTON","data":"1"}"#)
            .await;

        let contents = f.backup_contents("orange-1").await.unwrap();
        assert_eq!(contents, "{\"appId\":\"BUTTON\",\"data\":\"1\"}\n");
    }

    // -- Malformed input ----------------------------------------------------

    #[tokio::test]
    async fn bad_json_is_backed_up_but_changes_nothing() {
        let f = fixture().await;
        f.pipeline.handle(TOPIC, b"{not json").await;

        assert!(f.cache.get("orange-1").await.is_none());
        assert!(f.registry.last_seen("orange-1").await.is_none());
        assert!(f.writer.points().is_empty());
        {
            let st = f.shared.read().await;
            assert_eq!(st.events.back().unwrap().kind, EventKind::Error);
        }

        assert_eq!(f.backup_contents("orange-1").await.unwrap(), "{not json\n");
    }

    #[tokio::test]
    async fn unexpected_topic_is_dropped() {
        let f = fixture().await;
        f.pipeline
            .handle("things/orange-1/other", br#"{"appId":"HUMID","data":"40"}"#)
            .await;

        assert!(f.cache.all().await.is_empty());
        assert!(f.backup_contents("orange-1").await.is_none());
    }

    #[tokio::test]
    async fn dot_dot_thingy_id_is_dropped() {
        let f = fixture().await;
        f.pipeline
            .handle("things/../shadow/update", br#"{"appId":"HUMID","data":"40"}"#)
            .await;

        assert!(f.registry.snapshot().await.is_empty());
        assert!(f.cache.all().await.is_empty());

        f.cancel.cancel();
        f.backup_task.await.unwrap();
        let beside_root: Vec<_> = std::fs::read_dir(f.dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != "data")
            .collect();
        assert!(beside_root.is_empty(), "{beside_root:?}");
    }

    // -- Dispatcher -----------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dispatcher_keeps_arrival_order_per_thingy() {
        let db_dir = tempfile::tempdir().unwrap();
        let db_url = format!("sqlite:{}?mode=rwc", db_dir.path().join("hub.db").display());
        let db = Db::connect(&db_url).await.unwrap();
        db.migrate().await.unwrap();

        let f = fixture_with(db).await;
        let dispatcher = Dispatcher::new(f.pipeline.clone(), THINGY_QUEUE);

        const N: usize = 100;
        for i in 0..N {
            let humid = format!(r#"{{"appId":"HUMID","data":"{i}"}}"#);
            let press = format!(r#"{{"appId":"AIR_PRESS","data":"{i}"}}"#);
            dispatcher
                .dispatch("things/orange-1/shadow/update", humid.as_bytes())
                .await;
            dispatcher
                .dispatch("things/orange-2/shadow/update", press.as_bytes())
                .await;
        }
        dispatcher.shutdown().await;

        let last = json!((N - 1).to_string());
        assert_eq!(
            f.cache.get("orange-1").await.unwrap()[&CachedMetric::Humidity],
            last
        );
        assert_eq!(
            f.cache.get("orange-2").await.unwrap()[&CachedMetric::Pressure],
            last
        );

        let humid: Vec<f64> = f
            .writer
            .points()
            .into_iter()
            .filter(|p| p.location == "orange-1")
            .map(|p| p.value)
            .collect();
        let expected: Vec<f64> = (0..N).map(|i| i as f64).collect();
        assert_eq!(humid, expected);
    }

    #[tokio::test]
    async fn dispatcher_drops_unexpected_topic() {
        let f = fixture().await;
        let dispatcher = Dispatcher::new(f.pipeline.clone(), THINGY_QUEUE);
        dispatcher
            .dispatch("things/../shadow/update", br#"{"appId":"HUMID","data":"40"}"#)
            .await;
        assert!(dispatcher.workers.lock().await.is_empty());
        dispatcher.shutdown().await;
    }

    // -- Backup ---------------------------------------------------------------

    #[tokio::test]
    async fn messages_share_the_daily_backup_file() {
        let f = fixture().await;
        f.pipeline
            .handle(TOPIC, br#"{"appId":"TEMP","data":"20"}"#)
            .await;
        f.pipeline
            .handle(TOPIC, br#"{"appId":"TEMP","data":"21"}"#)
            .await;

        let contents = f.backup_contents("orange-1").await.unwrap();
        assert_eq!(
            contents.lines().collect::<Vec<_>>(),
            vec![
                r#"{"appId":"TEMP","data":"20"}"#,
                r#"{"appId":"TEMP","data":"21"}"#
            ]
        );
    }
}
