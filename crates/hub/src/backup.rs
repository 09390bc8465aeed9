//! Raw message backup: every payload is appended, one per line, to
//! `<root>/<thingy_id>/<YYYYMMDD>.txt`. Ingestion hands entries to a bounded
//! queue; a single writer task owns all file access.

use std::io;
use std::path::{Path, PathBuf};
use time::{Date, OffsetDateTime};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::mqtt::is_valid_thingy_id;

#[derive(Debug, Clone)]
pub struct BackupLog {
    root: PathBuf,
}

impl BackupLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, thingy_id: &str, date: Date) -> PathBuf {
        self.root.join(thingy_id).join(format!(
            "{:04}{:02}{:02}.txt",
            date.year(),
            date.month() as u8,
            date.day()
        ))
    }

    pub async fn append(&self, thingy_id: &str, date: Date, body: &str) -> io::Result<()> {
        if !is_valid_thingy_id(thingy_id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing backup path for thingy id {thingy_id:?}"),
            ));
        }
        let path = self.path_for(thingy_id, date);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(format!("{body}\n").as_bytes()).await?;
        file.flush().await
    }
}

#[derive(Debug)]
struct BackupEntry {
    thingy_id: String,
    date: Date,
    body: String,
}

/// Cheap, cloneable submitter used by the ingestion pipeline.
#[derive(Clone)]
pub struct BackupHandle {
    tx: mpsc::Sender<BackupEntry>,
}

impl BackupHandle {
    /// Queue `payload` for the thingy's file of today (UTC). Never waits: when
    /// the queue is full the entry is dropped with a warning.
    pub fn submit(&self, thingy_id: &str, payload: &[u8]) {
        let entry = BackupEntry {
            thingy_id: thingy_id.to_string(),
            date: OffsetDateTime::now_utc().date(),
            body: String::from_utf8_lossy(payload).into_owned(),
        };
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(e)) => {
                warn!(thingy = %e.thingy_id, "backup queue full — entry dropped");
            }
            Err(TrySendError::Closed(e)) => {
                warn!(thingy = %e.thingy_id, "backup writer stopped — entry dropped");
            }
        }
    }
}

/// Start the writer task. It stops when `cancel` fires (after flushing what
/// is already queued) or when every handle has been dropped.
pub fn spawn_writer(
    log: BackupLog,
    capacity: usize,
    cancel: CancellationToken,
) -> (BackupHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(run_writer(log, rx, cancel));
    (BackupHandle { tx }, task)
}

async fn run_writer(log: BackupLog, mut rx: mpsc::Receiver<BackupEntry>, cancel: CancellationToken) {
    info!(root = %log.root().display(), "backup writer started");
    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(e) => write_entry(&log, e).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                rx.close();
                while let Ok(e) = rx.try_recv() {
                    write_entry(&log, e).await;
                }
                break;
            }
        }
    }
    info!("backup writer stopped");
}

async fn write_entry(log: &BackupLog, e: BackupEntry) {
    if let Err(err) = log.append(&e.thingy_id, e.date, &e.body).await {
        error!(thingy = %e.thingy_id, "backup append failed: {err}");
    }
}
