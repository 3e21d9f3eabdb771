//! Storage layer for per-user state
//!
//! Keeps every user's record in memory and periodically flushes a JSON
//! snapshot to disk. Snapshots are written to a temporary file and renamed
//! into place, so a crash mid-write leaves the previous snapshot intact.

use crate::config::ModelKind;
use crate::conversation::{ConversationRef, UsageWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Current snapshot layout version
const SNAPSHOT_VERSION: u32 = 1;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the bot remembers about one user
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct UserRecord {
    /// Model the user picked from the keyboard
    #[serde(default)]
    pub selected_model: Option<ModelKind>,
    /// Conversation per model
    #[serde(default)]
    pub conversations: BTreeMap<ModelKind, ConversationRef>,
    /// Usage window per rate-limited model
    #[serde(default)]
    pub usage: BTreeMap<ModelKind, UsageWindow>,
    /// Last modification time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    users: BTreeMap<i64, UserRecord>,
}

/// File-backed store of [`UserRecord`]s keyed by Telegram user id
pub struct JsonFileStorage {
    path: PathBuf,
    records: RwLock<BTreeMap<i64, UserRecord>>,
    dirty: AtomicBool,
    flush_lock: Mutex<()>,
}

impl JsonFileStorage {
    /// Open the store, loading the last snapshot if there is one.
    ///
    /// A missing file yields an empty store. An unreadable snapshot is moved
    /// aside to `<file>.corrupt` and the store starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read or moved aside.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => {
                    info!(
                        path = %path.display(),
                        users = snapshot.users.len(),
                        version = snapshot.version,
                        "Loaded user state snapshot"
                    );
                    snapshot.users
                }
                Err(e) => {
                    let aside = sibling_path(&path, "corrupt");
                    error!(
                        path = %path.display(),
                        error = %e,
                        "User state snapshot is unreadable, moving it to {}",
                        aside.display()
                    );
                    tokio::fs::rename(&path, &aside).await?;
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No user state snapshot yet, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            records: RwLock::new(records),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        })
    }

    /// Get a copy of the user's record (default if unknown)
    pub async fn get_user_record(&self, user_id: i64) -> UserRecord {
        self.records
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Modify a user's record in place and mark the store dirty.
    pub async fn modify_user_record<F, T>(&self, user_id: i64, modifier: F) -> T
    where
        F: FnOnce(&mut UserRecord) -> T,
    {
        let mut records = self.records.write().await;
        let record = records.entry(user_id).or_default();
        let result = modifier(record);
        record.updated_at = Some(Utc::now());
        self.dirty.store(true, Ordering::SeqCst);
        result
    }

    /// Forget everything about a user
    pub async fn remove_user_record(&self, user_id: i64) -> Option<UserRecord> {
        let removed = self.records.write().await.remove(&user_id);
        if removed.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    /// Number of users with a record
    pub async fn user_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether there are changes not yet written to disk
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the snapshot if anything changed since the last flush.
    ///
    /// Returns `true` if a snapshot was written.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the file write fails; the store stays dirty.
    pub async fn flush(&self) -> Result<bool, StorageError> {
        let _guard = self.flush_lock.lock().await;

        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let bytes = {
            let records = self.records.read().await;
            serde_json::to_vec_pretty(&SnapshotRef {
                version: SNAPSHOT_VERSION,
                users: &records,
            })
        };

        let result = match bytes {
            Ok(bytes) => write_atomic(&self.path, &bytes).await.map_err(StorageError::from),
            Err(e) => Err(StorageError::from(e)),
        };

        match result {
            Ok(()) => {
                debug!(path = %self.path.display(), "User state snapshot written");
                Ok(true)
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Flush periodically until `shutdown` is cancelled, then flush one last time.
    pub fn spawn_flush_task(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush().await {
                            warn!(error = %e, "Periodic state flush failed");
                        }
                    }
                }
            }

            match self.flush().await {
                Ok(true) => info!("Final user state snapshot written"),
                Ok(false) => debug!("No unsaved user state at shutdown"),
                Err(e) => error!(error = %e, "Final state flush failed"),
            }
        })
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    users: &'a BTreeMap<i64, UserRecord>,
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{suffix}"));
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = sibling_path(path, "tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}
