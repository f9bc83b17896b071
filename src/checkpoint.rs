//! Checkpoint persistence for at-least-once delivery.
//!
//! A checkpoint records the last log position whose transaction every sink
//! accepted. It is read once at startup to pick the resume position and
//! written after each delivered transaction.
//!
//! # Example
//!
//! ```rust,no_run
//! use railgun::checkpoint::{CheckpointStore, FileCheckpointStore};
//! use railgun::LogPosition;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileCheckpointStore::open("./checkpoints").await?;
//!
//!     // Load existing checkpoint
//!     if let Some(checkpoint) = store.load("railgun").await? {
//!         println!("Resuming from LSN: {}", checkpoint.confirmed_position);
//!     }
//!
//!     // Advance after a delivered transaction
//!     store.advance("railgun", "16/B374D848".parse::<LogPosition>()?).await?;
//!
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::postgres::connection::validate_slot_name;
use crate::postgres::LogPosition;
use crate::{Error, Result};

/// The persisted progress of one replication slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// End of the last transaction every sink accepted
    pub confirmed_position: LogPosition,
    /// The replication slot this checkpoint belongs to
    pub slot_name: String,
    /// When the checkpoint was last advanced
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint stamped with the current time.
    ///
    /// # Example
    ///
    /// ```rust
    /// use railgun::checkpoint::Checkpoint;
    /// use railgun::LogPosition;
    ///
    /// let checkpoint = Checkpoint::new("railgun", LogPosition::new(100));
    /// assert_eq!(checkpoint.confirmed_position.to_string(), "0/64");
    /// ```
    pub fn new(slot_name: impl Into<String>, confirmed_position: LogPosition) -> Self {
        Self {
            confirmed_position,
            slot_name: slot_name.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Durable storage of checkpoints, keyed by slot name.
///
/// Several pipelines may share one store as long as they use different
/// slots.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the stored checkpoint, or `None` on first run.
    async fn load(&self, slot: &str) -> Result<Option<Checkpoint>>;

    /// Durably records `position` for `slot`.
    ///
    /// The call returns only once the position would survive a crash.
    /// Positions at or below the stored one are ignored and `false` is
    /// returned; the stored position never moves backwards.
    async fn advance(&self, slot: &str, position: LogPosition) -> Result<bool>;

    /// Forgets the checkpoint of `slot`.
    async fn reset(&self, slot: &str) -> Result<()>;
}

/// Stores one JSON file per slot in a directory.
///
/// Writes go to a temporary file which is synced and then renamed over the
/// checkpoint, so a crash never leaves a partially written file behind.
///
/// # Example
///
/// ```rust,no_run
/// # use railgun::checkpoint::FileCheckpointStore;
/// # async fn example() -> railgun::Result<()> {
/// let store = FileCheckpointStore::open("/var/lib/railgun").await?;
/// assert!(store.path_for("railgun").ends_with("railgun.checkpoint.json"));
/// # Ok(())
/// # }
/// ```
pub struct FileCheckpointStore {
    directory: PathBuf,
    // Serializes read-compare-write in `advance`.
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Opens (creating it if needed) the checkpoint directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the directory cannot be created or is not
    /// writable.
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        fs::create_dir_all(&directory).await.map_err(|e| {
            Error::Config(format!(
                "Cannot create checkpoint directory {:?}: {}",
                directory, e
            ))
        })?;

        let probe = directory.join(".railgun-write-probe");
        fs::write(&probe, b"").await.map_err(|e| {
            Error::Config(format!(
                "Checkpoint directory {:?} is not writable: {}",
                directory, e
            ))
        })?;
        let _ = fs::remove_file(&probe).await;

        debug!("Using checkpoint directory {:?}", directory);
        Ok(Self {
            directory,
            write_lock: Mutex::new(()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, slot: &str) -> PathBuf {
        self.directory.join(format!("{}.checkpoint.json", slot))
    }

    async fn read(&self, slot: &str) -> Result<Option<Checkpoint>> {
        validate_slot_name(slot)?;
        let path = self.path_for(slot);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No checkpoint file found at {:?}", path);
                return Ok(None);
            }
            Err(e) => {
                error!("Failed to read checkpoint file {:?}: {}", path, e);
                return Err(Error::Io(e));
            }
        };

        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            error!("Failed to parse checkpoint file {:?}: {}", path, e);
            Error::Checkpoint(format!("Invalid checkpoint file {:?}: {}", path, e))
        })?;

        if checkpoint.slot_name != slot {
            return Err(Error::Checkpoint(format!(
                "Checkpoint file {:?} belongs to slot '{}'",
                path, checkpoint.slot_name
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.slot_name);
        let temp_path = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;
        sync_directory(&self.directory).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn sync_directory(directory: &Path) -> Result<()> {
    fs::File::open(directory).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_directory(_directory: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, slot: &str) -> Result<Option<Checkpoint>> {
        let checkpoint = self.read(slot).await?;
        if let Some(cp) = &checkpoint {
            info!(
                slot = %slot,
                "Loaded checkpoint: LSN={}, updated_at={}",
                cp.confirmed_position, cp.updated_at
            );
        }
        Ok(checkpoint)
    }

    async fn advance(&self, slot: &str, position: LogPosition) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        if let Some(current) = self.read(slot).await? {
            if position <= current.confirmed_position {
                debug!(
                    slot = %slot,
                    "Ignoring stale checkpoint {} (stored {})",
                    position, current.confirmed_position
                );
                return Ok(false);
            }
        }

        self.write(&Checkpoint::new(slot, position)).await?;
        debug!(slot = %slot, "Checkpoint advanced to {}", position);
        Ok(true)
    }

    async fn reset(&self, slot: &str) -> Result<()> {
        validate_slot_name(slot)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path_for(slot)).await {
            Ok(()) => {
                info!(slot = %slot, "Deleted checkpoint file");
                sync_directory(&self.directory).await
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Keeps checkpoints in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: StdMutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position for `slot`, if any.
    pub fn position(&self, slot: &str) -> Option<LogPosition> {
        self.lock().get(slot).map(|cp| cp.confirmed_position)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Checkpoint>> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, slot: &str) -> Result<Option<Checkpoint>> {
        Ok(self.lock().get(slot).cloned())
    }

    async fn advance(&self, slot: &str, position: LogPosition) -> Result<bool> {
        let mut checkpoints = self.lock();
        match checkpoints.get(slot) {
            Some(current) if position <= current.confirmed_position => Ok(false),
            _ => {
                checkpoints.insert(slot.to_string(), Checkpoint::new(slot, position));
                Ok(true)
            }
        }
    }

    async fn reset(&self, slot: &str) -> Result<()> {
        self.lock().remove(slot);
        Ok(())
    }
}
