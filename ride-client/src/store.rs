//! Session persistence: the active booking id, and nothing else.
//!
//! A stored id is only a hint. The engine always re-fetches the ride before
//! trusting it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ride_types::BookingId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from a session store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("session store I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The stored record is not valid JSON.
    #[error("session store record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Durable slot for the active booking id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The stored booking id, if any.
    async fn load(&self) -> Result<Option<BookingId>, StoreError>;

    /// Store `booking_id` as the active ride, replacing any previous one.
    async fn save(&self, booking_id: &BookingId) -> Result<(), StoreError>;

    /// Remove the stored id. Clearing an empty store is not an error.
    async fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveRide {
    active_ride_id: BookingId,
}

/// JSON file store (`{"activeRideId": "..."}`), owner-only permissions.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Store backed by the file at `path`. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<BookingId>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let record: ActiveRide = serde_json::from_str(&contents)?;
        Ok(Some(record.active_ride_id))
    }

    async fn save(&self, booking_id: &BookingId) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string(&ActiveRide {
            active_ride_id: booking_id.clone(),
        })?;
        tokio::fs::write(&self.path, contents).await?;
        set_file_permissions_0600(&self.path).await?;
        debug!(path = %self.path.display(), %booking_id, "active ride saved");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// In-memory store. Clones share the slot, so a test can "restart" an
/// engine against the same store.
#[derive(Debug, Default, Clone)]
pub struct MemorySessionStore {
    slot: Arc<Mutex<Option<BookingId>>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Peek at the slot without going through the trait.
    pub fn current(&self) -> Option<BookingId> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<BookingId>, StoreError> {
        Ok(self.current())
    }

    async fn save(&self, booking_id: &BookingId) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(booking_id.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
