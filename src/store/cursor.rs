//! Last processed bridge event id.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::vault::Vault;
use crate::error::StorageError;

const CURSOR_KEY: &str = "tonconnect.last_event_id";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorRecord {
    last_event_id: String,
}

/// Order of two event ids. Bridge ids are decimal; anything else only
/// compares equal to itself.
fn compare_ids(a: &str, b: &str) -> Option<Ordering> {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(a), Ok(b)) => Some(a.cmp(&b)),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

pub struct CursorStore {
    vault: Arc<dyn Vault>,
    write_lock: Mutex<()>,
}

impl CursorStore {
    pub fn new(vault: Arc<dyn Vault>) -> Self {
        Self {
            vault,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn last_event_id(&self) -> Result<Option<String>, StorageError> {
        let Some(bytes) = self.vault.load(CURSOR_KEY).await? else {
            return Ok(None);
        };
        let record: CursorRecord =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key: CURSOR_KEY.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(record.last_event_id))
    }

    /// Whether `event_id` is at or behind the stored cursor.
    pub async fn has_seen(&self, event_id: &str) -> Result<bool, StorageError> {
        Ok(match self.last_event_id().await? {
            Some(current) => matches!(
                compare_ids(event_id, &current),
                Some(Ordering::Less | Ordering::Equal)
            ),
            None => false,
        })
    }

    /// Advance the cursor. Returns `false` and writes nothing when
    /// `event_id` is not newer than the stored one.
    pub async fn save(&self, event_id: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;

        if let Some(current) = self.last_event_id().await? {
            match compare_ids(event_id, &current) {
                Some(Ordering::Greater) => {}
                Some(_) => return Ok(false),
                None => {
                    tracing::warn!(
                        event_id = %event_id,
                        current = %current,
                        "Non-numeric bridge event id, replacing cursor"
                    );
                }
            }
        }

        let record = CursorRecord {
            last_event_id: event_id.to_string(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| StorageError::IoFailure {
            key: CURSOR_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.vault.save(CURSOR_KEY, &bytes).await?;
        tracing::debug!(event_id = %event_id, "Advanced bridge cursor");
        Ok(true)
    }
}
