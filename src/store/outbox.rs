//! Sealed replies the relay did not accept yet.
//!
//! Automatic error replies are queued here when the bridge is down so the
//! event that caused them can still be consumed. The queue is drained by
//! `ConnectionService` before each new event.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::vault::Vault;
use crate::crypto::SessionId;
use crate::error::StorageError;

const OUTBOX_KEY: &str = "tonconnect.outbox";

/// An encrypted reply waiting for the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReply {
    pub from: SessionId,
    pub to: String,
    pub request_id: String,
    /// Base64 ciphertext, never plaintext.
    pub body: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OutboxRecord {
    replies: Vec<PendingReply>,
}

pub struct ReplyOutbox {
    vault: Arc<dyn Vault>,
    write_lock: Mutex<()>,
}

impl ReplyOutbox {
    pub fn new(vault: Arc<dyn Vault>) -> Self {
        Self {
            vault,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<OutboxRecord, StorageError> {
        match self.vault.load(OUTBOX_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key: OUTBOX_KEY.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(OutboxRecord::default()),
        }
    }

    async fn store(&self, record: &OutboxRecord) -> Result<(), StorageError> {
        if record.replies.is_empty() {
            return self.vault.remove(OUTBOX_KEY).await;
        }
        let bytes = serde_json::to_vec(record).map_err(|e| StorageError::IoFailure {
            key: OUTBOX_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.vault.save(OUTBOX_KEY, &bytes).await
    }

    /// Replies in the order they were queued.
    pub async fn pending(&self) -> Result<Vec<PendingReply>, StorageError> {
        Ok(self.load().await?.replies)
    }

    pub async fn push(&self, reply: PendingReply) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load().await?;
        record
            .replies
            .retain(|queued| queued.to != reply.to || queued.request_id != reply.request_id);
        tracing::debug!(
            client_id = %reply.to,
            request_id = %reply.request_id,
            queued = record.replies.len() + 1,
            "Queued undelivered reply"
        );
        record.replies.push(reply);
        self.store(&record).await
    }

    /// Drop replies that went out.
    pub async fn remove(&self, delivered: &[PendingReply]) -> Result<(), StorageError> {
        if delivered.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut record = self.load().await?;
        record.replies.retain(|queued| !delivered.contains(queued));
        self.store(&record).await
    }

    /// Drop everything queued for an app that is gone.
    pub async fn discard_client(&self, client_id: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load().await?;
        let before = record.replies.len();
        record.replies.retain(|queued| queued.to != client_id);
        if record.replies.len() == before {
            return Ok(());
        }
        self.store(&record).await
    }
}
