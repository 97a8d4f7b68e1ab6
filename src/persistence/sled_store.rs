//! Dead-letter journal backed by `sled`
//!
//! Every failed dispatch can be appended here for later inspection. Keys are
//! timestamp-prefixed so iteration yields entries in chronological order.
//!
//! Policy options:
//! - `ttl_seconds`: entries older than this are removed before each load
//! - `max_entries`: cap on stored entries; oldest are removed first

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::warn;
use uuid::Uuid;

use crate::broker::codec;
use crate::broker::message::Message;
use crate::utils::error::{DeliveryFailure, Result};

const TREE: &str = "dead_letters";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message_id: String,
    pub recipient: Option<String>,
    pub kind: String,
    pub reason: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    /// Versioned wire form of the failed message.
    pub wire: String,
}

impl DeadLetter {
    /// Decode the journaled message.
    pub fn message(&self) -> Result<Message> {
        codec::decode(&self.wire)
    }
}

#[derive(Clone)]
pub struct DeadLetterStore {
    db: Db,
    ttl_seconds: Option<i64>,
    max_entries: Option<usize>,
}

impl DeadLetterStore {
    /// Open or create a sled database at `path` with the given policy.
    pub fn open(
        path: &str,
        ttl_seconds: Option<i64>,
        max_entries: Option<usize>,
    ) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            ttl_seconds,
            max_entries,
        })
    }

    pub fn record(&self, message: &Message, failure: &DeliveryFailure) -> Result<()> {
        let letter = DeadLetter {
            message_id: message.id.clone(),
            recipient: message.recipient.clone(),
            kind: failure.kind().to_string(),
            reason: failure.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            wire: codec::encode(message)?,
        };
        let serialized = serde_json::to_vec(&letter)?;
        let tree = self.db.open_tree(TREE)?;

        let key = format!("{:020}_{}", letter.timestamp, Uuid::new_v4());
        tree.insert(key.as_bytes(), serialized)?;

        if let Some(max) = self.max_entries {
            let excess = tree.len().saturating_sub(max);
            for _ in 0..excess {
                if tree.pop_min()?.is_none() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Load every live entry, oldest first.
    pub fn load(&self) -> Result<Vec<DeadLetter>> {
        self.cleanup_expired()?;
        let tree = self.db.open_tree(TREE)?;
        let mut letters: Vec<DeadLetter> = Vec::new();
        for entry in tree.iter() {
            let (key, val) = entry?;
            match serde_json::from_slice(&val) {
                Ok(letter) => letters.push(letter),
                Err(e) => warn!("Skipping unreadable dead letter {:?}: {}", key, e),
            }
        }
        Ok(letters)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.db.open_tree(TREE)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.db.open_tree(TREE)?.clear()?;
        Ok(())
    }

    fn cleanup_expired(&self) -> Result<()> {
        let Some(ttl) = self.ttl_seconds else {
            return Ok(());
        };
        let cutoff = Utc::now().timestamp_millis() - ttl * 1000;
        let tree = self.db.open_tree(TREE)?;

        // Keys are zero-padded timestamps, so everything before the cutoff key is stale.
        let cutoff_key = format!("{cutoff:020}");
        let stale: Vec<_> = tree
            .range(..cutoff_key.as_bytes())
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for key in stale {
            tree.remove(key)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
