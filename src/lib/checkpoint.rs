//! Durable dispatcher state: one checkpoint per (consumer, shard) and the
//! failure channel holding parked sub-batches.

use std::{fmt, path::Path, str::FromStr};

use chrono::{DateTime, Utc};
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, Result},
    feed::Cursor,
    keys::{key_with_segments, prefix_with_segments, shard_segment},
    model::ChangeEvent,
};

const PREFIX_CHECKPOINT: &str = "checkpoint";
const PREFIX_FAILURE: &str = "failure";

/// Identifies a parked sub-batch by its shard and sequence range. Parking
/// the same range twice overwrites the earlier entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailureId {
    pub shard: u16,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

impl fmt::Display for FailureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}",
            self.shard, self.first_sequence, self.last_sequence
        )
    }
}

impl FromStr for FailureId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || {
            PipelineError::InvalidRequest(format!(
                "failure id '{value}' must look like <shard>:<first>-<last>"
            ))
        };
        let (shard, range) = value.trim().split_once(':').ok_or_else(invalid)?;
        let (first, last) = range.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            shard: shard.parse().map_err(|_| invalid())?,
            first_sequence: first.parse().map_err(|_| invalid())?,
            last_sequence: last.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedFailure {
    pub id: FailureId,
    pub consumer: String,
    pub events: Vec<ChangeEvent>,
    pub attempts: u32,
    pub last_error: String,
    pub parked_at: DateTime<Utc>,
}

impl ParkedFailure {
    /// A range trimmed from the feed before it was delivered. Only its id
    /// survives.
    pub fn is_trimmed_gap(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct DispatcherState {
    db: DBWithThreadMode<MultiThreaded>,
}

impl DispatcherState {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path).map_err(|err| {
            PipelineError::Storage(format!(
                "failed to open dispatcher state at {}: {}",
                path.display(),
                err
            ))
        })?;
        Ok(Self { db })
    }

    pub fn load_checkpoint(&self, consumer: &str, shard: u16) -> Result<Option<Cursor>> {
        match self.db.get(checkpoint_key(consumer, shard))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    PipelineError::InvalidCursor(format!(
                        "corrupt checkpoint for {consumer} shard {shard}"
                    ))
                })?;
                Ok(Some(Cursor::new(shard, u64::from_be_bytes(bytes))))
            }
            None => Ok(None),
        }
    }

    pub fn store_checkpoint(&self, consumer: &str, cursor: &Cursor) -> Result<()> {
        self.db.put(
            checkpoint_key(consumer, cursor.shard),
            cursor.position.to_be_bytes(),
        )?;
        Ok(())
    }

    pub fn park(&self, failure: &ParkedFailure) -> Result<()> {
        self.db
            .put(failure_key(&failure.id), serde_json::to_vec(failure)?)?;
        Ok(())
    }

    pub fn failure(&self, id: &FailureId) -> Result<Option<ParkedFailure>> {
        match self.db.get(failure_key(id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn failures(&self) -> Result<Vec<ParkedFailure>> {
        let prefix = prefix_with_segments(&[PREFIX_FAILURE]);
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
        let mut failures = Vec::new();
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            failures.push(serde_json::from_slice(&value)?);
        }
        Ok(failures)
    }

    pub fn remove_failure(&self, id: &FailureId) -> Result<bool> {
        let key = failure_key(id);
        if self.db.get(&key)?.is_none() {
            return Ok(false);
        }
        self.db.delete(key)?;
        Ok(true)
    }

    /// Replaces a parked entry with a narrower one in a single write.
    pub fn replace_failure(&self, old: &FailureId, failure: &ParkedFailure) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.delete(failure_key(old));
        batch.put(failure_key(&failure.id), serde_json::to_vec(failure)?);
        self.db.write(batch)?;
        Ok(())
    }

    pub fn clear_failures(&self) -> Result<usize> {
        let prefix = prefix_with_segments(&[PREFIX_FAILURE]);
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
        let mut batch = WriteBatch::default();
        let mut removed = 0usize;
        for entry in iter {
            let (key, _) = entry?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            batch.delete(key);
            removed += 1;
        }
        if removed > 0 {
            self.db.write(batch)?;
        }
        Ok(removed)
    }
}

fn checkpoint_key(consumer: &str, shard: u16) -> Vec<u8> {
    key_with_segments(&[PREFIX_CHECKPOINT, consumer, &shard_segment(shard)])
}

fn failure_key(id: &FailureId) -> Vec<u8> {
    let mut key = prefix_with_segments(&[PREFIX_FAILURE, &shard_segment(id.shard)]);
    key.extend_from_slice(&id.first_sequence.to_be_bytes());
    key.extend_from_slice(&id.last_sequence.to_be_bytes());
    key
}
