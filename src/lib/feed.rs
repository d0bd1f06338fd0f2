use serde::{Deserialize, Serialize};

use crate::{error::Result, model::ChangeEvent};

/// Position within one shard of the change feed. `position` is the last
/// fully processed sequence; zero means nothing has been read yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub shard: u16,
    pub position: u64,
}

impl Cursor {
    pub fn new(shard: u16, position: u64) -> Self {
        Self { shard, position }
    }

    pub fn origin(shard: u16) -> Self {
        Self::new(shard, 0)
    }
}

#[derive(Debug, Clone)]
pub struct FeedBatch {
    pub events: Vec<ChangeEvent>,
    pub next_cursor: Cursor,
}

impl FeedBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Ordered, per-shard stream of writes made to the details store.
pub trait ChangeFeed: Send + Sync {
    fn shards(&self) -> Vec<u16>;

    /// Returns up to `max` events strictly after `cursor`. The returned
    /// cursor points at the last event in the batch, or at the (possibly
    /// clamped) input position when the batch is empty.
    fn get_batch(&self, cursor: &Cursor, max: usize) -> Result<FeedBatch>;

    fn latest_position(&self, shard: u16) -> Result<u64>;

    /// Highest sequence that has been trimmed away. Events after it are
    /// still retained.
    fn trim_horizon(&self, shard: u16) -> Result<u64>;
}
