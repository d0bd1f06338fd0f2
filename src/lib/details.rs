use std::{path::Path, time::Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    error::{PipelineError, Result},
    feed::{ChangeFeed, Cursor, FeedBatch},
    keys::{check_segment, key_with_segments, key_with_u64, prefix_with_segments, shard_segment},
    model::{ATTR_ACCOUNT_ID, ATTR_VENDOR_ID, AttributeValue, ChangeEvent, Item},
    observability::{record_feed_append, record_store_op},
};

const PREFIX_ITEM: &str = "item";
const PREFIX_FEED: &str = "feed";
const PREFIX_META: &str = "meta";

/// Write-optimized order store. Every accepted item is appended to its
/// shard's change feed in the same write batch, so the feed never misses or
/// invents a write.
pub struct DetailStore {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Mutex<()>,
    shard_count: u16,
}

impl DetailStore {
    pub fn open(path: &Path, shard_count: u16) -> Result<Self> {
        if shard_count == 0 {
            return Err(PipelineError::Config("shard_count must be at least 1".into()));
        }
        std::fs::create_dir_all(path)?;

        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path).map_err(|err| {
            PipelineError::Storage(format!(
                "failed to open details store at {}: {}",
                path.display(),
                err
            ))
        })?;

        let shards_key = key_with_segments(&[PREFIX_META, "shards"]);
        match db.get(&shards_key)? {
            Some(raw) => {
                let stored: u16 = serde_json::from_slice(&raw)?;
                if stored != shard_count {
                    return Err(PipelineError::Config(format!(
                        "details store at {} was created with {} shards, configured {}",
                        path.display(),
                        stored,
                        shard_count
                    )));
                }
            }
            None => db.put(&shards_key, serde_json::to_vec(&shard_count)?)?,
        }

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            shard_count,
        })
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    pub fn shard_for(&self, partition_key: &str) -> u16 {
        shard_for(partition_key, self.shard_count)
    }

    /// Stores a new item and appends its change event. A key that already
    /// exists is rejected; records are immutable once written.
    pub fn put_item(&self, item: Item) -> Result<ChangeEvent> {
        let start = Instant::now();
        let result = self.put_item_inner(item);
        record_store_op(
            "details_put",
            if result.is_ok() { "ok" } else { "err" },
            start.elapsed().as_secs_f64(),
        );
        result
    }

    fn put_item_inner(&self, item: Item) -> Result<ChangeEvent> {
        let partition_key = key_attribute(&item, ATTR_ACCOUNT_ID)?;
        let sort_key = key_attribute(&item, ATTR_VENDOR_ID)?;
        let shard = self.shard_for(&partition_key);
        let item_key = key_with_segments(&[PREFIX_ITEM, &partition_key, &sort_key]);

        let _guard = self.write_lock.lock();
        if self.db.get(&item_key)?.is_some() {
            return Err(PipelineError::RecordExists(format!(
                "{partition_key}#{sort_key}"
            )));
        }

        let sequence = self.latest_sequence(shard)? + 1;
        let event = ChangeEvent {
            shard,
            sequence,
            partition_key,
            sort_key,
            image: item,
            written_at: Utc::now(),
        };

        let mut batch = WriteBatch::default();
        batch.put(&item_key, serde_json::to_vec(&event.image)?);
        batch.put(feed_key(shard, sequence), serde_json::to_vec(&event)?);
        batch.put(sequence_key(shard), sequence.to_be_bytes());
        self.db.write(batch)?;

        record_feed_append(shard);
        debug!(
            target: "streamcqrs.details",
            shard,
            sequence,
            token = %event.token(),
            "appended change event"
        );
        Ok(event)
    }

    pub fn get_item(&self, partition_key: &str, sort_key: &str) -> Result<Option<Item>> {
        let key = key_with_segments(&[PREFIX_ITEM, partition_key, sort_key]);
        match self.db.get(&key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every stored item of one partition, in sort key order.
    pub fn items_for_partition(&self, partition_key: &str) -> Result<Vec<Item>> {
        let start = Instant::now();
        let result: Result<Vec<Item>> = (|| {
            let prefix = prefix_with_segments(&[PREFIX_ITEM, partition_key]);
            let iter = self
                .db
                .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
            let mut items = Vec::new();
            for entry in iter {
                let (key, value) = entry?;
                if !key.starts_with(prefix.as_slice()) {
                    break;
                }
                items.push(serde_json::from_slice(&value)?);
            }
            Ok(items)
        })();
        record_store_op(
            "details_iter_partition",
            if result.is_ok() { "ok" } else { "err" },
            start.elapsed().as_secs_f64(),
        );
        result
    }

    /// Drops feed entries up to and including `through`. Returns the number
    /// of entries removed. Items themselves are never trimmed.
    pub fn trim_feed(&self, shard: u16, through: u64) -> Result<usize> {
        self.check_shard(shard)?;
        let _guard = self.write_lock.lock();
        let through = through.min(self.latest_sequence(shard)?);
        let horizon = self.read_u64(&horizon_key(shard))?;
        if through <= horizon {
            return Ok(0);
        }

        let start_key = feed_key(shard, horizon + 1);
        let prefix = feed_prefix(shard);
        let iter = self
            .db
            .iterator(IteratorMode::From(start_key.as_slice(), Direction::Forward));
        let mut batch = WriteBatch::default();
        let mut removed = 0usize;
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            let event: ChangeEvent = serde_json::from_slice(&value)?;
            if event.sequence > through {
                break;
            }
            batch.delete(key);
            removed += 1;
        }
        batch.put(horizon_key(shard), through.to_be_bytes());
        self.db.write(batch)?;
        debug!(target: "streamcqrs.details", shard, through, removed, "trimmed change feed");
        Ok(removed)
    }

    fn latest_sequence(&self, shard: u16) -> Result<u64> {
        self.read_u64(&sequence_key(shard))
    }

    fn read_u64(&self, key: &[u8]) -> Result<u64> {
        match self.db.get(key)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    PipelineError::Storage("corrupt counter in details store".into())
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn check_shard(&self, shard: u16) -> Result<()> {
        if shard >= self.shard_count {
            return Err(PipelineError::InvalidCursor(format!(
                "shard {} does not exist (shard count {})",
                shard, self.shard_count
            )));
        }
        Ok(())
    }
}

impl ChangeFeed for DetailStore {
    fn shards(&self) -> Vec<u16> {
        (0..self.shard_count).collect()
    }

    fn get_batch(&self, cursor: &Cursor, max: usize) -> Result<FeedBatch> {
        self.check_shard(cursor.shard)?;
        let start = Instant::now();
        let result: Result<FeedBatch> = (|| {
            let latest = self.latest_sequence(cursor.shard)?;
            if cursor.position > latest {
                return Err(PipelineError::InvalidCursor(format!(
                    "cursor {} is past the end of shard {} ({})",
                    cursor.position, cursor.shard, latest
                )));
            }

            let horizon = self.trim_horizon(cursor.shard)?;
            let mut position = cursor.position;
            if position < horizon {
                warn!(
                    target: "streamcqrs.details",
                    shard = cursor.shard,
                    requested = position,
                    horizon,
                    "cursor is behind the trim horizon; trimmed events were skipped"
                );
                position = horizon;
            }

            let start_key = feed_key(cursor.shard, position + 1);
            let prefix = feed_prefix(cursor.shard);
            let iter = self
                .db
                .iterator(IteratorMode::From(start_key.as_slice(), Direction::Forward));
            let mut events = Vec::new();
            for entry in iter {
                if events.len() >= max {
                    break;
                }
                let (key, value) = entry?;
                if !key.starts_with(prefix.as_slice()) {
                    break;
                }
                let event: ChangeEvent = serde_json::from_slice(&value)?;
                events.push(event);
            }

            let next_position = events.last().map(|event| event.sequence).unwrap_or(position);
            Ok(FeedBatch {
                events,
                next_cursor: Cursor::new(cursor.shard, next_position),
            })
        })();
        record_store_op(
            "feed_get_batch",
            if result.is_ok() { "ok" } else { "err" },
            start.elapsed().as_secs_f64(),
        );
        result
    }

    fn latest_position(&self, shard: u16) -> Result<u64> {
        self.check_shard(shard)?;
        self.latest_sequence(shard)
    }

    fn trim_horizon(&self, shard: u16) -> Result<u64> {
        self.check_shard(shard)?;
        self.read_u64(&horizon_key(shard))
    }
}

pub fn shard_for(partition_key: &str, shard_count: u16) -> u16 {
    let digest = Sha256::digest(partition_key.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(buf) % u64::from(shard_count.max(1))) as u16
}

fn key_attribute(item: &Item, name: &str) -> Result<String> {
    match item.get(name) {
        Some(AttributeValue::S(value)) if !value.is_empty() => {
            check_segment(name, value)?;
            Ok(value.clone())
        }
        _ => Err(PipelineError::InvalidRequest(format!(
            "item is missing string key attribute '{name}'"
        ))),
    }
}

fn feed_prefix(shard: u16) -> Vec<u8> {
    prefix_with_segments(&[PREFIX_FEED, &shard_segment(shard)])
}

fn feed_key(shard: u16, sequence: u64) -> Vec<u8> {
    key_with_u64(&[PREFIX_FEED, &shard_segment(shard)], sequence)
}

fn sequence_key(shard: u16) -> Vec<u8> {
    key_with_segments(&[PREFIX_META, "seq", &shard_segment(shard)])
}

fn horizon_key(shard: u16) -> Vec<u8> {
    key_with_segments(&[PREFIX_META, "horizon", &shard_segment(shard)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ATTR_QUANTITY, ATTR_UNIT_PRICE};
    use tempfile::TempDir;

    fn item(account: &str, vendor: &str) -> Item {
        let mut item = Item::new();
        item.insert(ATTR_ACCOUNT_ID.into(), AttributeValue::S(account.into()));
        item.insert(ATTR_VENDOR_ID.into(), AttributeValue::S(vendor.into()));
        item.insert(ATTR_UNIT_PRICE.into(), AttributeValue::N("1".into()));
        item.insert(ATTR_QUANTITY.into(), AttributeValue::N("1".into()));
        item
    }

    #[test]
    fn appends_feed_entries_in_sequence() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = DetailStore::open(&tmp.path().join("details"), 1)?;

        let first = store.put_item(item("A1", "V1"))?;
        let second = store.put_item(item("A2", "V1"))?;
        assert_eq!((first.sequence, second.sequence), (1, 2));

        let batch = store.get_batch(&Cursor::origin(0), 5)?;
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.next_cursor, Cursor::new(0, 2));
        assert_eq!(batch.events[0].token().as_str(), "A1#V1");

        let empty = store.get_batch(&batch.next_cursor, 5)?;
        assert!(empty.is_empty());
        assert_eq!(empty.next_cursor, Cursor::new(0, 2));
        Ok(())
    }

    #[test]
    fn rejects_second_write_to_same_key() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = DetailStore::open(&tmp.path().join("details"), 2)?;
        store.put_item(item("A1", "V1"))?;
        let err = store.put_item(item("A1", "V1")).unwrap_err();
        assert!(matches!(err, PipelineError::RecordExists(_)));

        let shard = store.shard_for("A1");
        assert_eq!(store.latest_position(shard)?, 1);
        Ok(())
    }

    #[test]
    fn key_attributes_with_separator_cannot_collide() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = DetailStore::open(&tmp.path().join("details"), 1)?;

        let err = store.put_item(item("A1\u{1f}x", "V")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)), "{err}");
        let err = store.put_item(item("A1", "x\u{1f}V")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)), "{err}");

        store.put_item(item("A1", "xV"))?;
        assert_eq!(store.items_for_partition("A1")?.len(), 1);
        assert_eq!(store.latest_position(0)?, 1);
        Ok(())
    }

    #[test]
    fn partitions_stick_to_one_shard() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = DetailStore::open(&tmp.path().join("details"), 4)?;
        for vendor in ["V1", "V2", "V3"] {
            let event = store.put_item(item("A7", vendor))?;
            assert_eq!(event.shard, store.shard_for("A7"));
        }
        assert_eq!(store.items_for_partition("A7")?.len(), 3);
        assert!(store.items_for_partition("A")?.is_empty());
        Ok(())
    }

    #[test]
    fn trimmed_cursor_is_clamped_to_horizon() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = DetailStore::open(&tmp.path().join("details"), 1)?;
        for vendor in ["V1", "V2", "V3"] {
            store.put_item(item("A1", vendor))?;
        }

        assert_eq!(store.trim_feed(0, 2)?, 2);
        assert_eq!(store.trim_horizon(0)?, 2);
        assert_eq!(store.trim_feed(0, 1)?, 0);

        let batch = store.get_batch(&Cursor::origin(0), 5)?;
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].sequence, 3);
        assert!(store.get_item("A1", "V1")?.is_some());
        Ok(())
    }

    #[test]
    fn rejects_cursor_past_end_and_unknown_shard() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = DetailStore::open(&tmp.path().join("details"), 1)?;
        assert!(matches!(
            store.get_batch(&Cursor::new(0, 3), 5),
            Err(PipelineError::InvalidCursor(_))
        ));
        assert!(matches!(
            store.get_batch(&Cursor::origin(1), 5),
            Err(PipelineError::InvalidCursor(_))
        ));
        Ok(())
    }

    #[test]
    fn reopening_with_other_shard_count_fails() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("details");
        drop(DetailStore::open(&path, 2)?);
        assert!(matches!(
            DetailStore::open(&path, 3),
            Err(PipelineError::Config(_))
        ));
        Ok(())
    }
}
