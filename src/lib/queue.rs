use std::{
    fs,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::QueueConfig,
    error::{PipelineError, Result},
    keys::{key_with_segments, prefix_with_segments},
    model::SummaryDelta,
    observability::{record_queue_event, set_queue_depth},
};

const PREFIX_MSG: &str = "msg";
const PREFIX_STATUS: &str = "status";
const RECEIVE_POLL_STEP: Duration = Duration::from_millis(25);

pub type MessageId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    InFlight,
    Dead,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::InFlight => "in_flight",
            MessageStatus::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: MessageId,
    pub body: SummaryDelta,
    pub status: MessageStatus,
    pub receive_count: u32,
    /// Milliseconds since the epoch after which the message may be received.
    pub visible_at: i64,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Proof of one particular receive. Only the most recent receive of a
/// message may acknowledge or release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptHandle {
    pub id: MessageId,
    pub receive_count: u32,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub handle: ReceiptHandle,
}

#[derive(Debug, Default)]
pub struct QueueStatus {
    pub pending: Vec<QueueMessage>,
    pub in_flight: Vec<QueueMessage>,
    pub dead: Vec<QueueMessage>,
}

impl QueueStatus {
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }
}

/// Durable at-least-once queue of summary deltas with visibility timeouts
/// and a dead-letter state.
pub struct DeltaQueue {
    db: DBWithThreadMode<MultiThreaded>,
    name: String,
    claim_lock: Mutex<()>,
    visibility_timeout_ms: i64,
    delivery_delay_ms: i64,
    max_receive_count: u32,
    retry_backoff_ms: i64,
}

impl DeltaQueue {
    pub fn open(path: &Path, config: &QueueConfig) -> Result<Self> {
        fs::create_dir_all(path).map_err(|err| {
            PipelineError::Storage(format!(
                "failed to create queue directory {}: {}",
                path.display(),
                err
            ))
        })?;

        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path).map_err(|err| {
            PipelineError::Storage(format!(
                "failed to open queue store at {}: {}",
                path.display(),
                err
            ))
        })?;

        Ok(Self {
            db,
            name: config.name.clone(),
            claim_lock: Mutex::new(()),
            visibility_timeout_ms: config.visibility_timeout_ms as i64,
            delivery_delay_ms: config.delivery_delay_ms as i64,
            max_receive_count: config.max_receive_count.max(1),
            retry_backoff_ms: config.retry_backoff_ms as i64,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Durably stores the delta. The returned id is the send acknowledgement.
    pub fn enqueue(&self, delta: &SummaryDelta) -> Result<MessageId> {
        let now = Utc::now();
        let message = QueueMessage {
            id: Uuid::now_v7(),
            body: delta.clone(),
            status: MessageStatus::Pending,
            receive_count: 0,
            visible_at: now.timestamp_millis() + self.delivery_delay_ms,
            created_at: now,
            last_error: None,
        };

        let mut batch = WriteBatch::default();
        batch.put(message_key(&message.id), serde_json::to_vec(&message)?);
        batch.put(status_key(MessageStatus::Pending, &message.id), b"");
        self.db.write(batch)?;

        record_queue_event(&self.name, "enqueued");
        debug!(
            target: "streamcqrs.queue",
            queue = %self.name,
            id = %message.id,
            token = %delta.token,
            "enqueued summary delta"
        );
        Ok(message.id)
    }

    /// Waits up to `max_wait` for a visible message.
    pub fn receive(&self, max_wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(delivery) = self.try_receive(Utc::now().timestamp_millis())? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(RECEIVE_POLL_STEP.min(deadline - now));
        }
    }

    /// Claims the oldest message visible at `now`, if any. Messages whose
    /// visibility timeout lapsed are redelivered; messages that already used
    /// their receive budget are moved to the dead-letter state instead.
    pub fn try_receive(&self, now: i64) -> Result<Option<Delivery>> {
        let _guard = self.claim_lock.lock();
        for status in [MessageStatus::InFlight, MessageStatus::Pending] {
            let prefix = status_prefix(status);
            let iter = self
                .db
                .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
            for entry in iter {
                let (key, _) = entry?;
                if !key.starts_with(prefix.as_slice()) {
                    break;
                }
                let Some(id) = parse_message_id(&key[prefix.len()..]) else {
                    continue;
                };
                let Some(mut message) = self.load(&id)? else {
                    self.db.delete(&key)?;
                    continue;
                };
                if message.status != status || message.visible_at > now {
                    continue;
                }

                if message.receive_count >= self.max_receive_count {
                    let reason = match status {
                        MessageStatus::InFlight => "visibility timeout lapsed",
                        _ => "receive budget exhausted",
                    };
                    message.last_error.get_or_insert_with(|| reason.to_string());
                    self.transition(message, status, MessageStatus::Dead)?;
                    continue;
                }

                if status == MessageStatus::InFlight {
                    record_queue_event(&self.name, "redelivered");
                    warn!(
                        target: "streamcqrs.queue",
                        queue = %self.name,
                        id = %message.id,
                        receive_count = message.receive_count,
                        "visibility timeout lapsed; redelivering"
                    );
                }
                message.receive_count += 1;
                message.visible_at = now + self.visibility_timeout_ms;
                let message = self.transition(message, status, MessageStatus::InFlight)?;
                record_queue_event(&self.name, "received");
                let handle = ReceiptHandle {
                    id: message.id,
                    receive_count: message.receive_count,
                };
                return Ok(Some(Delivery { message, handle }));
            }
        }
        Ok(None)
    }

    /// Deletes the message. Returns `false` for a stale handle.
    pub fn acknowledge(&self, handle: &ReceiptHandle) -> Result<bool> {
        let _guard = self.claim_lock.lock();
        let Some(message) = self.load_current(handle)? else {
            record_queue_event(&self.name, "stale_ack");
            return Ok(false);
        };
        let mut batch = WriteBatch::default();
        batch.delete(message_key(&message.id));
        batch.delete(status_key(message.status, &message.id));
        self.db.write(batch)?;
        record_queue_event(&self.name, "acknowledged");
        Ok(true)
    }

    /// Returns the message to the queue after a backoff, or dead-letters it
    /// once the receive budget is spent.
    pub fn release(&self, handle: &ReceiptHandle, error: &str) -> Result<bool> {
        self.release_at(handle, error, Utc::now().timestamp_millis())
    }

    pub fn release_at(&self, handle: &ReceiptHandle, error: &str, now: i64) -> Result<bool> {
        let _guard = self.claim_lock.lock();
        let Some(mut message) = self.load_current(handle)? else {
            return Ok(false);
        };
        message.last_error = Some(error.to_string());
        if message.receive_count >= self.max_receive_count {
            self.transition(message, MessageStatus::InFlight, MessageStatus::Dead)?;
        } else {
            message.visible_at = now + self.backoff_delay(message.receive_count);
            self.transition(message, MessageStatus::InFlight, MessageStatus::Pending)?;
            record_queue_event(&self.name, "released");
        }
        Ok(true)
    }

    /// Moves the message straight to the dead-letter state.
    pub fn dead_letter(&self, handle: &ReceiptHandle, error: &str) -> Result<bool> {
        let _guard = self.claim_lock.lock();
        let Some(mut message) = self.load_current(handle)? else {
            return Ok(false);
        };
        message.last_error = Some(error.to_string());
        self.transition(message, MessageStatus::InFlight, MessageStatus::Dead)?;
        Ok(true)
    }

    pub fn status(&self) -> Result<QueueStatus> {
        let status = QueueStatus {
            pending: self.collect(MessageStatus::Pending)?,
            in_flight: self.collect(MessageStatus::InFlight)?,
            dead: self.collect(MessageStatus::Dead)?,
        };
        set_queue_depth(&self.name, "pending", status.pending.len());
        set_queue_depth(&self.name, "in_flight", status.in_flight.len());
        set_queue_depth(&self.name, "dead", status.dead.len());
        Ok(status)
    }

    pub fn retry_dead(&self, id: &MessageId) -> Result<QueueMessage> {
        let _guard = self.claim_lock.lock();
        let mut message = self
            .load(id)?
            .ok_or_else(|| PipelineError::InvalidRequest(format!("message {} not found", id)))?;
        if message.status != MessageStatus::Dead {
            return Err(PipelineError::InvalidRequest(format!("message {} is not dead", id)));
        }
        message.receive_count = 0;
        message.visible_at = Utc::now().timestamp_millis();
        self.transition(message, MessageStatus::Dead, MessageStatus::Pending)
    }

    pub fn clear_dead(&self) -> Result<usize> {
        let _guard = self.claim_lock.lock();
        let prefix = status_prefix(MessageStatus::Dead);
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
            if let Some(id) = parse_message_id(&key[prefix.len()..]) {
                batch.delete(message_key(&id));
            }
            batch.delete(&key);
            removed += 1;
        }
        if removed > 0 {
            self.db.write(batch)?;
        }
        Ok(removed)
    }

    pub fn load(&self, id: &MessageId) -> Result<Option<QueueMessage>> {
        match self.db.get(message_key(id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn load_current(&self, handle: &ReceiptHandle) -> Result<Option<QueueMessage>> {
        Ok(self.load(&handle.id)?.filter(|message| {
            message.status == MessageStatus::InFlight
                && message.receive_count == handle.receive_count
        }))
    }

    fn collect(&self, status: MessageStatus) -> Result<Vec<QueueMessage>> {
        let prefix = status_prefix(status);
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
        let mut messages = Vec::new();
        for entry in iter {
            let (key, _) = entry?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            let Some(id) = parse_message_id(&key[prefix.len()..]) else {
                continue;
            };
            if let Some(message) = self.load(&id)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn transition(
        &self,
        mut message: QueueMessage,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<QueueMessage> {
        message.status = to;
        let mut batch = WriteBatch::default();
        batch.put(message_key(&message.id), serde_json::to_vec(&message)?);
        batch.delete(status_key(from, &message.id));
        batch.put(status_key(to, &message.id), b"");
        self.db.write(batch)?;

        if to == MessageStatus::Dead {
            record_queue_event(&self.name, "dead_lettered");
            warn!(
                target: "streamcqrs.queue",
                queue = %self.name,
                id = %message.id,
                token = %message.body.token,
                receive_count = message.receive_count,
                error = message.last_error.as_deref().unwrap_or(""),
                "message moved to dead-letter state"
            );
        }
        Ok(message)
    }

    fn backoff_delay(&self, receive_count: u32) -> i64 {
        let exponent = receive_count.saturating_sub(1).min(3);
        (self.retry_backoff_ms << exponent).min(self.retry_backoff_ms * 10)
    }
}

fn message_key(id: &MessageId) -> Vec<u8> {
    key_with_segments(&[PREFIX_MSG, &id.to_string()])
}

fn status_key(status: MessageStatus, id: &MessageId) -> Vec<u8> {
    key_with_segments(&[PREFIX_STATUS, status.as_str(), &id.to_string()])
}

fn status_prefix(status: MessageStatus) -> Vec<u8> {
    prefix_with_segments(&[PREFIX_STATUS, status.as_str()])
}

fn parse_message_id(raw: &[u8]) -> Option<MessageId> {
    std::str::from_utf8(raw).ok().and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Adjustment, DedupToken};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open_queue(tmp: &TempDir, config: QueueConfig) -> Result<DeltaQueue> {
        DeltaQueue::open(&tmp.path().join("queue"), &config)
    }

    fn delta(vendor: &str) -> SummaryDelta {
        SummaryDelta {
            identity: "A1".into(),
            token: DedupToken::new("A1", vendor),
            adjustments: BTreeMap::from([("order_count".into(), Adjustment::Add(dec!(1)))]),
        }
    }

    #[test]
    fn acknowledged_messages_are_removed() -> Result<()> {
        let tmp = TempDir::new()?;
        let queue = open_queue(&tmp, QueueConfig::default())?;
        let id = queue.enqueue(&delta("V1"))?;

        let delivery = queue.receive(Duration::ZERO)?.expect("visible message");
        assert_eq!(delivery.message.id, id);
        assert_eq!(delivery.handle.receive_count, 1);
        assert!(queue.receive(Duration::ZERO)?.is_none());

        assert!(queue.acknowledge(&delivery.handle)?);
        assert!(queue.load(&id)?.is_none());
        assert!(!queue.acknowledge(&delivery.handle)?);
        Ok(())
    }

    #[test]
    fn lapsed_visibility_redelivers_and_stales_old_handle() -> Result<()> {
        let tmp = TempDir::new()?;
        let queue = open_queue(&tmp, QueueConfig::default())?;
        queue.enqueue(&delta("V1"))?;

        let now = Utc::now().timestamp_millis();
        let first = queue.try_receive(now)?.expect("first delivery");
        assert!(queue.try_receive(now + 1_000)?.is_none());

        let second = queue.try_receive(now + 30_001)?.expect("redelivery");
        assert_eq!(second.handle.receive_count, 2);
        assert!(!queue.acknowledge(&first.handle)?);
        assert!(queue.acknowledge(&second.handle)?);
        Ok(())
    }

    #[test]
    fn delivery_delay_hides_new_messages() -> Result<()> {
        let tmp = TempDir::new()?;
        let config = QueueConfig {
            delivery_delay_ms: 10_000,
            ..QueueConfig::default()
        };
        let queue = open_queue(&tmp, config)?;
        queue.enqueue(&delta("V1"))?;

        let now = Utc::now().timestamp_millis();
        assert!(queue.try_receive(now)?.is_none());
        assert!(queue.try_receive(now + 10_500)?.is_some());
        Ok(())
    }

    #[test]
    fn exhausted_receives_move_to_dead_letter() -> Result<()> {
        let tmp = TempDir::new()?;
        let config = QueueConfig {
            max_receive_count: 2,
            retry_backoff_ms: 0,
            ..QueueConfig::default()
        };
        let queue = open_queue(&tmp, config)?;
        let id = queue.enqueue(&delta("V1"))?;

        let now = Utc::now().timestamp_millis();
        let first = queue.try_receive(now)?.expect("first");
        assert!(queue.release_at(&first.handle, "throttled", now)?);
        let second = queue.try_receive(now)?.expect("second");
        assert!(queue.release_at(&second.handle, "throttled", now)?);
        assert!(queue.try_receive(now)?.is_none());

        let status = queue.status()?;
        assert_eq!(status.dead.len(), 1);
        assert_eq!(status.outstanding(), 0);
        assert_eq!(status.dead[0].last_error.as_deref(), Some("throttled"));

        let retried = queue.retry_dead(&id)?;
        assert_eq!(retried.status, MessageStatus::Pending);
        assert!(queue.try_receive(Utc::now().timestamp_millis())?.is_some());
        Ok(())
    }

    #[test]
    fn clear_dead_removes_dead_letters_only() -> Result<()> {
        let tmp = TempDir::new()?;
        let queue = open_queue(&tmp, QueueConfig::default())?;
        queue.enqueue(&delta("V1"))?;
        queue.enqueue(&delta("V2"))?;

        let delivery = queue.receive(Duration::ZERO)?.expect("delivery");
        assert!(queue.dead_letter(&delivery.handle, "integrity violation")?);
        assert!(queue.retry_dead(&queue.status()?.pending[0].id).is_err());

        assert_eq!(queue.clear_dead()?, 1);
        let status = queue.status()?;
        assert!(status.dead.is_empty());
        assert_eq!(status.pending.len(), 1);
        Ok(())
    }
}
