use std::{sync::Arc, thread, time::Duration};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    aggregator::Aggregator,
    checkpoint::{DispatcherState, FailureId, ParkedFailure},
    config::{DispatcherConfig, StartingPosition},
    error::{PipelineError, Result},
    feed::{ChangeFeed, Cursor},
    model::ChangeEvent,
    observability::record_dispatch_batch,
    sink::DeltaSink,
};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    CaughtUp,
    Processed {
        delivered: usize,
        parked: usize,
        cursor: Cursor,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedriveOutcome {
    pub delivered: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct Resolution {
    delivered: usize,
    parked: usize,
}

/// Pulls change feed batches shard by shard, runs them through the
/// aggregator and sink, and only moves a shard's checkpoint once every
/// event of the batch was either delivered or parked.
pub struct ChangeDispatcher {
    feed: Arc<dyn ChangeFeed>,
    aggregator: Arc<dyn Aggregator>,
    sink: Arc<dyn DeltaSink>,
    state: Arc<DispatcherState>,
    config: DispatcherConfig,
}

impl ChangeDispatcher {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        aggregator: Arc<dyn Aggregator>,
        sink: Arc<dyn DeltaSink>,
        state: Arc<DispatcherState>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            feed,
            aggregator,
            sink,
            state,
            config,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.config.consumer
    }

    pub fn shards(&self) -> Vec<u16> {
        self.feed.shards()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    /// Durable cursor for `shard`. Without a checkpoint the starting policy
    /// decides, and the result is persisted so `latest` is pinned once.
    pub fn cursor(&self, shard: u16) -> Result<Cursor> {
        if let Some(cursor) = self.state.load_checkpoint(&self.config.consumer, shard)? {
            return Ok(cursor);
        }
        let position = match self.config.starting_position {
            StartingPosition::TrimHorizon => self.feed.trim_horizon(shard)?,
            StartingPosition::Latest => self.feed.latest_position(shard)?,
        };
        let cursor = Cursor::new(shard, position);
        self.state.store_checkpoint(&self.config.consumer, &cursor)?;
        info!(
            target: "streamcqrs.dispatcher",
            consumer = %self.config.consumer,
            shard,
            position,
            "initialised shard checkpoint"
        );
        Ok(cursor)
    }

    /// Moves a shard's checkpoint back so already processed events are
    /// delivered again. Safe because every apply is idempotent per token.
    /// Trimmed events cannot be delivered again, so a target behind the trim
    /// horizon is raised to it unless the shard still lags behind the horizon.
    pub fn rewind(&self, cursor: Cursor) -> Result<()> {
        let latest = self.feed.latest_position(cursor.shard)?;
        if cursor.position > latest {
            return Err(PipelineError::InvalidCursor(format!(
                "cannot rewind shard {} to {}, latest is {}",
                cursor.shard, cursor.position, latest
            )));
        }
        let current = self.cursor(cursor.shard)?;
        let horizon = self.feed.trim_horizon(cursor.shard)?;
        let cursor = Cursor::new(
            cursor.shard,
            cursor.position.max(horizon.min(current.position)),
        );
        self.state.store_checkpoint(&self.config.consumer, &cursor)?;
        warn!(
            target: "streamcqrs.dispatcher",
            consumer = %self.config.consumer,
            shard = cursor.shard,
            position = cursor.position,
            "checkpoint rewound"
        );
        Ok(())
    }

    pub fn poll_shard(&self, shard: u16) -> Result<PollOutcome> {
        let cursor = self.cursor(shard)?;
        let horizon = self.feed.trim_horizon(shard)?;
        if cursor.position < horizon {
            return self.park_trimmed_gap(cursor, horizon);
        }
        let batch = self.feed.get_batch(&cursor, self.config.batch_size)?;
        if batch.is_empty() {
            if batch.next_cursor != cursor {
                self.state
                    .store_checkpoint(&self.config.consumer, &batch.next_cursor)?;
            }
            return Ok(PollOutcome::CaughtUp);
        }

        let mut resolution = Resolution::default();
        self.resolve(&batch.events, self.config.retry_attempts, &mut resolution)?;
        self.state
            .store_checkpoint(&self.config.consumer, &batch.next_cursor)?;
        record_dispatch_batch(shard, batch.events.len(), resolution.parked);
        debug!(
            target: "streamcqrs.dispatcher",
            shard,
            position = batch.next_cursor.position,
            delivered = resolution.delivered,
            parked = resolution.parked,
            "batch resolved"
        );

        Ok(PollOutcome::Processed {
            delivered: resolution.delivered,
            parked: resolution.parked,
            cursor: batch.next_cursor,
        })
    }

    /// Processes `events` with what is left of the retry budget. A failed
    /// attempt always costs one unit; a multi-event batch is then split and
    /// each half resolved on its own, first half first.
    fn resolve(
        &self,
        events: &[ChangeEvent],
        mut budget: u32,
        resolution: &mut Resolution,
    ) -> Result<()> {
        let mut consumed = 0u32;
        loop {
            let err = match self.attempt(events) {
                Ok(()) => {
                    resolution.delivered += events.len();
                    return Ok(());
                }
                Err(err) => err,
            };
            budget = budget.saturating_sub(1);
            consumed += 1;

            if budget == 0 {
                self.park(events, &err)?;
                resolution.parked += events.len();
                return Ok(());
            }

            warn!(
                target: "streamcqrs.dispatcher",
                shard = events[0].shard,
                first = events[0].sequence,
                len = events.len(),
                budget,
                "sub-batch failed: {err}"
            );
            if err.is_transient() {
                thread::sleep(self.backoff(consumed));
            }
            if events.len() > 1 {
                let (head, tail) = events.split_at(events.len() / 2);
                self.resolve(head, budget, resolution)?;
                return self.resolve(tail, budget, resolution);
            }
        }
    }

    fn attempt(&self, events: &[ChangeEvent]) -> Result<()> {
        for event in events {
            self.deliver_event(event)?;
        }
        Ok(())
    }

    fn deliver_event(&self, event: &ChangeEvent) -> Result<()> {
        for delta in self.aggregator.aggregate(event)? {
            self.sink.deliver(&delta)?;
        }
        Ok(())
    }

    fn park(&self, events: &[ChangeEvent], err: &PipelineError) -> Result<()> {
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Ok(());
        };
        let failure = ParkedFailure {
            id: FailureId {
                shard: first.shard,
                first_sequence: first.sequence,
                last_sequence: last.sequence,
            },
            consumer: self.config.consumer.clone(),
            events: events.to_vec(),
            attempts: self.config.retry_attempts,
            last_error: err.to_string(),
            parked_at: Utc::now(),
        };
        self.state.park(&failure)?;
        error!(
            target: "streamcqrs.dispatcher",
            failure = %failure.id,
            aggregator = self.aggregator.name(),
            sink = self.sink.name(),
            events = events.len(),
            "retry budget exhausted; sub-batch parked: {err}"
        );
        Ok(())
    }

    /// Events between the checkpoint and the horizon were trimmed before
    /// this consumer saw them. The range is parked without events so the
    /// loss shows up in the failure channel, then the cursor moves on.
    fn park_trimmed_gap(&self, cursor: Cursor, horizon: u64) -> Result<PollOutcome> {
        let failure = ParkedFailure {
            id: FailureId {
                shard: cursor.shard,
                first_sequence: cursor.position + 1,
                last_sequence: horizon,
            },
            consumer: self.config.consumer.clone(),
            events: Vec::new(),
            attempts: 0,
            last_error: format!(
                "events {}..={} were trimmed before delivery",
                cursor.position + 1,
                horizon
            ),
            parked_at: Utc::now(),
        };
        self.state.park(&failure)?;
        let next = Cursor::new(cursor.shard, horizon);
        self.state.store_checkpoint(&self.config.consumer, &next)?;

        let skipped = usize::try_from(horizon - cursor.position).unwrap_or(usize::MAX);
        record_dispatch_batch(cursor.shard, 0, skipped);
        error!(
            target: "streamcqrs.dispatcher",
            failure = %failure.id,
            consumer = %self.config.consumer,
            skipped,
            "checkpoint fell behind the trim horizon; gap parked, reconcile affected accounts"
        );
        Ok(PollOutcome::Processed {
            delivered: 0,
            parked: skipped,
            cursor: next,
        })
    }

    fn backoff(&self, consumed: u32) -> Duration {
        let base = Duration::from_millis(self.config.backoff_base_ms);
        (base * 2u32.pow(consumed.saturating_sub(1).min(10))).min(MAX_BACKOFF)
    }

    pub fn failures(&self) -> Result<Vec<ParkedFailure>> {
        self.state.failures()
    }

    /// Runs a parked sub-batch through the pipeline again, event by event.
    /// Events that still fail stay parked under a narrowed id.
    pub fn redrive(&self, id: &FailureId) -> Result<RedriveOutcome> {
        let failure = self
            .state
            .failure(id)?
            .ok_or_else(|| PipelineError::InvalidRequest(format!("no parked failure {id}")))?;
        if failure.is_trimmed_gap() {
            return Err(PipelineError::InvalidRequest(format!(
                "failure {id} covers trimmed events and cannot be redriven; \
                 reconcile the affected accounts, then clear it"
            )));
        }

        let mut outcome = RedriveOutcome::default();
        let mut remaining = Vec::new();
        let mut last_error = failure.last_error.clone();
        for event in &failure.events {
            match self.deliver_event(event) {
                Ok(()) => outcome.delivered += 1,
                Err(err) => {
                    last_error = err.to_string();
                    remaining.push(event.clone());
                }
            }
        }
        outcome.remaining = remaining.len();

        match (remaining.first(), remaining.last()) {
            (Some(first), Some(last)) => {
                let narrowed = ParkedFailure {
                    id: FailureId {
                        shard: failure.id.shard,
                        first_sequence: first.sequence,
                        last_sequence: last.sequence,
                    },
                    attempts: failure.attempts.saturating_add(1),
                    last_error,
                    parked_at: Utc::now(),
                    events: remaining.clone(),
                    consumer: failure.consumer,
                };
                self.state.replace_failure(id, &narrowed)?;
                warn!(
                    target: "streamcqrs.dispatcher",
                    failure = %narrowed.id,
                    remaining = outcome.remaining,
                    "redrive left events parked"
                );
            }
            _ => {
                self.state.remove_failure(id)?;
                info!(
                    target: "streamcqrs.dispatcher",
                    failure = %id,
                    delivered = outcome.delivered,
                    "redrive completed"
                );
            }
        }
        Ok(outcome)
    }

    pub fn clear_failures(&self) -> Result<usize> {
        self.state.clear_failures()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregator::OrderTotalsAggregator,
        details::DetailStore,
        model::{
            ATTR_ACCOUNT_ID, ATTR_QUANTITY, ATTR_UNIT_PRICE, ATTR_VENDOR_ID, AttributeValue, Item,
            SummaryDelta,
        },
    };
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<SummaryDelta>>,
        transient_failures: Mutex<u32>,
    }

    impl DeltaSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn deliver(&self, delta: &SummaryDelta) -> Result<()> {
            let mut failures = self.transient_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(PipelineError::Transient("throttled".into()));
            }
            self.delivered.lock().push(delta.clone());
            Ok(())
        }
    }

    fn item(account: &str, vendor: &str, price: &str) -> Item {
        let mut item = Item::new();
        item.insert(ATTR_ACCOUNT_ID.into(), AttributeValue::S(account.into()));
        item.insert(ATTR_VENDOR_ID.into(), AttributeValue::S(vendor.into()));
        item.insert(ATTR_UNIT_PRICE.into(), AttributeValue::N(price.into()));
        item.insert(ATTR_QUANTITY.into(), AttributeValue::N("1".into()));
        item
    }

    fn dispatcher(
        tmp: &TempDir,
        config: DispatcherConfig,
    ) -> Result<(Arc<DetailStore>, Arc<RecordingSink>, ChangeDispatcher)> {
        let details = Arc::new(DetailStore::open(&tmp.path().join("details"), 1)?);
        let sink = Arc::new(RecordingSink::default());
        let state = Arc::new(DispatcherState::open(&tmp.path().join("state"))?);
        let dispatcher = ChangeDispatcher::new(
            details.clone(),
            Arc::new(OrderTotalsAggregator),
            sink.clone(),
            state,
            config,
        );
        Ok((details, sink, dispatcher))
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            backoff_base_ms: 1,
            ..DispatcherConfig::default()
        }
    }

    #[test]
    fn poison_record_is_isolated_and_parked() -> Result<()> {
        let tmp = TempDir::new()?;
        let (details, sink, dispatcher) = dispatcher(&tmp, fast_config())?;
        for (vendor, price) in [("V1", "1"), ("V2", "2"), ("V3", "bad"), ("V4", "4"), ("V5", "5")] {
            details.put_item(item("A1", vendor, price))?;
        }

        let outcome = dispatcher.poll_shard(0)?;
        assert_eq!(
            outcome,
            PollOutcome::Processed {
                delivered: 4,
                parked: 1,
                cursor: Cursor::new(0, 5),
            }
        );

        let failures = dispatcher.failures()?;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id.to_string(), "0:3-3");
        assert!(failures[0].last_error.contains("A1#V3"));

        let tokens: std::collections::BTreeSet<_> = sink
            .delivered
            .lock()
            .iter()
            .map(|delta| delta.token.to_string())
            .collect();
        assert_eq!(tokens.len(), 4);
        assert!(!tokens.contains("A1#V3"));
        assert_eq!(dispatcher.poll_shard(0)?, PollOutcome::CaughtUp);
        Ok(())
    }

    #[test]
    fn overflowing_order_is_parked_while_neighbours_apply() -> Result<()> {
        let tmp = TempDir::new()?;
        let (details, sink, dispatcher) = dispatcher(&tmp, fast_config())?;
        details.put_item(item("A1", "V1", "1"))?;
        let mut huge = item("A1", "V2", "79228162514264337593543950335");
        huge.insert(ATTR_QUANTITY.into(), AttributeValue::N("2".into()));
        details.put_item(huge)?;
        details.put_item(item("A1", "V3", "3"))?;

        let outcome = dispatcher.poll_shard(0)?;
        assert_eq!(
            outcome,
            PollOutcome::Processed {
                delivered: 2,
                parked: 1,
                cursor: Cursor::new(0, 3),
            }
        );
        let failures = dispatcher.failures()?;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id.to_string(), "0:2-2");
        assert!(failures[0].last_error.contains("overflows"));
        let tokens: std::collections::BTreeSet<_> = sink
            .delivered
            .lock()
            .iter()
            .map(|delta| delta.token.to_string())
            .collect();
        assert_eq!(
            tokens,
            std::collections::BTreeSet::from(["A1#V1".to_string(), "A1#V3".to_string()])
        );
        Ok(())
    }

    #[test]
    fn lagging_checkpoint_behind_trim_parks_the_gap() -> Result<()> {
        let tmp = TempDir::new()?;
        let (details, sink, dispatcher) = dispatcher(&tmp, fast_config())?;
        for vendor in ["V1", "V2", "V3", "V4"] {
            details.put_item(item("A1", vendor, "1"))?;
        }
        assert_eq!(dispatcher.cursor(0)?, Cursor::origin(0));
        details.trim_feed(0, 3)?;

        assert_eq!(
            dispatcher.poll_shard(0)?,
            PollOutcome::Processed {
                delivered: 0,
                parked: 3,
                cursor: Cursor::new(0, 3),
            }
        );
        let failures = dispatcher.failures()?;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id.to_string(), "0:1-3");
        assert!(failures[0].is_trimmed_gap());
        assert!(matches!(
            dispatcher.redrive(&failures[0].id),
            Err(PipelineError::InvalidRequest(_))
        ));

        assert!(matches!(
            dispatcher.poll_shard(0)?,
            PollOutcome::Processed { delivered: 1, parked: 0, .. }
        ));
        assert_eq!(sink.delivered.lock()[0].token.as_str(), "A1#V4");
        assert_eq!(dispatcher.failures()?.len(), 1);
        Ok(())
    }

    #[test]
    fn rewind_behind_trim_stops_at_the_horizon() -> Result<()> {
        let tmp = TempDir::new()?;
        let (details, sink, dispatcher) = dispatcher(&tmp, fast_config())?;
        for vendor in ["V1", "V2", "V3"] {
            details.put_item(item("A1", vendor, "1"))?;
        }
        dispatcher.poll_shard(0)?;
        details.trim_feed(0, 2)?;

        dispatcher.rewind(Cursor::origin(0))?;
        assert_eq!(dispatcher.cursor(0)?, Cursor::new(0, 2));
        assert!(matches!(
            dispatcher.poll_shard(0)?,
            PollOutcome::Processed { delivered: 1, parked: 0, .. }
        ));
        assert!(dispatcher.failures()?.is_empty());
        assert_eq!(sink.delivered.lock().len(), 4);
        Ok(())
    }

    #[test]
    fn transient_failures_are_retried_without_parking() -> Result<()> {
        let tmp = TempDir::new()?;
        let (details, sink, dispatcher) = dispatcher(&tmp, fast_config())?;
        details.put_item(item("A1", "V1", "1"))?;
        details.put_item(item("A1", "V2", "2"))?;
        *sink.transient_failures.lock() = 3;

        let outcome = dispatcher.poll_shard(0)?;
        assert!(matches!(
            outcome,
            PollOutcome::Processed { delivered: 2, parked: 0, .. }
        ));
        assert!(dispatcher.failures()?.is_empty());
        Ok(())
    }

    #[test]
    fn latest_starting_position_skips_existing_records() -> Result<()> {
        let tmp = TempDir::new()?;
        let config = DispatcherConfig {
            starting_position: StartingPosition::Latest,
            ..fast_config()
        };
        let (details, sink, dispatcher) = dispatcher(&tmp, config)?;
        details.put_item(item("A1", "V1", "1"))?;

        assert_eq!(dispatcher.poll_shard(0)?, PollOutcome::CaughtUp);
        details.put_item(item("A1", "V2", "1"))?;
        assert!(matches!(
            dispatcher.poll_shard(0)?,
            PollOutcome::Processed { delivered: 1, .. }
        ));
        assert_eq!(sink.delivered.lock()[0].token.as_str(), "A1#V2");
        Ok(())
    }

    #[test]
    fn checkpoint_survives_restart() -> Result<()> {
        let tmp = TempDir::new()?;
        {
            let (details, _sink, dispatcher) = dispatcher(&tmp, fast_config())?;
            details.put_item(item("A1", "V1", "1"))?;
            dispatcher.poll_shard(0)?;
        }
        let (details, sink, dispatcher) = dispatcher(&tmp, fast_config())?;
        details.put_item(item("A1", "V2", "1"))?;
        dispatcher.poll_shard(0)?;
        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].token.as_str(), "A1#V2");
        Ok(())
    }

    #[test]
    fn redrive_removes_failure_once_it_succeeds() -> Result<()> {
        let tmp = TempDir::new()?;
        let config = DispatcherConfig {
            retry_attempts: 1,
            ..fast_config()
        };
        let (details, sink, dispatcher) = dispatcher(&tmp, config)?;
        details.put_item(item("A1", "V1", "1"))?;
        *sink.transient_failures.lock() = 1;

        let outcome = dispatcher.poll_shard(0)?;
        assert!(matches!(outcome, PollOutcome::Processed { parked: 1, .. }));
        let id = dispatcher.failures()?[0].id;

        let redrive = dispatcher.redrive(&id)?;
        assert_eq!(redrive, RedriveOutcome { delivered: 1, remaining: 0 });
        assert!(dispatcher.failures()?.is_empty());
        assert!(dispatcher.redrive(&id).is_err());
        Ok(())
    }
}
