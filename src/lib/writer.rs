use std::{sync::Arc, thread, time::Duration};

use tracing::{debug, error, warn};

use crate::{
    config::WriterConfig,
    error::{PipelineError, Result},
    model::SummaryDelta,
    observability::record_summary_apply,
    queue::DeltaQueue,
    summary::SummaryStore,
};

pub use crate::summary::ApplyOutcome;

/// Idempotent, conflict-retrying front end of the summary store.
pub struct SummaryWriter {
    store: Arc<SummaryStore>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl SummaryWriter {
    pub fn new(store: Arc<SummaryStore>, config: &WriterConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    pub fn store(&self) -> &Arc<SummaryStore> {
        &self.store
    }

    /// Applies the delta at most once per dedup token. Commit conflicts and
    /// other transient store errors are retried locally; the last transient
    /// error is returned once the attempt budget is spent.
    pub fn apply(&self, delta: &SummaryDelta) -> Result<ApplyOutcome> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.apply_delta(delta) {
                Ok(ApplyOutcome::Duplicate) => {
                    record_summary_apply("duplicate");
                    debug!(
                        target: "streamcqrs.writer",
                        identity = %delta.identity,
                        token = %delta.token,
                        "duplicate delta ignored"
                    );
                    return Ok(ApplyOutcome::Duplicate);
                }
                Ok(outcome) => {
                    record_summary_apply("applied");
                    return Ok(outcome);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    record_summary_apply("conflict");
                    let delay = self.backoff_base * 2u32.pow((attempt - 1).min(6));
                    debug!(
                        target: "streamcqrs.writer",
                        identity = %delta.identity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying summary update: {err}"
                    );
                    thread::sleep(delay);
                }
                Err(err) => {
                    if matches!(err, PipelineError::IntegrityViolation(_)) {
                        record_summary_apply("integrity_violation");
                        error!(
                            target: "streamcqrs.writer",
                            identity = %delta.identity,
                            token = %delta.token,
                            "{err}"
                        );
                    } else {
                        record_summary_apply("error");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStep {
    Idle,
    Applied,
    Duplicate,
    /// The delta was applied but the receipt went stale before the ack.
    Stale,
    Released,
    DeadLettered,
}

/// Queue consumer for the queued delivery pattern.
pub struct SummaryQueueWorker {
    queue: Arc<DeltaQueue>,
    writer: Arc<SummaryWriter>,
}

impl SummaryQueueWorker {
    pub fn new(queue: Arc<DeltaQueue>, writer: Arc<SummaryWriter>) -> Self {
        Self { queue, writer }
    }

    /// Receives at most one message and resolves it.
    pub fn process_next(&self, max_wait: Duration) -> Result<WorkerStep> {
        let Some(delivery) = self.queue.receive(max_wait)? else {
            return Ok(WorkerStep::Idle);
        };
        let delta = &delivery.message.body;

        match self.writer.apply(delta) {
            Ok(outcome) => {
                if !self.queue.acknowledge(&delivery.handle)? {
                    warn!(
                        target: "streamcqrs.writer",
                        id = %delivery.handle.id,
                        token = %delta.token,
                        "receipt went stale before acknowledgement; redelivery will be a duplicate"
                    );
                    return Ok(WorkerStep::Stale);
                }
                Ok(match outcome {
                    ApplyOutcome::Applied(_) => WorkerStep::Applied,
                    ApplyOutcome::Duplicate => WorkerStep::Duplicate,
                })
            }
            Err(err @ (PipelineError::IntegrityViolation(_) | PipelineError::MalformedRecord { .. })) => {
                self.queue.dead_letter(&delivery.handle, &err.to_string())?;
                Ok(WorkerStep::DeadLettered)
            }
            Err(err) => {
                warn!(
                    target: "streamcqrs.writer",
                    id = %delivery.handle.id,
                    token = %delta.token,
                    receive_count = delivery.handle.receive_count,
                    "summary update failed, releasing message: {err}"
                );
                self.queue.release(&delivery.handle, &err.to_string())?;
                Ok(WorkerStep::Released)
            }
        }
    }
}
