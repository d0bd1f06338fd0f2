use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::error::{PipelineError, Result};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
static START_TIME: OnceCell<Instant> = OnceCell::new();

/// Installs the process-wide Prometheus recorder. Calling it again is a
/// no-op.
pub fn init() -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("streamcqrs_store_operation_duration_seconds".into()),
            &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0],
        )
        .map_err(|err| {
            PipelineError::Config(format!("failed to configure prometheus exporter: {err}"))
        })?;
    let handle = builder.install_recorder().map_err(|err| {
        PipelineError::Config(format!("failed to initialise prometheus recorder: {err}"))
    })?;

    describe_counter!(
        "streamcqrs_feed_records_total",
        "Total number of change events appended to the feed."
    );
    describe_counter!(
        "streamcqrs_dispatch_batches_total",
        "Total number of feed batches resolved by the dispatcher."
    );
    describe_counter!(
        "streamcqrs_dispatch_parked_total",
        "Total number of change events parked after exhausting their retry budget."
    );
    describe_counter!(
        "streamcqrs_summary_apply_total",
        "Total number of summary deltas handled by the writer, by outcome."
    );
    describe_counter!(
        "streamcqrs_queue_messages_total",
        "Total number of queue message transitions, by event."
    );
    describe_gauge!(
        "streamcqrs_queue_depth",
        "Current number of queue messages by state."
    );
    describe_counter!(
        "streamcqrs_store_operations_total",
        "Total number of store operations executed."
    );
    describe_histogram!(
        "streamcqrs_store_operation_duration_seconds",
        "Duration of store operations."
    );

    let _ = PROMETHEUS_HANDLE.set(handle);
    let _ = START_TIME.set(Instant::now());
    Ok(())
}

pub fn render() -> String {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        let mut body = handle.render();
        if let Some(start) = START_TIME.get() {
            let uptime = start.elapsed().as_secs_f64();
            body.push_str(&format!("streamcqrs_uptime_seconds{{}} {}\n", uptime));
        }
        body
    } else {
        String::new()
    }
}

pub fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("streamcqrs_store_operations_total", &labels).increment(1);
    histogram!("streamcqrs_store_operation_duration_seconds", &labels).record(duration);
}

pub fn record_feed_append(shard: u16) {
    counter!("streamcqrs_feed_records_total", "shard" => shard.to_string()).increment(1);
}

pub fn record_dispatch_batch(shard: u16, events: usize, parked: usize) {
    counter!("streamcqrs_dispatch_batches_total", "shard" => shard.to_string()).increment(1);
    if parked > 0 {
        counter!("streamcqrs_dispatch_parked_total", "shard" => shard.to_string())
            .increment(parked as u64);
    }
    histogram!("streamcqrs_dispatch_batch_events", "shard" => shard.to_string())
        .record(events as f64);
}

pub fn record_summary_apply(outcome: &'static str) {
    counter!("streamcqrs_summary_apply_total", "outcome" => outcome).increment(1);
}

pub fn record_queue_event(queue: &str, event: &'static str) {
    counter!(
        "streamcqrs_queue_messages_total",
        "queue" => queue.to_string(),
        "event" => event
    )
    .increment(1);
}

pub fn set_queue_depth(queue: &str, state: &'static str, depth: usize) {
    gauge!(
        "streamcqrs_queue_depth",
        "queue" => queue.to_string(),
        "state" => state
    )
    .set(depth as f64);
}
