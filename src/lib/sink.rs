use std::sync::Arc;

use crate::{error::Result, model::SummaryDelta, queue::DeltaQueue, writer::SummaryWriter};

/// Transport between the aggregator and the summary writer.
pub trait DeltaSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn deliver(&self, delta: &SummaryDelta) -> Result<()>;
}

/// Applies deltas inline on the dispatcher's thread.
pub struct DirectSink {
    writer: Arc<SummaryWriter>,
}

impl DirectSink {
    pub fn new(writer: Arc<SummaryWriter>) -> Self {
        Self { writer }
    }
}

impl DeltaSink for DirectSink {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn deliver(&self, delta: &SummaryDelta) -> Result<()> {
        self.writer.apply(delta).map(|_| ())
    }
}

/// Hands deltas to the decoupling queue; a queue worker applies them later.
pub struct QueueSink {
    queue: Arc<DeltaQueue>,
}

impl QueueSink {
    pub fn new(queue: Arc<DeltaQueue>) -> Self {
        Self { queue }
    }
}

impl DeltaSink for QueueSink {
    fn name(&self) -> &'static str {
        "queued"
    }

    fn deliver(&self, delta: &SummaryDelta) -> Result<()> {
        self.queue.enqueue(delta).map(|_| ())
    }
}
