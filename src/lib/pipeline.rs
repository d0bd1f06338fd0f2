use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    aggregator::{Aggregator, OrderTotalsAggregator},
    checkpoint::DispatcherState,
    config::{Config, DeliveryPattern},
    details::DetailStore,
    dispatcher::{ChangeDispatcher, PollOutcome},
    error::{PipelineError, Result},
    gateway::{CommandGateway, QueryGateway},
    queue::DeltaQueue,
    reconcile::{ReconcileReport, reconcile_account},
    sink::{DeltaSink, DirectSink, QueueSink},
    summary::SummaryStore,
    writer::{SummaryQueueWorker, SummaryWriter, WorkerStep},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub batches: usize,
    pub delivered: usize,
    pub parked: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub released: usize,
    pub dead_lettered: usize,
}

/// Every component of one deployment, wired according to its config.
pub struct Pipeline {
    config: Config,
    details: Arc<DetailStore>,
    summary: Arc<SummaryStore>,
    writer: Arc<SummaryWriter>,
    queue: Option<Arc<DeltaQueue>>,
    aggregator: Arc<dyn Aggregator>,
    dispatcher: Arc<ChangeDispatcher>,
}

impl Pipeline {
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_aggregator(config, Arc::new(OrderTotalsAggregator))
    }

    pub fn open_with_aggregator(config: Config, aggregator: Arc<dyn Aggregator>) -> Result<Self> {
        config.validate()?;
        config.ensure_data_dir()?;

        let details = Arc::new(DetailStore::open(
            &config.details_store_path(),
            config.shard_count,
        )?);
        let summary = Arc::new(SummaryStore::open(&config.summary_store_path())?);
        let writer = Arc::new(SummaryWriter::new(summary.clone(), &config.writer));
        let state = Arc::new(DispatcherState::open(&config.dispatcher_state_path())?);

        let (queue, sink): (Option<Arc<DeltaQueue>>, Arc<dyn DeltaSink>) = match config.pattern {
            DeliveryPattern::Direct => (None, Arc::new(DirectSink::new(writer.clone()))),
            DeliveryPattern::Queued => {
                let queue = Arc::new(DeltaQueue::open(&config.queue_store_path(), &config.queue)?);
                (Some(queue.clone()), Arc::new(QueueSink::new(queue)))
            }
        };

        let dispatcher = Arc::new(ChangeDispatcher::new(
            details.clone(),
            aggregator.clone(),
            sink,
            state,
            config.dispatcher.clone(),
        ));

        info!(
            target: "streamcqrs.pipeline",
            pattern = %config.pattern,
            shards = config.shard_count,
            data_dir = %config.data_dir.display(),
            "pipeline opened"
        );

        Ok(Self {
            config,
            details,
            summary,
            writer,
            queue,
            aggregator,
            dispatcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn details(&self) -> &Arc<DetailStore> {
        &self.details
    }

    pub fn summary(&self) -> &Arc<SummaryStore> {
        &self.summary
    }

    pub fn writer(&self) -> &Arc<SummaryWriter> {
        &self.writer
    }

    pub fn queue(&self) -> Option<&Arc<DeltaQueue>> {
        self.queue.as_ref()
    }

    pub fn dispatcher(&self) -> &Arc<ChangeDispatcher> {
        &self.dispatcher
    }

    pub fn command_gateway(&self) -> CommandGateway {
        CommandGateway::new(self.details.clone())
    }

    pub fn query_gateway(&self) -> QueryGateway {
        QueryGateway::new(self.summary.clone())
    }

    pub fn queue_worker(&self) -> Option<SummaryQueueWorker> {
        self.queue
            .as_ref()
            .map(|queue| SummaryQueueWorker::new(queue.clone(), self.writer.clone()))
    }

    pub fn reconcile(&self, account_id: &str) -> Result<ReconcileReport> {
        reconcile_account(
            &self.details,
            &self.summary,
            self.aggregator.as_ref(),
            account_id,
        )
    }

    /// Polls every shard until caught up and, for the queued pattern, works
    /// the queue until nothing is pending or in flight. Blocks the caller.
    pub fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let worker = self.queue_worker();
        let wait = Duration::from_millis(self.config.queue.receive_wait_ms);

        loop {
            let mut progressed = false;
            for shard in self.dispatcher.shards() {
                while let PollOutcome::Processed {
                    delivered, parked, ..
                } = self.dispatcher.poll_shard(shard)?
                {
                    report.batches += 1;
                    report.delivered += delivered;
                    report.parked += parked;
                    progressed = true;
                }
            }

            if let (Some(worker), Some(queue)) = (worker.as_ref(), self.queue.as_ref()) {
                loop {
                    let step = worker.process_next(Duration::ZERO)?;
                    match step {
                        WorkerStep::Idle => break,
                        WorkerStep::Applied | WorkerStep::Stale => report.applied += 1,
                        WorkerStep::Duplicate => report.duplicates += 1,
                        WorkerStep::Released => report.released += 1,
                        WorkerStep::DeadLettered => report.dead_lettered += 1,
                    }
                    progressed = true;
                }
                if !progressed && queue.status()?.outstanding() > 0 {
                    // Released or in-flight messages only become visible later.
                    std::thread::sleep(wait.min(Duration::from_millis(100)));
                    continue;
                }
            }

            if !progressed {
                return Ok(report);
            }
        }
    }

    /// Runs one dispatcher task per shard plus the queue workers until
    /// `shutdown` flips to `true`. Each task finishes its current batch or
    /// message before exiting.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for shard in self.dispatcher.shards() {
            let dispatcher = self.dispatcher.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(run_shard(dispatcher, shard, shutdown)));
        }

        if self.queue.is_some() {
            let wait = Duration::from_millis(self.config.queue.receive_wait_ms);
            for index in 0..self.config.queue.workers.max(1) {
                if let Some(worker) = self.queue_worker() {
                    let shutdown = shutdown.clone();
                    tasks.push(tokio::spawn(run_queue_worker(
                        Arc::new(worker),
                        index,
                        wait,
                        shutdown,
                    )));
                }
            }
        }

        info!(
            target: "streamcqrs.pipeline",
            tasks = tasks.len(),
            pattern = %self.config.pattern,
            "pipeline running"
        );

        for task in tasks {
            task.await
                .map_err(|err| PipelineError::Storage(format!("pipeline task failed: {err}")))?;
        }
        info!(target: "streamcqrs.pipeline", "pipeline stopped");
        Ok(())
    }
}

async fn run_shard(
    dispatcher: Arc<ChangeDispatcher>,
    shard: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let idle = dispatcher.poll_interval();
    while !*shutdown.borrow() {
        let result = tokio::task::spawn_blocking({
            let dispatcher = dispatcher.clone();
            move || dispatcher.poll_shard(shard)
        })
        .await;

        let pause = match result {
            Ok(Ok(PollOutcome::Processed { .. })) => continue,
            Ok(Ok(PollOutcome::CaughtUp)) => idle,
            Ok(Err(err)) => {
                warn!(target: "streamcqrs.dispatcher", shard, "poll failed: {err}");
                idle
            }
            Err(err) => {
                error!(target: "streamcqrs.dispatcher", shard, "poll task failed: {err}");
                idle
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_queue_worker(
    worker: Arc<SummaryQueueWorker>,
    index: usize,
    wait: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let result = tokio::task::spawn_blocking({
            let worker = worker.clone();
            move || worker.process_next(wait)
        })
        .await;

        match result {
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => {
                warn!(target: "streamcqrs.queue", worker = index, "queue worker error: {err}");
            }
            Err(err) => {
                // The in-flight message reappears after its visibility timeout.
                error!(target: "streamcqrs.queue", worker = index, "queue worker task failed: {err}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
