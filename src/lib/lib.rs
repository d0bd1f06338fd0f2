pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod details;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod gateway;
mod keys;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod sink;
pub mod summary;
pub mod writer;

pub use aggregator::{Aggregator, OrderTotalsAggregator};
pub use config::{Config, DeliveryPattern, StartingPosition};
pub use dispatcher::{ChangeDispatcher, PollOutcome};
pub use error::{PipelineError, Result};
pub use feed::{ChangeFeed, Cursor, FeedBatch};
pub use model::{
    Adjustment, AttributeValue, ChangeEvent, DedupToken, DetailRecord, Item, OrderRequest,
    SummaryDelta, SummaryRecord,
};
pub use pipeline::{DrainReport, Pipeline};
pub use writer::{ApplyOutcome, SummaryWriter};
