use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::{
    details::DetailStore,
    error::Result,
    model::{DedupToken, OrderRequest, SummaryRecord},
    summary::SummaryStore,
};

/// Acknowledgement of an accepted order write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderReceipt {
    pub token: DedupToken,
    pub shard: u16,
    pub sequence: u64,
}

/// Write side. Only ever touches the details store.
#[derive(Clone)]
pub struct CommandGateway {
    details: Arc<DetailStore>,
}

impl CommandGateway {
    pub fn new(details: Arc<DetailStore>) -> Self {
        Self { details }
    }

    pub fn submit_order(&self, request: OrderRequest) -> Result<OrderReceipt> {
        let item = request.into_item()?;
        let event = self.details.put_item(item)?;
        info!(
            target: "streamcqrs.gateway",
            token = %event.token(),
            shard = event.shard,
            sequence = event.sequence,
            "order accepted"
        );
        Ok(OrderReceipt {
            token: event.token(),
            shard: event.shard,
            sequence: event.sequence,
        })
    }
}

/// Read side. Results may lag behind accepted writes.
#[derive(Clone)]
pub struct QueryGateway {
    summary: Arc<SummaryStore>,
}

impl QueryGateway {
    pub fn new(summary: Arc<SummaryStore>) -> Self {
        Self { summary }
    }

    pub fn get_summary(&self, account_id: &str) -> Result<Option<SummaryRecord>> {
        self.summary.get(account_id)
    }
}
