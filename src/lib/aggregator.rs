use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::{
    error::{PipelineError, Result},
    model::{Adjustment, ChangeEvent, DetailRecord, SummaryDelta},
};

pub const FIELD_ACCOUNT_TOTAL: &str = "account_total";
pub const FIELD_ORDER_COUNT: &str = "order_count";
pub const FIELD_ITEM_QUANTITY: &str = "item_quantity";
pub const FIELD_LARGEST_ORDER: &str = "largest_order";

/// Pure mapping from one change event to the summary deltas it implies.
/// Implementations must not perform I/O and must be deterministic.
pub trait Aggregator: Send + Sync {
    fn name(&self) -> &'static str;

    fn aggregate(&self, event: &ChangeEvent) -> Result<Vec<SummaryDelta>>;
}

/// Per-account order totals.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderTotalsAggregator;

impl Aggregator for OrderTotalsAggregator {
    fn name(&self) -> &'static str {
        "order_totals"
    }

    fn aggregate(&self, event: &ChangeEvent) -> Result<Vec<SummaryDelta>> {
        let record = DetailRecord::from_item(&event.image)?;
        let token = event.token();
        if record.account_id != event.partition_key {
            return Err(PipelineError::malformed(
                token.as_str(),
                format!(
                    "accountid '{}' does not match partition key '{}'",
                    record.account_id, event.partition_key
                ),
            ));
        }

        let total = record.order_total()?;
        let adjustments = BTreeMap::from([
            (FIELD_ACCOUNT_TOTAL.to_string(), Adjustment::Add(total)),
            (FIELD_ORDER_COUNT.to_string(), Adjustment::Add(Decimal::ONE)),
            (FIELD_ITEM_QUANTITY.to_string(), Adjustment::Add(record.quantity)),
            (FIELD_LARGEST_ORDER.to_string(), Adjustment::Max(total)),
        ]);

        Ok(vec![SummaryDelta {
            identity: record.account_id,
            token,
            adjustments,
        }])
    }
}
