use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::{
    aggregator::Aggregator,
    details::DetailStore,
    error::{PipelineError, Result},
    model::{ATTR_VENDOR_ID, ChangeEvent, SummaryRecord},
    summary::SummaryStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDrift {
    pub field: String,
    pub expected: Decimal,
    pub actual: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub account_id: String,
    pub records: usize,
    pub malformed: Vec<String>,
    /// Well-formed records the summary cannot absorb, such as an overflow.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
    pub expected: SummaryRecord,
    pub actual: Option<SummaryRecord>,
    pub drift: Vec<FieldDrift>,
    /// Tokens of well-formed records whose effect is not in the summary yet.
    pub missing: Vec<String>,
    /// Tokens applied to the summary without a matching stored record.
    pub unexpected: Vec<String>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.drift.is_empty() && self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Replays every stored record of `account_id` through `aggregator` and
/// compares the resulting fold with the stored summary. Malformed records
/// are reported, not folded, matching what the dispatcher parks.
pub fn reconcile_account(
    details: &DetailStore,
    summary: &SummaryStore,
    aggregator: &dyn Aggregator,
    account_id: &str,
) -> Result<ReconcileReport> {
    let items = details.items_for_partition(account_id)?;
    let shard = details.shard_for(account_id);

    let mut expected = SummaryRecord::new(account_id);
    let mut expected_tokens = BTreeSet::new();
    let mut malformed = Vec::new();
    let mut rejected = Vec::new();
    for image in &items {
        let sort_key = image
            .get(ATTR_VENDOR_ID)
            .map(|value| value.as_str().to_string())
            .unwrap_or_default();
        let event = ChangeEvent {
            shard,
            sequence: 0,
            partition_key: account_id.to_string(),
            sort_key,
            image: image.clone(),
            written_at: Utc::now(),
        };
        match aggregator.aggregate(&event) {
            Ok(deltas) => {
                for delta in deltas {
                    match expected.fold(&delta) {
                        Ok(()) => {
                            expected_tokens.insert(delta.token.to_string());
                        }
                        Err(PipelineError::IntegrityViolation(_)) => {
                            rejected.push(delta.token.to_string());
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            Err(err) if err.is_permanent_record() => malformed.push(event.token().to_string()),
            Err(err) => return Err(err),
        }
    }

    let actual = summary.get(account_id)?;
    let applied: BTreeSet<String> = summary
        .applied_tokens(account_id)?
        .into_iter()
        .map(|marker| marker.token.to_string())
        .collect();

    let actual_fields = actual
        .as_ref()
        .map(|record| record.fields.clone())
        .unwrap_or_default();
    let names: BTreeSet<&String> = expected.fields.keys().chain(actual_fields.keys()).collect();
    let drift = names
        .into_iter()
        .filter_map(|field| {
            let want = field_value(&expected.fields, field);
            let have = field_value(&actual_fields, field);
            (want != have).then(|| FieldDrift {
                field: field.clone(),
                expected: want,
                actual: have,
            })
        })
        .collect();

    Ok(ReconcileReport {
        account_id: account_id.to_string(),
        records: items.len(),
        malformed,
        rejected,
        missing: expected_tokens.difference(&applied).cloned().collect(),
        unexpected: applied.difference(&expected_tokens).cloned().collect(),
        expected,
        actual,
        drift,
    })
}

fn field_value(fields: &BTreeMap<String, Decimal>, name: &str) -> Decimal {
    fields.get(name).copied().unwrap_or(Decimal::ZERO)
}
