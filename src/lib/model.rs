use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{PipelineError, Result},
    keys::check_segment,
};

pub const ATTR_ACCOUNT_ID: &str = "accountid";
pub const ATTR_VENDOR_ID: &str = "vendorid";
pub const ATTR_ORDER_DATE: &str = "orderdate";
pub const ATTR_CITY: &str = "city";
pub const ATTR_ITEM_TYPE: &str = "itemtype";
pub const ATTR_ITEM_SIZE: &str = "itemsize";
pub const ATTR_UNIT_PRICE: &str = "unitprice";
pub const ATTR_QUANTITY: &str = "quantity";

/// A single attribute as stored in the details table. Numbers travel as
/// decimal strings and are only interpreted by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> &str {
        match self {
            AttributeValue::S(value) | AttributeValue::N(value) => value,
        }
    }
}

pub type Item = BTreeMap<String, AttributeValue>;

/// Body accepted by the write API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub account_id: String,
    pub vendor_id: String,
    #[serde(default)]
    pub order_date: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub item_type: String,
    #[serde(default)]
    pub item_size: String,
    pub unit_price: Decimal,
    pub quantity: Decimal,
}

impl OrderRequest {
    pub fn into_item(self) -> Result<Item> {
        let account_id = self.account_id.trim();
        let vendor_id = self.vendor_id.trim();
        if account_id.is_empty() {
            return Err(PipelineError::InvalidRequest("accountId is required".into()));
        }
        if vendor_id.is_empty() {
            return Err(PipelineError::InvalidRequest("vendorId is required".into()));
        }
        check_segment("accountId", account_id)?;
        check_segment("vendorId", vendor_id)?;

        let mut item = Item::new();
        item.insert(ATTR_ACCOUNT_ID.into(), AttributeValue::S(account_id.to_string()));
        item.insert(ATTR_VENDOR_ID.into(), AttributeValue::S(vendor_id.to_string()));
        item.insert(ATTR_ORDER_DATE.into(), AttributeValue::S(self.order_date));
        item.insert(ATTR_CITY.into(), AttributeValue::S(self.city));
        item.insert(ATTR_ITEM_TYPE.into(), AttributeValue::S(self.item_type));
        item.insert(ATTR_ITEM_SIZE.into(), AttributeValue::S(self.item_size));
        item.insert(
            ATTR_UNIT_PRICE.into(),
            AttributeValue::N(self.unit_price.normalize().to_string()),
        );
        item.insert(
            ATTR_QUANTITY.into(),
            AttributeValue::N(self.quantity.normalize().to_string()),
        );
        Ok(item)
    }
}

/// Typed view of a stored order, produced by parsing an [`Item`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailRecord {
    pub account_id: String,
    pub vendor_id: String,
    pub order_date: String,
    pub city: String,
    pub item_type: String,
    pub item_size: String,
    pub unit_price: Decimal,
    pub quantity: Decimal,
}

impl DetailRecord {
    pub fn from_item(item: &Item) -> Result<Self> {
        let token = item_token(item);
        let account_id = required_string(item, ATTR_ACCOUNT_ID, &token)?;
        let vendor_id = required_string(item, ATTR_VENDOR_ID, &token)?;
        let unit_price = required_number(item, ATTR_UNIT_PRICE, &token)?;
        let quantity = required_number(item, ATTR_QUANTITY, &token)?;

        if unit_price.is_sign_negative() {
            return Err(PipelineError::malformed(token, "unitprice cannot be negative"));
        }
        if quantity.is_sign_negative() || !quantity.fract().is_zero() {
            return Err(PipelineError::malformed(
                token,
                "quantity must be a non-negative whole number",
            ));
        }
        if unit_price.checked_mul(quantity).is_none() {
            return Err(PipelineError::malformed(token, "order total overflows"));
        }

        Ok(Self {
            account_id,
            vendor_id,
            order_date: optional_string(item, ATTR_ORDER_DATE),
            city: optional_string(item, ATTR_CITY),
            item_type: optional_string(item, ATTR_ITEM_TYPE),
            item_size: optional_string(item, ATTR_ITEM_SIZE),
            unit_price,
            quantity,
        })
    }

    pub fn order_total(&self) -> Result<Decimal> {
        self.unit_price.checked_mul(self.quantity).ok_or_else(|| {
            PipelineError::malformed(
                DedupToken::new(&self.account_id, &self.vendor_id).into_string(),
                "order total overflows",
            )
        })
    }
}

fn item_token(item: &Item) -> String {
    let part = |name: &str| {
        item.get(name)
            .map(|value| value.as_str().to_string())
            .unwrap_or_else(|| "?".to_string())
    };
    DedupToken::new(&part(ATTR_ACCOUNT_ID), &part(ATTR_VENDOR_ID)).into_string()
}

fn required_string(item: &Item, name: &str, token: &str) -> Result<String> {
    match item.get(name) {
        Some(AttributeValue::S(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(AttributeValue::S(_)) => Err(PipelineError::malformed(token, format!("{name} is empty"))),
        Some(AttributeValue::N(_)) => Err(PipelineError::malformed(
            token,
            format!("{name} must be a string attribute"),
        )),
        None => Err(PipelineError::malformed(token, format!("{name} is missing"))),
    }
}

fn optional_string(item: &Item, name: &str) -> String {
    match item.get(name) {
        Some(AttributeValue::S(value)) => value.clone(),
        _ => String::new(),
    }
}

fn required_number(item: &Item, name: &str, token: &str) -> Result<Decimal> {
    match item.get(name) {
        Some(AttributeValue::N(raw)) => Decimal::from_str(raw.trim()).map_err(|err| {
            PipelineError::malformed(token, format!("{name} '{raw}' is not a number: {err}"))
        }),
        Some(AttributeValue::S(_)) => Err(PipelineError::malformed(
            token,
            format!("{name} must be a number attribute"),
        )),
        None => Err(PipelineError::malformed(token, format!("{name} is missing"))),
    }
}

/// Identity of the source record whose effect a delta carries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupToken(String);

impl DedupToken {
    pub fn new(partition_key: &str, sort_key: &str) -> Self {
        Self(format!("{partition_key}#{sort_key}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DedupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub shard: u16,
    pub sequence: u64,
    pub partition_key: String,
    pub sort_key: String,
    pub image: Item,
    pub written_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn token(&self) -> DedupToken {
        DedupToken::new(&self.partition_key, &self.sort_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    Add,
    Max,
    Min,
}

/// A commutative update to one summary field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum Adjustment {
    Add(Decimal),
    Max(Decimal),
    Min(Decimal),
}

impl Adjustment {
    pub fn kind(&self) -> AdjustmentKind {
        match self {
            Adjustment::Add(_) => AdjustmentKind::Add,
            Adjustment::Max(_) => AdjustmentKind::Max,
            Adjustment::Min(_) => AdjustmentKind::Min,
        }
    }

    pub fn value(&self) -> Decimal {
        match self {
            Adjustment::Add(value) | Adjustment::Max(value) | Adjustment::Min(value) => *value,
        }
    }

    /// Returns `None` when an addition leaves the decimal range.
    pub fn apply(&self, current: Option<Decimal>) -> Option<Decimal> {
        match (*self, current) {
            (Adjustment::Add(value), Some(current)) => current.checked_add(value),
            (Adjustment::Max(value), Some(current)) => Some(current.max(value)),
            (Adjustment::Min(value), Some(current)) => Some(current.min(value)),
            (adjustment, None) => Some(adjustment.value()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryDelta {
    pub identity: String,
    pub token: DedupToken,
    pub adjustments: BTreeMap<String, Adjustment>,
}

impl SummaryDelta {
    /// Stable digest of the delta's effect. Two deltas with the same token
    /// must carry the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.identity.as_bytes());
        hasher.update([0x1F]);
        hasher.update(self.token.as_str().as_bytes());
        for (field, adjustment) in &self.adjustments {
            hasher.update([0x1F]);
            hasher.update(field.as_bytes());
            hasher.update([0x1E]);
            let op: &[u8] = match adjustment.kind() {
                AdjustmentKind::Add => b"add",
                AdjustmentKind::Max => b"max",
                AdjustmentKind::Min => b"min",
            };
            hasher.update(op);
            hasher.update([0x1E]);
            hasher.update(adjustment.value().normalize().to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Current read-side state for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub account_id: String,
    pub fields: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub operations: BTreeMap<String, AdjustmentKind>,
    pub applied_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl SummaryRecord {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            fields: BTreeMap::new(),
            operations: BTreeMap::new(),
            applied_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn field(&self, name: &str) -> Decimal {
        self.fields.get(name).copied().unwrap_or(Decimal::ZERO)
    }

    /// Folds one delta into the record. A field keeps the operation it was
    /// first adjusted with; mixing operations would break commutativity.
    /// The record is left untouched when the delta is rejected.
    pub fn fold(&mut self, delta: &SummaryDelta) -> Result<()> {
        let mut next = Vec::with_capacity(delta.adjustments.len());
        for (field, adjustment) in &delta.adjustments {
            if let Some(existing) = self.operations.get(field) {
                if *existing != adjustment.kind() {
                    return Err(PipelineError::IntegrityViolation(format!(
                        "field '{}' of {} is {:?} but delta {} adjusts it with {:?}",
                        field,
                        self.account_id,
                        existing,
                        delta.token,
                        adjustment.kind()
                    )));
                }
            }
            let value = adjustment
                .apply(self.fields.get(field).copied())
                .ok_or_else(|| {
                    PipelineError::IntegrityViolation(format!(
                        "field '{}' of {} overflows when applying delta {}",
                        field, self.account_id, delta.token
                    ))
                })?;
            next.push((field, adjustment.kind(), value));
        }
        for (field, kind, value) in next {
            self.fields.insert(field.clone(), value.normalize());
            self.operations.insert(field.clone(), kind);
        }
        self.applied_count += 1;
        Ok(())
    }
}
