use std::{path::Path, time::Instant};

use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, MultiThreaded, OptimisticTransactionDB, Options};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, Result},
    keys::{key_with_segments, prefix_with_segments},
    model::{DedupToken, SummaryDelta, SummaryRecord},
    observability::record_store_op,
};

const PREFIX_SUMMARY: &str = "summary";
const PREFIX_APPLIED: &str = "applied";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(SummaryRecord),
    Duplicate,
}

/// Marker written next to the summary for every delta folded into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedMarker {
    pub token: DedupToken,
    pub fingerprint: String,
    pub applied_at: DateTime<Utc>,
}

/// Read-optimized store of per-account summaries. Mutations go through
/// optimistic transactions only; concurrent writers to one account conflict
/// at commit time and surface as transient errors.
pub struct SummaryStore {
    db: OptimisticTransactionDB<MultiThreaded>,
}

impl SummaryStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = OptimisticTransactionDB::<MultiThreaded>::open(&options, path).map_err(|err| {
            PipelineError::Storage(format!(
                "failed to open summary store at {}: {}",
                path.display(),
                err
            ))
        })?;
        Ok(Self { db })
    }

    pub fn get(&self, account_id: &str) -> Result<Option<SummaryRecord>> {
        let start = Instant::now();
        let result: Result<Option<SummaryRecord>> = (|| match self.db.get(summary_key(account_id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        })();
        record_store_op(
            "summary_get",
            if result.is_ok() { "ok" } else { "err" },
            start.elapsed().as_secs_f64(),
        );
        result
    }

    /// One conditional update attempt: the token marker and the summary are
    /// read for update and written back in a single commit. A commit
    /// conflict is reported as [`PipelineError::Transient`].
    pub fn apply_delta(&self, delta: &SummaryDelta) -> Result<ApplyOutcome> {
        let start = Instant::now();
        let result = self.apply_delta_inner(delta);
        record_store_op(
            "summary_apply",
            if result.is_ok() { "ok" } else { "err" },
            start.elapsed().as_secs_f64(),
        );
        result
    }

    fn apply_delta_inner(&self, delta: &SummaryDelta) -> Result<ApplyOutcome> {
        if delta.identity.is_empty() {
            return Err(PipelineError::malformed(
                delta.token.as_str(),
                "summary delta has an empty identity",
            ));
        }

        let fingerprint = delta.fingerprint();
        let marker_key = applied_key(&delta.identity, &delta.token);
        let record_key = summary_key(&delta.identity);

        let txn = self.db.transaction();
        if let Some(raw) = txn.get_for_update(&marker_key, true)? {
            let marker: AppliedMarker = serde_json::from_slice(&raw)?;
            if marker.fingerprint == fingerprint {
                return Ok(ApplyOutcome::Duplicate);
            }
            return Err(PipelineError::IntegrityViolation(format!(
                "token {} was applied to {} with fingerprint {} but was redelivered with {}",
                delta.token, delta.identity, marker.fingerprint, fingerprint
            )));
        }

        let mut record = match txn.get_for_update(&record_key, true)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => SummaryRecord::new(delta.identity.clone()),
        };
        record.fold(delta)?;
        let now = Utc::now();
        record.updated_at = now;

        let marker = AppliedMarker {
            token: delta.token.clone(),
            fingerprint,
            applied_at: now,
        };
        txn.put(&marker_key, serde_json::to_vec(&marker)?)?;
        txn.put(&record_key, serde_json::to_vec(&record)?)?;
        txn.commit()?;
        Ok(ApplyOutcome::Applied(record))
    }

    pub fn applied_tokens(&self, account_id: &str) -> Result<Vec<AppliedMarker>> {
        let prefix = prefix_with_segments(&[PREFIX_APPLIED, account_id]);
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
        let mut markers = Vec::new();
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            markers.push(serde_json::from_slice(&value)?);
        }
        Ok(markers)
    }

    pub fn accounts(&self) -> Result<Vec<String>> {
        let prefix = prefix_with_segments(&[PREFIX_SUMMARY]);
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
        let mut accounts = Vec::new();
        for entry in iter {
            let (key, _) = entry?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            accounts.push(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
        }
        Ok(accounts)
    }
}

fn summary_key(account_id: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_SUMMARY, account_id])
}

fn applied_key(account_id: &str, token: &DedupToken) -> Vec<u8> {
    key_with_segments(&[PREFIX_APPLIED, account_id, token.as_str()])
}
