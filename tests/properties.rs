use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use rust_decimal::Decimal;
use tempfile::TempDir;

use streamcqrs::{
    Aggregator, AttributeValue, ChangeEvent, Config, DeliveryPattern, Item, OrderTotalsAggregator,
    Pipeline, SummaryDelta, SummaryRecord, SummaryWriter,
    config::{QueueConfig, WriterConfig},
    model::{ATTR_ACCOUNT_ID, ATTR_QUANTITY, ATTR_UNIT_PRICE, ATTR_VENDOR_ID},
    queue::DeltaQueue,
    summary::SummaryStore,
    writer::{SummaryQueueWorker, WorkerStep},
};

const ACCOUNT: &str = "A1";

fn fail(err: anyhow::Error) -> TestCaseError {
    TestCaseError::fail(format!("{err:#}"))
}

fn order_item(vendor: &str, unit_price: &str, quantity: u32) -> Item {
    BTreeMap::from([
        (ATTR_ACCOUNT_ID.to_string(), AttributeValue::S(ACCOUNT.into())),
        (ATTR_VENDOR_ID.to_string(), AttributeValue::S(vendor.into())),
        (ATTR_UNIT_PRICE.to_string(), AttributeValue::N(unit_price.into())),
        (ATTR_QUANTITY.to_string(), AttributeValue::N(quantity.to_string())),
    ])
}

/// One delta per order; vendors are unique so every token is distinct.
fn deltas_for(orders: &[(u32, u32)]) -> Result<Vec<SummaryDelta>> {
    let aggregator = OrderTotalsAggregator;
    let mut deltas = Vec::new();
    for (index, (cents, quantity)) in orders.iter().enumerate() {
        let vendor = format!("V{index}");
        let price = Decimal::new(i64::from(*cents), 2).to_string();
        let event = ChangeEvent {
            shard: 0,
            sequence: index as u64 + 1,
            partition_key: ACCOUNT.into(),
            sort_key: vendor.clone(),
            image: order_item(&vendor, &price, *quantity),
            written_at: Utc::now(),
        };
        deltas.extend(aggregator.aggregate(&event)?);
    }
    Ok(deltas)
}

fn expected_fold(deltas: &[SummaryDelta]) -> Result<SummaryRecord> {
    let mut record = SummaryRecord::new(ACCOUNT);
    for delta in deltas {
        record.fold(delta)?;
    }
    Ok(record)
}

fn open_writer(tmp: &TempDir) -> Result<Arc<SummaryWriter>> {
    let store = Arc::new(SummaryStore::open(&tmp.path().join("summary"))?);
    Ok(Arc::new(SummaryWriter::new(store, &WriterConfig::default())))
}

fn stored(writer: &SummaryWriter) -> Result<SummaryRecord> {
    writer
        .store()
        .get(ACCOUNT)?
        .context("summary record missing")
}

fn apply_all(deltas: &[SummaryDelta]) -> Result<SummaryRecord> {
    let tmp = tempfile::tempdir()?;
    let writer = open_writer(&tmp)?;
    for delta in deltas {
        writer.apply(delta)?;
    }
    stored(&writer)
}

fn drain_through_queue(deltas: &[SummaryDelta], copies: &[usize]) -> Result<(SummaryRecord, usize)> {
    let tmp = tempfile::tempdir()?;
    let writer = open_writer(&tmp)?;
    let config = QueueConfig {
        retry_backoff_ms: 1,
        ..QueueConfig::default()
    };
    let queue = Arc::new(DeltaQueue::open(&tmp.path().join("queue"), &config)?);
    for (delta, copies) in deltas.iter().zip(copies) {
        for _ in 0..*copies {
            queue.enqueue(delta)?;
        }
    }

    let worker = SummaryQueueWorker::new(queue.clone(), writer.clone());
    let mut duplicates = 0;
    loop {
        match worker.process_next(Duration::ZERO)? {
            WorkerStep::Idle => break,
            WorkerStep::Duplicate => duplicates += 1,
            WorkerStep::Applied | WorkerStep::Stale => {}
            other => anyhow::bail!("unexpected worker step {other:?}"),
        }
    }
    anyhow::ensure!(queue.status()?.outstanding() == 0, "queue not drained");
    Ok((stored(&writer)?, duplicates))
}

fn parked_after_drain(statuses: &[bool], poison_price: &str) -> Result<(usize, usize, Vec<String>)> {
    let tmp = tempfile::tempdir()?;
    let mut config = Config::with_data_dir(tmp.path().join("data"));
    config.pattern = DeliveryPattern::Direct;
    config.shard_count = 1;
    config.dispatcher.backoff_base_ms = 1;
    let pipeline = Pipeline::open(config)?;

    for (index, poisoned) in statuses.iter().enumerate() {
        let vendor = format!("V{index}");
        let price = if *poisoned { poison_price } else { "1.50" };
        pipeline.details().put_item(order_item(&vendor, price, 2))?;
    }
    let report = pipeline.drain()?;
    let ids = pipeline
        .dispatcher()
        .failures()?
        .into_iter()
        .map(|failure| failure.id.to_string())
        .collect();
    Ok((report.delivered, report.parked, ids))
}

fn orders() -> impl Strategy<Value = Vec<(u32, u32)>> {
    prop::collection::vec((0u32..10_000, 0u32..20), 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn applying_every_delta_twice_matches_applying_once(orders in orders()) {
        let deltas = deltas_for(&orders).map_err(fail)?;
        let expected = expected_fold(&deltas).map_err(fail)?;

        let doubled: Vec<SummaryDelta> = deltas
            .iter()
            .flat_map(|delta| [delta.clone(), delta.clone()])
            .collect();
        let actual = apply_all(&doubled).map_err(fail)?;

        prop_assert_eq!(&actual.fields, &expected.fields);
        prop_assert_eq!(actual.applied_count, deltas.len() as u64);
    }

    #[test]
    fn apply_order_does_not_change_the_result(
        shuffled in orders()
            .prop_flat_map(|orders| {
                let indices: Vec<usize> = (0..orders.len()).collect();
                (Just(orders), Just(indices).prop_shuffle())
            })
    ) {
        let (orders, indices) = shuffled;
        let deltas = deltas_for(&orders).map_err(fail)?;
        let expected = expected_fold(&deltas).map_err(fail)?;

        let reordered: Vec<SummaryDelta> =
            indices.iter().map(|index| deltas[*index].clone()).collect();
        let actual = apply_all(&reordered).map_err(fail)?;

        prop_assert_eq!(&actual.fields, &expected.fields);
        prop_assert_eq!(actual.applied_count, expected.applied_count);
    }

    #[test]
    fn queued_redelivery_loses_nothing_and_counts_once(
        input in orders().prop_flat_map(|orders| {
            let len = orders.len();
            (Just(orders), prop::collection::vec(1usize..4, len))
        })
    ) {
        let (orders, copies) = input;
        let deltas = deltas_for(&orders).map_err(fail)?;
        let expected = expected_fold(&deltas).map_err(fail)?;

        let (actual, duplicates) = drain_through_queue(&deltas, &copies).map_err(fail)?;
        let extra: usize = copies.iter().map(|copies| copies - 1).sum();

        prop_assert_eq!(&actual.fields, &expected.fields);
        prop_assert_eq!(actual.applied_count, deltas.len() as u64);
        prop_assert_eq!(duplicates, extra);
    }

    #[test]
    fn a_single_poison_record_is_isolated(
        input in (1usize..=8).prop_flat_map(|len| (Just(len), 0..len)),
        // Unparseable, or a total past the decimal range at quantity 2.
        poison_price in prop::sample::select(vec!["not-a-number", "79228162514264337593543950335"]),
    ) {
        let (len, poison) = input;
        let statuses: Vec<bool> = (0..len).map(|index| index == poison).collect();

        let (delivered, parked, ids) = parked_after_drain(&statuses, poison_price).map_err(fail)?;

        let sequence = poison + 1;
        prop_assert_eq!(delivered, len - 1);
        prop_assert_eq!(parked, 1);
        prop_assert_eq!(ids, vec![format!("0:{sequence}-{sequence}")]);
    }
}
