//! Concurrent aggregation tests
//!
//! Every producer thread owns its own `SqliteStore` on a shared database file,
//! the way separate service instances would. The only coordination between
//! them is the database.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use strata_aggregator::{
    AggregationBatch, AggregationOutcome, AggregationStore, AggregatorError, BoxError,
    DeliveryGuarantee, GroupAggregator, GroupKey, GroupRequest, SqliteStore, TimeAggregator,
    TimeUnit, WindowRequest,
};
use tempfile::TempDir;

const PRODUCERS: usize = 8;

type Batches = Arc<Mutex<Vec<Vec<Vec<u8>>>>>;

fn open_stores(dir: &TempDir) -> Vec<Arc<dyn AggregationStore>> {
    let path = dir.path().join("shared.db");
    (0..PRODUCERS)
        .map(|_| {
            let store = SqliteStore::builder()
                .busy_timeout(Duration::from_secs(30))
                .open(&path)
                .unwrap();
            Arc::new(store) as Arc<dyn AggregationStore>
        })
        .collect()
}

fn batch_sink(batches: &Batches) -> impl Fn(AggregationBatch) -> Result<(), BoxError> + Send + Sync + 'static {
    let batches = Arc::clone(batches);
    move |batch: AggregationBatch| -> Result<(), BoxError> {
        batches.lock().push(batch.into_payloads());
        Ok(())
    }
}

// ============================================================================
// Group Aggregation
// ============================================================================

#[test]
fn exact_fill_delivers_one_batch() {
    const PER_PRODUCER: usize = 5;
    const GROUP_SIZE: u32 = (PRODUCERS * PER_PRODUCER) as u32;

    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir);
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(PRODUCERS));

    let handles: Vec<_> = stores
        .iter()
        .enumerate()
        .map(|(producer, store)| {
            let agg = GroupAggregator::new(Arc::clone(store), "orders", batch_sink(&batches)).unwrap();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut outcomes = Vec::new();
                for i in 0..PER_PRODUCER {
                    let payload = format!("p{}-{}", producer, i);
                    let outcome = agg
                        .add(GroupRequest::new("hot", GROUP_SIZE, payload.as_bytes()))
                        .unwrap();
                    outcomes.push(outcome);
                }
                outcomes
            })
        })
        .collect();

    let outcomes: Vec<AggregationOutcome<()>> =
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect();

    let completed = outcomes.iter().filter(|o| o.is_completed()).count();
    assert_eq!(completed, 1);

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), GROUP_SIZE as usize);
    let unique: HashSet<&Vec<u8>> = batches[0].iter().collect();
    assert_eq!(unique.len(), GROUP_SIZE as usize);

    let status = stores[0]
        .get_status(&GroupKey::new("orders", "hot"))
        .unwrap()
        .unwrap();
    assert!(status.is_complete);
    assert_eq!(status.item_count, GROUP_SIZE as u64);
}

#[test]
fn overfill_delivers_every_accepted_item_once() {
    const GROUP_SIZE: u32 = 20;

    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir);
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(PRODUCERS));

    let handles: Vec<_> = stores
        .iter()
        .enumerate()
        .map(|(producer, store)| {
            let agg = GroupAggregator::new(Arc::clone(store), "orders", batch_sink(&batches))
                .unwrap()
                .with_guarantee(DeliveryGuarantee::ExactlyOnce);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut accepted = Vec::new();
                for i in 0.. {
                    let payload = format!("p{}-{}", producer, i).into_bytes();
                    match agg.add(GroupRequest::new("hot", GROUP_SIZE, &payload)) {
                        Ok(_) => accepted.push(payload),
                        Err(AggregatorError::GroupClosed { .. }) => break,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                accepted
            })
        })
        .collect();

    let accepted: HashSet<Vec<u8>> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    let batches = batches.lock();
    assert_eq!(batches.len(), 1, "exactly one delivery");
    let delivered: HashSet<Vec<u8>> = batches[0].iter().cloned().collect();
    assert_eq!(delivered.len(), batches[0].len(), "no duplicates");
    assert!(delivered.len() >= GROUP_SIZE as usize);
    assert_eq!(delivered, accepted, "every accepted item delivered, nothing else");
}

// ============================================================================
// Time Aggregation
// ============================================================================

#[test]
fn concurrent_windows_never_share_items() {
    const PER_PRODUCER: usize = 12;
    const MAX_SIZE: u32 = 5;

    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir);
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(PRODUCERS));

    let handles: Vec<_> = stores
        .iter()
        .enumerate()
        .map(|(producer, store)| {
            let agg = TimeAggregator::new(Arc::clone(store), batch_sink(&batches));
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut accepted = Vec::new();
                for i in 0..PER_PRODUCER {
                    let payload = format!("p{}-{}", producer, i).into_bytes();
                    // A window can close repeatedly under contention; offer again
                    loop {
                        let request = WindowRequest::new("batch", 1, TimeUnit::Hours, &payload)
                            .max_size(MAX_SIZE);
                        match agg.add(request) {
                            Ok(_) => break,
                            Err(AggregatorError::GroupClosed { .. }) => continue,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                    accepted.push(payload);
                }
                accepted
            })
        })
        .collect();

    let accepted: HashSet<Vec<u8>> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(accepted.len(), PRODUCERS * PER_PRODUCER);

    // Delivered windows plus whatever sits in the open window account for
    // every accepted item exactly once
    let mut seen: Vec<Vec<u8>> = batches.lock().iter().flatten().cloned().collect();
    let latest = stores[0].latest_group("batch").unwrap().unwrap();
    if !latest.is_complete {
        seen.extend(
            stores[0]
                .fetch_ordered_items(&latest.key)
                .unwrap()
                .into_iter()
                .map(|item| item.payload),
        );
    }
    let unique: HashSet<Vec<u8>> = seen.iter().cloned().collect();
    assert_eq!(unique.len(), seen.len(), "no item in two windows");
    assert_eq!(unique, accepted);

    for batch in batches.lock().iter() {
        assert!(batch.len() >= MAX_SIZE as usize);
    }
}
