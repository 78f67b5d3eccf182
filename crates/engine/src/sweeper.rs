//! Eviction sweeper background task
//!
//! Eviction is normally evaluated only when an item arrives, so an idle group
//! past its deadline would never complete on its own. [`EvictionSweeper`]
//! closes that gap: it periodically asks the store for open groups whose
//! stored eviction timeout (or window period) has elapsed and runs the
//! completion protocol for each of them.
//!
//! # Design Notes
//!
//! - Completion goes through [`CompletionDelivery`], so the sweeper races
//!   with item-triggered completion exactly like two strategy callers do
//! - Runs in a background thread, doesn't block writers
//! - Graceful shutdown via atomic flag
//! - Configurable check interval

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aggregator_core::Result;
use aggregator_storage::AggregationStore;
use tracing::{debug, error, info, warn};

use crate::delivery::{AggregationOutcome, CompletionConsumer, CompletionDelivery};

/// Slice the sleep so shutdown is noticed promptly
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Shortest interval between sweeps; shorter requests are raised to this
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Overdue groups found
    pub due: usize,
    /// Groups this sweep delivered
    pub delivered: usize,
    /// Groups someone else completed first
    pub completed_elsewhere: usize,
    /// Groups whose completion failed
    pub failed: usize,
}

struct SweepTask<C> {
    store: Arc<dyn AggregationStore>,
    delivery: CompletionDelivery,
    consumer: C,
}

impl<C: CompletionConsumer> SweepTask<C> {
    fn sweep(&self) -> Result<SweepReport> {
        let due = self.store.open_groups_due(self.store.now())?;
        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };

        for status in due {
            match self.delivery.complete(&status.key, &self.consumer) {
                Ok(AggregationOutcome::Completed { attributes, .. }) => {
                    debug!(
                        target: "aggregator::sweeper",
                        group = %status.key,
                        items = attributes.item_count,
                        "Evicted idle group"
                    );
                    report.delivered += 1;
                }
                Ok(_) => report.completed_elsewhere += 1,
                Err(e) => {
                    error!(
                        target: "aggregator::sweeper",
                        group = %status.key,
                        error = %e,
                        "Failed to complete overdue group"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.due > 0 {
            info!(
                target: "aggregator::sweeper",
                due = report.due,
                delivered = report.delivered,
                elsewhere = report.completed_elsewhere,
                failed = report.failed,
                "Sweep finished"
            );
        }
        Ok(report)
    }
}

/// Background completion of idle overdue groups
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let sweeper = EvictionSweeper::new(store, delivery, consumer, Duration::from_secs(1));
/// let handle = sweeper.start();
///
/// // ... aggregate ...
///
/// sweeper.shutdown();
/// handle.join().unwrap();
/// ```
pub struct EvictionSweeper<C> {
    task: Arc<SweepTask<C>>,
    check_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<C: CompletionConsumer> EvictionSweeper<C> {
    /// Create a sweeper delivering through `delivery` to `consumer`
    ///
    /// # Arguments
    ///
    /// * `store` - Store to scan for overdue groups
    /// * `delivery` - Completion protocol, normally over the same store
    /// * `consumer` - Receives evicted batches
    /// * `check_interval` - Time between sweeps, at least [`MIN_CHECK_INTERVAL`]
    pub fn new(
        store: Arc<dyn AggregationStore>,
        delivery: CompletionDelivery,
        consumer: C,
        check_interval: Duration,
    ) -> Self {
        let check_interval = if check_interval < MIN_CHECK_INTERVAL {
            warn!(
                target: "aggregator::sweeper",
                requested_ms = check_interval.as_millis() as u64,
                min_ms = MIN_CHECK_INTERVAL.as_millis() as u64,
                "Sweep interval too short, using minimum"
            );
            MIN_CHECK_INTERVAL
        } else {
            check_interval
        };
        Self {
            task: Arc::new(SweepTask {
                store,
                delivery,
                consumer,
            }),
            check_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run one sweep on the calling thread
    ///
    /// # Errors
    ///
    /// `Storage` if the overdue groups cannot be listed. Failures completing
    /// individual groups are logged and counted in the report.
    pub fn sweep_once(&self) -> Result<SweepReport> {
        self.task.sweep()
    }

    /// Time between background sweeps
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Signal the background thread to stop
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

impl<C> EvictionSweeper<C>
where
    C: CompletionConsumer + 'static,
{
    /// Start sweeping in a background thread
    ///
    /// The thread sleeps first, then sweeps, until `shutdown()` is called.
    pub fn start(&self) -> JoinHandle<()> {
        let task = Arc::clone(&self.task);
        let shutdown = Arc::clone(&self.shutdown);
        let check_interval = self.check_interval;

        thread::spawn(move || {
            info!(target: "aggregator::sweeper", interval_ms = check_interval.as_millis() as u64, "Sweeper started");
            while !shutdown.load(Ordering::Relaxed) {
                let mut slept = Duration::ZERO;
                while slept < check_interval && !shutdown.load(Ordering::Relaxed) {
                    let step = SHUTDOWN_POLL.min(check_interval - slept);
                    thread::sleep(step);
                    slept += step;
                }
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                if let Err(e) = task.sweep() {
                    error!(target: "aggregator::sweeper", error = %e, "Sweep failed");
                }
            }
            info!(target: "aggregator::sweeper", "Sweeper stopped");
        })
    }
}
