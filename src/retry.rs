//! Background resubmission of persisted batches.

use crate::{
    DeliveryOutcome, DeliveryPipeline, Destination, PersistedBatchStore, PersistedRecord,
    RetryConfig,
};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, warn};

/// Counts of what happened to the records visited in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Delivered and deleted.
    pub delivered: usize,
    /// Permanently rejected and deleted.
    pub dropped: usize,
    /// Failed transiently and kept for another attempt.
    pub retained: usize,
    /// Not attempted because their destination is backing off.
    pub deferred: usize,
}

impl PassSummary {
    /// Number of delivery attempts made.
    pub fn attempted(&self) -> usize {
        self.delivered + self.dropped + self.retained
    }
}

#[derive(Debug)]
struct Backoff {
    failures: u32,
    delays: ExponentialBackoff,
    not_before: Instant,
}

/// Drains the store through the pipeline.
///
/// Every pass visits each record at most once, oldest first, so a record that keeps failing
/// can't starve the others. Records are only deleted once they are delivered or permanently
/// rejected. Destinations that fail transiently back off exponentially; their records are skipped
/// until the backoff expires.
#[derive(Debug)]
pub struct RetryWorker {
    store: Arc<PersistedBatchStore>,
    pipeline: Arc<DeliveryPipeline>,
    config: RetryConfig,
    backoffs: HashMap<Destination, Backoff>,
    last_housekeeping: Option<Instant>,
    stop: Option<watch::Receiver<bool>>,
}

impl RetryWorker {
    /// Create a worker. Nothing happens until [`run_pass`](Self::run_pass) is called.
    pub fn new(
        store: Arc<PersistedBatchStore>,
        pipeline: Arc<DeliveryPipeline>,
        config: RetryConfig,
    ) -> Self {
        RetryWorker {
            store,
            pipeline,
            config,
            backoffs: HashMap::new(),
            last_housekeeping: None,
            stop: None,
        }
    }

    /// Consecutive transient failures of the destination since its last success.
    pub fn failure_count(&self, destination: &Destination) -> u32 {
        self.backoffs
            .get(destination)
            .map_or(0, |backoff| backoff.failures)
    }

    /// Visit every record currently in the store once.
    ///
    /// Records of a destination that is backing off are skipped without being read. Records that
    /// fail transiently are moved to the back of the queue at the end of the pass.
    pub async fn run_pass(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();
        let mut failed = Vec::new();

        while let Some(persisted) = self
            .store
            .dequeue_oldest_where(|destination| !self.is_backing_off(destination))
        {
            let (record, batch) = persisted.into_parts();
            // Destination of a recovered record is only known once it was read.
            if self.is_backing_off(batch.destination()) {
                self.store.release(&record);
                continue;
            }

            match self.pipeline.send(&batch).await {
                DeliveryOutcome::Success => {
                    self.backoffs.remove(batch.destination());
                    self.delete(&record);
                    summary.delivered += 1;
                }
                DeliveryOutcome::PermanentFailure => {
                    self.delete(&record);
                    summary.dropped += 1;
                }
                DeliveryOutcome::TransientFailure { retry_after } => {
                    self.back_off(batch.destination(), retry_after);
                    failed.push(record);
                    summary.retained += 1;
                }
            }

            if self.is_stopping() {
                break;
            }
            if !self.config.dispatch_interval.is_zero() {
                tokio::time::sleep(self.config.dispatch_interval).await;
            }
        }

        summary.deferred = self
            .store
            .count_queued_where(|destination| self.is_backing_off(destination));
        for record in &failed {
            self.store.requeue(record);
        }
        summary
    }

    fn delete(&self, record: &PersistedRecord) {
        // A failed delete is retried by the store; the record is not handed out again.
        if let Err(err) = self.store.delete(record) {
            warn!(
                path = %record.path().display(),
                error = %err,
                "deleting persisted record failed"
            );
        }
    }

    fn is_backing_off(&self, destination: &Destination) -> bool {
        self.backoffs
            .get(destination)
            .map_or(false, |backoff| Instant::now() < backoff.not_before)
    }

    fn back_off(&mut self, destination: &Destination, retry_after: Option<Duration>) {
        let config = &self.config;
        let backoff = self
            .backoffs
            .entry(destination.clone())
            .or_insert_with(|| Backoff {
                failures: 0,
                delays: exponential_backoff(config),
                not_before: Instant::now(),
            });
        backoff.failures = backoff.failures.saturating_add(1);
        let delay = backoff.delays.next().unwrap_or(config.max_backoff);
        let delay = retry_after.map_or(delay, |retry_after| {
            retry_after.min(config.max_backoff).max(delay)
        });
        backoff.not_before = Instant::now() + delay;
        debug!(
            instrumentation_key = destination.instrumentation_key(),
            failures = backoff.failures,
            delay_ms = delay.as_millis() as u64,
            "destination backing off"
        );
    }

    /// How long to wait before the next pass.
    fn next_wait(&self, summary: &PassSummary) -> Duration {
        if summary.attempted() > 0 {
            return self.config.dispatch_interval;
        }
        let now = Instant::now();
        self.backoffs
            .values()
            .filter(|backoff| backoff.not_before > now)
            .map(|backoff| backoff.not_before - now)
            .min()
            .map_or(self.config.idle_interval, |until_ready| {
                until_ready.min(self.config.idle_interval)
            })
            .max(self.config.dispatch_interval)
    }

    /// Pick up records written by other processes, retry failed deletions and purge expired
    /// records. Runs at most once per purge interval.
    fn housekeeping(&mut self) {
        let now = Instant::now();
        let due = self.last_housekeeping.map_or(true, |last| {
            now.duration_since(last) >= self.config.purge_interval
        });
        if !due {
            return;
        }
        self.last_housekeeping = Some(now);

        if let Err(err) = self.store.reconcile() {
            warn!(error = %err, "reconciling local storage failed");
        }
        self.store.purge_expired(SystemTime::now());
    }

    fn is_stopping(&self) -> bool {
        self.stop.as_ref().map_or(false, |stop| *stop.borrow())
    }
}

fn exponential_backoff(config: &RetryConfig) -> ExponentialBackoff {
    let mut builder = ExponentialBuilder::default()
        .with_min_delay(config.min_backoff)
        .with_max_delay(config.max_backoff)
        .with_factor(config.backoff_factor)
        .without_max_times();
    if config.jitter {
        builder = builder.with_jitter();
    }
    builder.build()
}

/// Handle to the background task resubmitting persisted batches.
///
/// Dropping the handle stops the task after its current pass. Use [`shutdown`](Self::shutdown) to
/// wait for it.
#[derive(Debug)]
pub struct RetryLoader {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RetryLoader {
    /// Spawn the retry loop on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(
        store: Arc<PersistedBatchStore>,
        pipeline: Arc<DeliveryPipeline>,
        config: RetryConfig,
    ) -> Self {
        let (shutdown, stop) = watch::channel(false);
        let mut worker = RetryWorker::new(store, pipeline, config);
        worker.stop = Some(stop.clone());
        let handle = tokio::spawn(run(worker, stop));
        RetryLoader { shutdown, handle }
    }

    /// Stop the loop and wait until the batch in flight, if any, is handled. Persisted records
    /// stay on disk.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "retry loop terminated abnormally");
        }
    }
}

async fn run(mut worker: RetryWorker, mut stop: watch::Receiver<bool>) {
    debug!("retry loop started");
    loop {
        worker.housekeeping();
        let summary = worker.run_pass().await;
        if summary != PassSummary::default() {
            debug!(
                delivered = summary.delivered,
                dropped = summary.dropped,
                retained = summary.retained,
                deferred = summary.deferred,
                "retry pass finished"
            );
        }
        if *stop.borrow() {
            break;
        }

        let wait = worker.next_wait(&summary);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!("retry loop stopped");
}
