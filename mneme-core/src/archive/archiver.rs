//! Cold tier archiver
//!
//! `enqueue` hands a record to a bounded in-memory queue and returns
//! immediately; it never touches the durable store. A background loop drains
//! the queue in batches, triggered by size or by the flush interval.
//!
//! Failure handling:
//! - a transient failure (store unreachable) keeps the batch in a retry buffer
//!   and backs off; the buffer is retried before anything new is dequeued, so
//!   a long outage fills the queue and `enqueue` starts reporting backpressure
//! - a permanent failure splits the batch and writes records one by one; a
//!   record that keeps failing is moved to the dead-letter listing

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::ColdStore;
use crate::config::ColdTierConfig;
use crate::error::{MnemeError, Result};
use crate::memory::records::ArchiveRecord;

/// A record that could not be archived
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub record_id: String,
    pub record: ArchiveRecord,
    pub error: String,
    pub attempts: usize,
    pub failed_at: DateTime<Utc>,
}

/// Archiver health signals
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiverStats {
    /// Records queued or waiting for retry
    pub queue_depth: usize,
    pub queue_capacity: usize,
    /// Records dequeued whose write is being retried
    pub pending_retry: usize,
    pub written: u64,
    pub failed_batches: u64,
    pub dead_letters: usize,
    /// Dead letters discarded because the listing was full
    pub dead_letters_dropped: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct PendingRecord {
    record: ArchiveRecord,
    attempts: usize,
}

#[derive(Debug, Default)]
struct FailureInfo {
    at: Option<DateTime<Utc>>,
    error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
}

/// Batched, asynchronous writer into the cold store
pub struct ColdTierArchiver {
    config: ColdTierConfig,
    store: Arc<dyn ColdStore>,
    tx: mpsc::Sender<ArchiveRecord>,
    rx: tokio::sync::Mutex<mpsc::Receiver<ArchiveRecord>>,
    retry_buffer: Mutex<VecDeque<PendingRecord>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    batch_ready: Notify,
    written: AtomicU64,
    failed_batches: AtomicU64,
    dead_letters_dropped: AtomicU64,
    consecutive_failures: AtomicUsize,
    failure: Mutex<FailureInfo>,
}

impl std::fmt::Debug for ColdTierArchiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColdTierArchiver")
            .field("queue_depth", &self.queue_depth())
            .field("batch_size", &self.config.batch_size)
            .finish()
    }
}

impl ColdTierArchiver {
    pub fn new(config: ColdTierConfig, store: Arc<dyn ColdStore>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            store,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            retry_buffer: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            batch_ready: Notify::new(),
            written: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            dead_letters_dropped: AtomicU64::new(0),
            consecutive_failures: AtomicUsize::new(0),
            failure: Mutex::new(FailureInfo::default()),
        }
    }

    /// Queue a record for archiving without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`MnemeError::Backpressure`] when the queue is full and
    /// [`MnemeError::InvalidRecord`] for a malformed record.
    pub fn enqueue(&self, record: ArchiveRecord) -> Result<()> {
        record.validate()?;
        match self.tx.try_send(record) {
            Ok(()) => {
                if self.queued() >= self.config.batch_size {
                    self.batch_ready.notify_one();
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(MnemeError::Backpressure {
                depth: self.queue_depth(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(MnemeError::Other("archiver queue is closed".to_string()))
            }
        }
    }

    /// Write one batch. Returns how many records reached the store.
    ///
    /// The retry buffer is always drained before new records are dequeued.
    ///
    /// # Errors
    ///
    /// Returns the store error when a transient failure left the batch
    /// buffered for retry.
    pub async fn flush_batch(&self) -> Result<usize> {
        let batch = self.next_batch().await;
        if batch.is_empty() {
            return Ok(0);
        }

        let records: Vec<ArchiveRecord> = batch.iter().map(|p| p.record.clone()).collect();
        match self.store.write_batch(&records).await {
            Ok(()) => {
                self.record_success(records.len());
                debug!(records = records.len(), "Archived batch");
                Ok(records.len())
            }
            Err(e) if e.is_transient() => {
                self.record_failure(&e);
                warn!(
                    records = batch.len(),
                    depth = self.queue_depth() + batch.len(),
                    error = %e,
                    "Cold store unavailable, batch kept for retry"
                );
                self.requeue_front(batch);
                Err(e)
            }
            Err(e) => {
                self.record_failure(&e);
                warn!(records = batch.len(), error = %e, "Batch rejected, isolating records");
                self.write_individually(batch).await
            }
        }
    }

    /// Flush until the queue is empty or a write fails
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.flush_batch().await? {
                0 => return Ok(total),
                n => total += n,
            }
        }
    }

    /// Background loop: flush on size or interval, back off on failure.
    ///
    /// On cancellation the queue is drained, retrying transient failures up
    /// to the configured attempt limit.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            batch_size = self.config.batch_size,
            capacity = self.config.queue_capacity,
            "Cold tier archiver started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.batch_ready.notified() => {}
            }

            if let Err(e) = self.drain().await {
                let attempt = self.consecutive_failures.load(Ordering::Relaxed);
                let delay = self
                    .config
                    .retry
                    .delay_for_attempt(attempt.saturating_sub(1));
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Archiver backing off");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.shutdown_drain().await;
    }

    async fn shutdown_drain(&self) {
        let max_attempts = self.config.retry.max_attempts.max(1);
        for attempt in 0..max_attempts {
            match self.drain().await {
                Ok(written) => {
                    info!(written, "Cold tier archiver drained");
                    return;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Shutdown drain failed");
                    tokio::time::sleep(self.config.retry.delay_for_attempt(attempt)).await;
                }
            }
        }
        error!(
            depth = self.queue_depth(),
            "Cold tier archiver stopped with records still queued"
        );
    }

    /// Records queued plus records waiting for retry
    pub fn queue_depth(&self) -> usize {
        self.queued() + self.retry_buffer.lock().len()
    }

    /// Current dead letters, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    /// Move dead letters back onto the queue.
    ///
    /// Returns how many were re-queued; the rest stay listed.
    pub fn replay_dead_letters(&self) -> usize {
        let letters: Vec<DeadLetter> = self.dead_letters.lock().drain(..).collect();
        let mut requeued = 0;
        let mut kept = VecDeque::new();
        for letter in letters {
            match self.tx.try_send(letter.record.clone()) {
                Ok(()) => requeued += 1,
                Err(_) => kept.push_back(letter),
            }
        }
        if !kept.is_empty() {
            let mut dead = self.dead_letters.lock();
            kept.extend(dead.drain(..));
            *dead = kept;
        }
        if requeued > 0 {
            info!(requeued, "Replayed dead letters");
        }
        requeued
    }

    pub fn stats(&self) -> ArchiverStats {
        let failure = self.failure.lock();
        ArchiverStats {
            queue_depth: self.queue_depth(),
            queue_capacity: self.tx.max_capacity(),
            pending_retry: self.retry_buffer.lock().len(),
            written: self.written.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.lock().len(),
            dead_letters_dropped: self.dead_letters_dropped.load(Ordering::Relaxed),
            last_failure_at: failure.at,
            last_error: failure.error.clone(),
            last_success_at: failure.last_success_at,
        }
    }

    fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    async fn next_batch(&self) -> Vec<PendingRecord> {
        let batch_size = self.config.batch_size.max(1);
        {
            let mut buffer = self.retry_buffer.lock();
            if !buffer.is_empty() {
                let take = buffer.len().min(batch_size);
                return buffer.drain(..take).collect();
            }
        }

        let mut rx = self.rx.lock().await;
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(record) => batch.push(PendingRecord { record, attempts: 0 }),
                Err(_) => break,
            }
        }
        batch
    }

    async fn write_individually(&self, batch: Vec<PendingRecord>) -> Result<usize> {
        let mut written = 0;
        let mut retry = Vec::new();

        for mut pending in batch {
            pending.attempts += 1;
            let result = self
                .store
                .write_batch(std::slice::from_ref(&pending.record))
                .await;
            match result {
                Ok(()) => {
                    written += 1;
                }
                Err(e) if e.is_transient() => retry.push(pending),
                Err(e) if pending.attempts >= self.config.retry.max_attempts => {
                    self.dead_letter(pending, &e);
                }
                Err(_) => retry.push(pending),
            }
        }

        if written > 0 {
            self.record_success(written);
        }
        self.requeue_front(retry);
        Ok(written)
    }

    fn requeue_front(&self, records: Vec<PendingRecord>) {
        if records.is_empty() {
            return;
        }
        let mut buffer = self.retry_buffer.lock();
        for record in records.into_iter().rev() {
            buffer.push_front(record);
        }
    }

    fn dead_letter(&self, pending: PendingRecord, err: &MnemeError) {
        let record_id = pending.record.record_id();
        error!(
            record_id = %record_id,
            attempts = pending.attempts,
            error = %err,
            "Record moved to dead letters"
        );
        let mut dead = self.dead_letters.lock();
        if dead.len() >= self.config.dead_letter_limit.max(1) {
            dead.pop_front();
            self.dead_letters_dropped.fetch_add(1, Ordering::Relaxed);
        }
        dead.push_back(DeadLetter {
            record_id,
            record: pending.record,
            error: err.to_string(),
            attempts: pending.attempts,
            failed_at: Utc::now(),
        });
    }

    fn record_success(&self, count: usize) {
        self.written.fetch_add(count as u64, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.failure.lock().last_success_at = Some(Utc::now());
    }

    fn record_failure(&self, err: &MnemeError) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        let mut failure = self.failure.lock();
        failure.at = Some(Utc::now());
        failure.error = Some(err.to_string());
    }
}
