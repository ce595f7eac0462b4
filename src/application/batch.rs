//! Batch queue feeding the publisher.
//!
//! Items accumulate until the strategy flushes them: by count, by age of the
//! oldest item, or whichever comes first (hybrid, the default). Failed items
//! re-enter through a retry queue until their retry budget is spent, then
//! land in the dead-letter region.

use std::collections::VecDeque;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::domain::fingerprint::Fingerprint;
use crate::domain::types::DataKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    SizeBased,
    TimeBased,
    Hybrid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub max_size: usize,
    pub max_wait_time_s: f64,
    pub strategy: BatchStrategy,
    /// Accepted for config compatibility; snapshot bodies go out as plain
    /// JSON either way.
    pub compression: bool,
    pub max_retries: u32,
    pub min_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            max_wait_time_s: 2.0,
            strategy: BatchStrategy::Hybrid,
            compression: false,
            max_retries: 3,
            min_size: 1,
        }
    }
}

impl BatchConfig {
    pub fn max_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.max_wait_time_s)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_size > 0, "batch.max_size must be positive");
        anyhow::ensure!(
            self.max_wait_time_s > 0.0,
            "batch.max_wait_time_s must be positive"
        );
        anyhow::ensure!(
            self.min_size >= 1 && self.min_size <= self.max_size,
            "batch.min_size must be in 1..=max_size"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub kind: DataKind,
    pub payload: serde_json::Value,
    pub fingerprint: Fingerprint,
    pub priority: u8,
    pub retry_count: u32,
    pub enqueued_at: Instant,
}

impl BatchItem {
    pub fn new(kind: DataKind, payload: serde_json::Value, fingerprint: Fingerprint) -> Self {
        Self {
            kind,
            payload,
            fingerprint,
            priority: kind.priority(),
            retry_count: 0,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub total_batches: u64,
    pub successful_batches: u64,
    pub failed_batches: u64,
    pub total_items: u64,
    pub dead_lettered: u64,
}

struct QueueInner {
    queue: VecDeque<BatchItem>,
    retry: VecDeque<BatchItem>,
    failed_items: Vec<BatchItem>,
    stats: BatchStats,
}

pub struct BatchQueue {
    config: BatchConfig,
    inner: Mutex<QueueInner>,
}

impl BatchQueue {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                retry: VecDeque::new(),
                failed_items: Vec::new(),
                stats: BatchStats::default(),
            }),
        }
    }

    pub async fn push(&self, item: BatchItem) {
        self.inner.lock().await.queue.push_back(item);
    }

    /// Next due batch, or None when the strategy says wait. Retried items go
    /// out ahead of fresh ones; within a batch, higher priority first.
    pub async fn next_batch(&self) -> Option<Vec<BatchItem>> {
        let mut inner = self.inner.lock().await;

        let mut batch: Vec<BatchItem> = Vec::new();
        while batch.len() < self.config.max_size {
            match inner.retry.pop_front() {
                Some(item) => batch.push(item),
                None => break,
            }
        }

        if batch.is_empty() {
            if !self.is_due(&inner.queue) {
                return None;
            }
            while batch.len() < self.config.max_size {
                match inner.queue.pop_front() {
                    Some(item) => batch.push(item),
                    None => break,
                }
            }
        }

        if batch.len() < self.config.min_size {
            for item in batch.into_iter().rev() {
                inner.queue.push_front(item);
            }
            return None;
        }

        // stable: FIFO order survives within one priority level
        batch.sort_by(|a, b| b.priority.cmp(&a.priority));
        Some(batch)
    }

    fn is_due(&self, queue: &VecDeque<BatchItem>) -> bool {
        let Some(oldest) = queue.front() else {
            return false;
        };
        let age_exceeded = oldest.enqueued_at.elapsed() >= self.config.max_wait();
        let size_reached = queue.len() >= self.config.max_size;
        match self.config.strategy {
            BatchStrategy::SizeBased => size_reached,
            BatchStrategy::TimeBased => age_exceeded,
            BatchStrategy::Hybrid => age_exceeded || size_reached,
        }
    }

    /// Re-queue a failed batch. Items beyond the retry budget move to the
    /// dead-letter region; they are returned so the caller can react.
    pub async fn requeue(&self, batch: Vec<BatchItem>) -> Vec<BatchItem> {
        let mut inner = self.inner.lock().await;
        let mut dead = Vec::new();
        for mut item in batch {
            item.retry_count += 1;
            if item.retry_count <= self.config.max_retries {
                inner.retry.push_back(item);
            } else {
                warn!(
                    "BatchQueue: {} item exceeded max retries ({}), dead-lettering",
                    item.kind, self.config.max_retries
                );
                inner.stats.dead_lettered += 1;
                dead.push(item.clone());
                inner.failed_items.push(item);
            }
        }
        dead
    }

    /// Everything still queued, ignoring flush gating. Used on shutdown.
    pub async fn drain(&self) -> Vec<BatchItem> {
        let mut inner = self.inner.lock().await;
        let mut all: Vec<BatchItem> = inner.retry.drain(..).collect();
        all.extend(inner.queue.drain(..));
        all
    }

    pub async fn record_batch(&self, size: usize, success: bool) {
        let mut inner = self.inner.lock().await;
        inner.stats.total_batches += 1;
        inner.stats.total_items += size as u64;
        if success {
            inner.stats.successful_batches += 1;
        } else {
            inner.stats.failed_batches += 1;
        }
    }

    pub async fn stats(&self) -> BatchStats {
        self.inner.lock().await.stats.clone()
    }

    pub async fn pending(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.queue.len() + inner.retry.len()
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.inner.lock().await.failed_items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fingerprint::fingerprint_symbols;

    fn item(kind: DataKind) -> BatchItem {
        BatchItem::new(kind, serde_json::json!({}), fingerprint_symbols(&[]))
    }

    fn config(strategy: BatchStrategy, max_size: usize, max_wait_s: f64) -> BatchConfig {
        BatchConfig {
            max_size,
            max_wait_time_s: max_wait_s,
            strategy,
            ..BatchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_size_based_flushes_at_capacity() {
        let queue = BatchQueue::new(config(BatchStrategy::SizeBased, 3, 60.0));
        queue.push(item(DataKind::Tickers)).await;
        queue.push(item(DataKind::Tickers)).await;
        assert!(queue.next_batch().await.is_none());

        queue.push(item(DataKind::Tickers)).await;
        let batch = queue.next_batch().await.unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_based_flushes_on_age() {
        let queue = BatchQueue::new(config(BatchStrategy::TimeBased, 100, 0.5));
        queue.push(item(DataKind::Tickers)).await;
        assert!(queue.next_batch().await.is_none());

        tokio::time::advance(std::time::Duration::from_millis(600)).await;
        let batch = queue.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hybrid_flushes_on_either() {
        let queue = BatchQueue::new(config(BatchStrategy::Hybrid, 2, 60.0));
        queue.push(item(DataKind::Tickers)).await;
        queue.push(item(DataKind::Tickers)).await;
        assert!(queue.next_batch().await.is_some());

        queue.push(item(DataKind::Tickers)).await;
        assert!(queue.next_batch().await.is_none());
        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        assert!(queue.next_batch().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_orders_within_batch() {
        let queue = BatchQueue::new(config(BatchStrategy::Hybrid, 10, 0.1));
        queue.push(item(DataKind::FundingRates)).await;
        queue.push(item(DataKind::Tickers)).await;

        tokio::time::advance(std::time::Duration::from_millis(200)).await;
        let batch = queue.next_batch().await.unwrap();
        assert_eq!(batch[0].kind, DataKind::Tickers);
        assert_eq!(batch[1].kind, DataKind::FundingRates);
    }

    #[tokio::test]
    async fn test_requeue_until_dead_letter() {
        let queue = BatchQueue::new(BatchConfig {
            max_retries: 2,
            ..config(BatchStrategy::SizeBased, 10, 60.0)
        });

        let mut batch = vec![item(DataKind::Tickers)];
        for round in 0..2 {
            let dead = queue.requeue(batch).await;
            assert!(dead.is_empty(), "dead-lettered too early in round {round}");
            batch = queue.next_batch().await.unwrap();
        }

        let dead = queue.requeue(batch).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(queue.dead_letter_count().await, 1);
        assert!(queue.next_batch().await.is_none());
        assert_eq!(queue.stats().await.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_drain_empties_everything() {
        let queue = BatchQueue::new(config(BatchStrategy::TimeBased, 10, 60.0));
        queue.push(item(DataKind::Tickers)).await;
        queue.push(item(DataKind::FundingRates)).await;
        queue.requeue(vec![item(DataKind::Tickers)]).await;

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 3);
        assert_eq!(queue.pending().await, 0);
    }
}
