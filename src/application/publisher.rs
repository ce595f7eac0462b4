//! Change-suppressing batching publisher.
//!
//! A snapshot is fingerprinted over its data only; a fingerprint equal to
//! the last enqueued one for that kind is suppressed. Enqueued snapshots
//! flush through the batch queue; each kind-group in a flushed batch
//! collapses to its newest snapshot and goes out as one AMQP message. The
//! per-kind published fingerprint only advances on a confirmed publish, and
//! dead-lettering clears the enqueued fingerprint so no change is lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::batch::{BatchConfig, BatchItem, BatchQueue, BatchStats};
use crate::application::statistics::Statistics;
use crate::domain::fingerprint::{ContentDigest, Fingerprint, fingerprint_data};
use crate::domain::ports::BusSink;
use crate::domain::types::{DataKind, Snapshot};

const FLUSH_TICK: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    sink: Arc<dyn BusSink>,
    queue: BatchQueue,
    statistics: Arc<Statistics>,
    source: String,
    environment: String,
    last_enqueued: Mutex<HashMap<DataKind, Fingerprint>>,
    last_published: Mutex<HashMap<DataKind, Fingerprint>>,
    suppressed: AtomicU64,
}

impl Publisher {
    pub fn new(
        sink: Arc<dyn BusSink>,
        batch_config: BatchConfig,
        statistics: Arc<Statistics>,
        source: String,
        environment: String,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                sink,
                queue: BatchQueue::new(batch_config),
                statistics,
                source,
                environment,
                last_enqueued: Mutex::new(HashMap::new()),
                last_published: Mutex::new(HashMap::new()),
                suppressed: AtomicU64::new(0),
            }),
        }
    }

    /// Returns true when the snapshot was enqueued, false when suppressed
    /// as unchanged.
    pub async fn submit<T: Serialize + ContentDigest>(&self, snapshot: &Snapshot<T>) -> bool {
        let fingerprint = fingerprint_data(&snapshot.data);

        {
            let mut last = self.inner.last_enqueued.lock().await;
            if last.get(&snapshot.kind) == Some(&fingerprint) {
                self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Publisher: {} snapshot unchanged ({fingerprint}), suppressing",
                    snapshot.kind
                );
                return false;
            }
            last.insert(snapshot.kind, fingerprint);
        }

        let payload = self.inner.wire_message(snapshot);
        self.inner
            .queue
            .push(BatchItem::new(snapshot.kind, payload, fingerprint))
            .await;
        true
    }

    /// Background flush loop. Drains and publishes whatever is still queued
    /// when shutdown is signalled.
    pub fn spawn_flush_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(FLUSH_TICK) => {
                        while let Some(batch) = inner.queue.next_batch().await {
                            inner.publish_batch(batch).await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            let remaining = inner.queue.drain().await;
            if !remaining.is_empty() {
                info!("Publisher: flushing {} queued snapshots on shutdown", remaining.len());
                inner.publish_batch(remaining).await;
            }
            debug!("Publisher: flush loop stopped");
        })
    }

    /// Publish everything currently due. Exposed for tests and shutdown.
    pub async fn flush_now(&self) {
        while let Some(batch) = self.inner.queue.next_batch().await {
            self.inner.publish_batch(batch).await;
        }
    }

    /// Drain the queue regardless of batching strategy and publish it all.
    pub async fn drain_now(&self) {
        let remaining = self.inner.queue.drain().await;
        if !remaining.is_empty() {
            self.inner.publish_batch(remaining).await;
        }
    }

    pub fn suppressed_count(&self) -> u64 {
        self.inner.suppressed.load(Ordering::Relaxed)
    }

    pub async fn batch_stats(&self) -> BatchStats {
        self.inner.queue.stats().await
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.inner.queue.dead_letter_count().await
    }

    pub async fn last_published(&self, kind: DataKind) -> Option<Fingerprint> {
        self.inner.last_published.lock().await.get(&kind).copied()
    }
}

impl PublisherInner {
    fn wire_message<T: Serialize>(&self, snapshot: &Snapshot<T>) -> serde_json::Value {
        serde_json::json!({
            "type": snapshot.kind.as_str(),
            "timestamp": snapshot.timestamp_ms / 1000,
            "data": &snapshot.data,
            "source": &self.source,
            "environment": &self.environment,
            "collection_stats": {
                "exchanges_queried": snapshot.stats.queried,
                "successful_exchanges": snapshot.stats.succeeded,
                "failed_exchanges": snapshot.stats.failed,
                "collection_time": snapshot.stats.elapsed.as_secs_f64(),
            },
        })
    }

    /// One flushed batch: group by kind, collapse each group to its newest
    /// snapshot, publish one message per group.
    async fn publish_batch(&self, batch: Vec<BatchItem>) {
        let size = batch.len();
        let mut groups: Vec<(DataKind, Vec<BatchItem>)> = Vec::new();
        for item in batch {
            match groups.iter_mut().find(|(kind, _)| *kind == item.kind) {
                Some((_, items)) => items.push(item),
                None => groups.push((item.kind, vec![item])),
            }
        }

        let mut all_ok = true;
        for (kind, items) in groups {
            // FIFO within a kind: the last item is the newest snapshot
            let Some(newest) = items.last() else {
                continue;
            };
            let superseded = items.len() - 1;
            if superseded > 0 {
                debug!("Publisher: collapsing {superseded} superseded {kind} snapshots");
            }

            let body = match serde_json::to_vec(&newest.payload) {
                Ok(body) => body,
                Err(e) => {
                    warn!("Publisher: dropping unserializable {kind} snapshot: {e}");
                    all_ok = false;
                    continue;
                }
            };

            match self.sink.publish(&kind.routing_key(), body, None).await {
                Ok(()) => {
                    self.statistics.record_published();
                    self.last_published
                        .lock()
                        .await
                        .insert(kind, newest.fingerprint);
                    debug!(
                        "Publisher: published {kind} snapshot ({} including {superseded} superseded)",
                        items.len()
                    );
                }
                Err(e) => {
                    warn!("Publisher: {kind} publish failed: {e}");
                    all_ok = false;
                    self.statistics.record_publish_failed();
                    let dead = self.queue.requeue(items).await;
                    if !dead.is_empty() {
                        // Forget the enqueued fingerprint so the next
                        // snapshot of this kind always goes out.
                        self.last_enqueued.lock().await.remove(&kind);
                    }
                }
            }
        }

        self.queue.record_batch(size, all_ok).await;
    }
}
