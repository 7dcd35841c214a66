use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{AppendStore, StoredEntry};
use crate::pipeline::IngestStats;
use crate::samples::PartitionKey;
use crate::stream::{channel, Sink, SinkHandle, Source};

/// A value ready to be written, tagged with its partition.
#[derive(Debug, Clone)]
pub struct KeyedBytes {
    pub partition: PartitionKey,
    pub bytes: Vec<u8>,
}

/// Writes keyed values one at a time on a blocking worker. This single
/// worker is what keeps sequence numbers ordered per partition. When the
/// inlet closes the store is closed, releasing its sequences.
pub struct StoreSink {
    store: Arc<AppendStore>,
    stats: Arc<IngestStats>,
}

impl StoreSink {
    pub fn new(store: Arc<AppendStore>, stats: Arc<IngestStats>) -> Self {
        Self { store, stats }
    }
}

impl Sink<KeyedBytes> for StoreSink {
    fn into_parts(self) -> (mpsc::Sender<KeyedBytes>, SinkHandle) {
        let (tx, mut rx) = channel::<KeyedBytes>();
        let Self { store, stats } = self;

        let task = tokio::task::spawn_blocking(move || {
            while let Some(item) = rx.blocking_recv() {
                match store.append(&item.partition, &item.bytes) {
                    Ok(seq) => {
                        stats.stored.fetch_add(1, Ordering::Relaxed);
                        debug!(partition = %item.partition, seq, "sample stored");
                    }
                    Err(e) => {
                        stats.write_errors.fetch_add(1, Ordering::Relaxed);
                        error!(partition = %item.partition, error = %e, "sample write failed");
                    }
                }
            }
            if let Err(e) = store.close() {
                warn!(error = %e, "store close reported errors");
            }
        });

        (tx, SinkHandle::new(task))
    }
}

/// Replays one partition in sequence order.
pub struct StoreSource {
    store: Arc<AppendStore>,
    partition: PartitionKey,
    from: Bound<u64>,
    limit: Option<usize>,
}

impl StoreSource {
    pub fn new(store: Arc<AppendStore>, partition: PartitionKey) -> Self {
        Self {
            store,
            partition,
            from: Bound::Unbounded,
            limit: None,
        }
    }

    pub fn starting_at(mut self, seq: u64) -> Self {
        self.from = Bound::Included(seq);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl Source<StoredEntry> for StoreSource {
    fn into_outlet(self) -> mpsc::Receiver<StoredEntry> {
        let (tx, rx) = channel();
        tokio::spawn(async move {
            let Self {
                store,
                partition,
                from,
                limit,
            } = self;
            let scanned = {
                let partition = partition.clone();
                tokio::task::spawn_blocking(move || store.scan(&partition, (from, Bound::Unbounded), limit))
                    .await
            };
            let entries = match scanned {
                Ok(Ok(entries)) => entries,
                Ok(Err(e)) => {
                    error!(partition = %partition, error = %e, "replay scan failed");
                    return;
                }
                Err(e) => {
                    error!(partition = %partition, error = %e, "replay scan panicked");
                    return;
                }
            };
            for entry in entries {
                if tx.send(entry).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}
