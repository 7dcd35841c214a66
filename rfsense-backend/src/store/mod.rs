//! Partitioned append store
//!
//! Every sample is stored under `partition ++ be_u64(sequence)` in the
//! `samples` table of a redb file, so a range scan over one partition
//! replays it in insertion order. Sequence leases live in the `sequences`
//! table, keyed by partition.

mod sequence;
mod sink;

pub use sequence::Sequence;
pub use sink::{KeyedBytes, StoreSink, StoreSource};

use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::samples::PartitionKey;

pub const DEFAULT_BANDWIDTH: u64 = 65_000;

const SAMPLES: TableDefinition<'static, &[u8], &[u8]> = TableDefinition::new("samples");
const SEQUENCES: TableDefinition<'static, &[u8], u64> = TableDefinition::new("sequences");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("cannot prepare store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty partition key")]
    EmptyPartition,
    #[error("store is closed")]
    Closed,
}

fn box_txn_error(e: redb::TransactionError) -> StoreError {
    StoreError::Transaction(Box::new(e))
}

/// One stored sample, as found by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

pub fn entry_key(partition: &PartitionKey, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(partition.as_bytes().len() + 8);
    key.extend_from_slice(partition.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

pub struct AppendStore {
    db: Arc<Database>,
    bandwidth: u64,
    sequences: RwLock<HashMap<PartitionKey, Arc<Sequence>>>,
    closed: AtomicBool,
}

impl AppendStore {
    /// Opens or creates the store file, creating both tables eagerly.
    pub fn open(path: impl AsRef<Path>, bandwidth: u64) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let db = Database::create(path)?;
        {
            let txn = db.begin_write().map_err(box_txn_error)?;
            let _ = txn.open_table(SAMPLES)?;
            let _ = txn.open_table(SEQUENCES)?;
            txn.commit()?;
        }
        info!(path = %path.display(), bandwidth, "sample store opened");

        Ok(Self {
            db: Arc::new(db),
            bandwidth,
            sequences: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The partition's sequence, created on first use and cached until close.
    pub fn sequence(&self, partition: &PartitionKey) -> Result<Arc<Sequence>, StoreError> {
        if partition.is_empty() {
            return Err(StoreError::EmptyPartition);
        }
        if let Some(seq) = self.sequences.read().get(partition) {
            return Ok(seq.clone());
        }

        let mut sequences = self.sequences.write();
        let seq = sequences.entry(partition.clone()).or_insert_with(|| {
            debug!(partition = %partition, "new sequence");
            Arc::new(Sequence::new(
                self.db.clone(),
                partition.as_bytes().to_vec(),
                self.bandwidth,
            ))
        });
        Ok(seq.clone())
    }

    /// Writes one entry in its own transaction and returns its sequence number.
    pub fn append(&self, partition: &PartitionKey, value: &[u8]) -> Result<u64, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let seq = self.sequence(partition)?.next()?;
        let key = entry_key(partition, seq);

        let txn = self.db.begin_write().map_err(box_txn_error)?;
        {
            let mut table = txn.open_table(SAMPLES)?;
            table.insert(key.as_slice(), value)?;
        }
        txn.commit()?;
        Ok(seq)
    }

    /// Entries of exactly one partition, in sequence order.
    ///
    /// Keys of a longer partition sharing the prefix (`c1_s10` vs `c1_s1`)
    /// fall inside the byte range too; they are told apart by key length.
    pub fn scan(
        &self,
        partition: &PartitionKey,
        range: impl RangeBounds<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let first = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => match s.checked_add(1) {
                Some(s) => s,
                None => return Ok(Vec::new()),
            },
            Bound::Unbounded => 0,
        };
        let last = match range.end_bound() {
            Bound::Included(&e) => e,
            Bound::Excluded(&e) => match e.checked_sub(1) {
                Some(e) => e,
                None => return Ok(Vec::new()),
            },
            Bound::Unbounded => u64::MAX,
        };
        if first > last {
            return Ok(Vec::new());
        }

        let lower = entry_key(partition, first);
        let upper = entry_key(partition, last);
        let key_len = lower.len();
        let limit = limit.unwrap_or(usize::MAX);

        let txn = self.db.begin_read().map_err(box_txn_error)?;
        let table = txn.open_table(SAMPLES)?;
        let mut out = Vec::new();
        for entry in table.range(lower.as_slice()..=upper.as_slice())? {
            if out.len() >= limit {
                break;
            }
            let (k, v) = entry?;
            let k = k.value();
            if k.len() != key_len {
                continue;
            }
            let mut seq = [0u8; 8];
            seq.copy_from_slice(&k[key_len - 8..]);
            out.push(StoredEntry {
                seq: u64::from_be_bytes(seq),
                bytes: v.value().to_vec(),
            });
        }
        Ok(out)
    }

    /// Every partition that ever leased a sequence.
    pub fn partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        let txn = self.db.begin_read().map_err(box_txn_error)?;
        let table = txn.open_table(SEQUENCES)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (k, _) = entry?;
            out.push(PartitionKey::from_bytes(k.value()));
        }
        Ok(out)
    }

    /// Releases every cached sequence and refuses further appends.
    /// Commits are already durable, so nothing else needs flushing.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sequences: Vec<_> = self.sequences.write().drain().collect();
        let mut first_err = None;
        for (partition, seq) in sequences {
            if let Err(e) = seq.release() {
                warn!(partition = %partition, error = %e, "sequence release failed");
                first_err.get_or_insert(e);
            }
        }
        info!("sample store closed");
        first_err.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
