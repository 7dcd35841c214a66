use parking_lot::Mutex;
use redb::{Database, ReadableTable};
use std::sync::Arc;

use super::{box_txn_error, StoreError, SEQUENCES};

/// Monotonic counter for one partition, leased from disk in blocks.
///
/// The persisted value is the first id the next lease will hand out. A
/// crash loses whatever was left of the current block, so ids may skip
/// across restarts but never repeat.
pub struct Sequence {
    db: Arc<Database>,
    key: Vec<u8>,
    bandwidth: u64,
    lease: Mutex<Lease>,
}

#[derive(Default)]
struct Lease {
    next: u64,
    leased: u64,
}

impl Sequence {
    pub(super) fn new(db: Arc<Database>, key: Vec<u8>, bandwidth: u64) -> Self {
        Self {
            db,
            key,
            bandwidth: bandwidth.max(1),
            lease: Mutex::new(Lease::default()),
        }
    }

    pub fn next(&self) -> Result<u64, StoreError> {
        let mut lease = self.lease.lock();
        if lease.next >= lease.leased {
            self.renew(&mut lease)?;
        }
        let id = lease.next;
        lease.next += 1;
        Ok(id)
    }

    fn renew(&self, lease: &mut Lease) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(box_txn_error)?;
        let start = {
            let mut table = txn.open_table(SEQUENCES)?;
            let start = table.get(self.key.as_slice())?.map(|g| g.value()).unwrap_or(0);
            table.insert(self.key.as_slice(), start + self.bandwidth)?;
            start
        };
        txn.commit()?;

        lease.next = start;
        lease.leased = start + self.bandwidth;
        Ok(())
    }

    /// Gives back the unused part of the current lease.
    pub fn release(&self) -> Result<(), StoreError> {
        let mut lease = self.lease.lock();
        if lease.leased == 0 || lease.next == lease.leased {
            return Ok(());
        }

        let txn = self.db.begin_write().map_err(box_txn_error)?;
        {
            let mut table = txn.open_table(SEQUENCES)?;
            let stored = table.get(self.key.as_slice())?.map(|g| g.value());
            // only if nobody leased past us in the meantime
            if stored == Some(lease.leased) {
                table.insert(self.key.as_slice(), lease.next)?;
            }
        }
        txn.commit()?;

        lease.leased = lease.next;
        Ok(())
    }
}
