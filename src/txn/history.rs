//! Backward walk over the writes of one transaction
//!
//! Each oplog entry written by a session transaction links to the previous
//! write of the same transaction. The iterator follows those links from the
//! most recent write back to the first one.

use crate::txn::oplog::{OplogEntry, OplogReader};
use crate::types::WriteTimestamp;
use crate::{Result, SessionError};

pub struct TransactionHistoryIterator {
    next_ts: Option<WriteTimestamp>,
}

impl TransactionHistoryIterator {
    /// Start at the transaction's most recent write
    pub fn new(start_ts: WriteTimestamp) -> Self {
        Self {
            next_ts: Some(start_ts).filter(|ts| !ts.is_null()),
        }
    }

    pub fn has_next(&self) -> bool {
        self.next_ts.is_some()
    }

    /// Fetch the current entry and step to its predecessor
    ///
    /// Fails with `IncompleteTransactionHistory` if the chain points at an
    /// entry the log no longer holds.
    pub fn next(&mut self, oplog: &dyn OplogReader) -> Result<OplogEntry> {
        let ts = self.next_ts.ok_or_else(|| {
            SessionError::InvalidArgument("transaction history exhausted".to_string())
        })?;

        let entry = oplog.find_entry(ts)?.ok_or_else(|| {
            SessionError::IncompleteTransactionHistory(format!(
                "oplog no longer contains the entry at {}",
                ts
            ))
        })?;

        self.next_ts = entry.prev_write_ts_in_txn.filter(|prev| !prev.is_null());
        Ok(entry)
    }
}
