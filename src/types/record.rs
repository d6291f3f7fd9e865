//! Durable per-session transaction record

use super::{SessionId, TxnNumber, WriteTimestamp};
use serde::{Deserialize, Serialize};

/// One row of the persisted session table
///
/// The row is the source of truth; the session cache is a replica of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTxnRecord {
    pub session_id: SessionId,
    pub txn_num: TxnNumber,
    pub last_write_ts: WriteTimestamp,
}

impl SessionTxnRecord {
    pub fn new(session_id: SessionId, txn_num: TxnNumber, last_write_ts: WriteTimestamp) -> Self {
        Self {
            session_id,
            txn_num,
            last_write_ts,
        }
    }
}
