//! Transaction layer: write units of work and the write-ahead log

pub mod history;
pub mod oplog;
pub mod retry;
pub mod write_unit;

pub use history::TransactionHistoryIterator;
pub use oplog::{OpKind, OpLog, OplogDraft, OplogEntry, OplogReader};
pub use retry::write_conflict_retry;
pub use write_unit::{RecoveryChange, UnitId, UnitState, WriteUnitOfWork};
