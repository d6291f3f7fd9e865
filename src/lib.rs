//! MoteDB Session Transaction State
//!
//! Per-session cache of the last admitted transaction and its durable write
//! position, kept consistent with a persisted session table and a
//! write-ahead log (oplog).
//!
//! ## Architecture
//! - Storage layer: session table snapshot (bincode + CRC32, atomic rename)
//! - Transaction layer: write units of work, oplog, history walks, conflict retry
//! - Session layer: refresh / admission / commit-synchronized cache, session catalog
//!
//! ## Usage
//! ```ignore
//! let session = catalog.get_or_create(session_id);
//! session.refresh_from_storage_if_needed(&op_ctx)?;
//! session.begin_txn(txn_number)?;
//!
//! let mut unit = WriteUnitOfWork::new();
//! session.on_write_op_completed_on_primary(&op_ctx, &mut unit, txn_number, vec![stmt_id], ts)?;
//! unit.commit()?;
//! ```

pub mod config;
pub mod session;
pub mod storage;
pub mod txn;
pub mod types;

mod error;

pub use config::{DurabilityLevel, OplogConfig, RetryConfig, SessionConfig};
pub use error::{ErrorCode, Result, SessionError};

pub use session::{
    ClientConnection, OperationContext, ReadConcernLevel, Session, SessionCatalog, StorageEnv,
};
pub use storage::{SessionTxnStore, SessionTxnTable, UpdateRequest, UpdateResult};
pub use txn::{OpLog, OplogEntry, OplogReader, WriteUnitOfWork};
pub use types::{SessionId, SessionTxnRecord, StmtId, TxnNumber, WriteTimestamp};
