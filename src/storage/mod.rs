//! Storage layer implementation
//!
//! Persists one transaction row per session in a checksummed snapshot file

pub mod checksum;
pub mod session_table;
pub mod update;

pub use checksum::{Checksum, ChecksumError};
pub use session_table::{SessionTxnStore, SessionTxnTable, SESSION_TXN_TABLE};
pub use update::{RecordFilter, UpdateRequest, UpdateResult, UpdateSpec};
