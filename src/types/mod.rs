//! Session and transaction identifier types

mod record;
mod write_ts;

pub use record::SessionTxnRecord;
pub use write_ts::WriteTimestamp;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Transaction number, monotonically non-decreasing per session
///
/// "No transaction admitted yet" is `Option::<TxnNumber>::None`, which orders
/// below every `Some(n)`.
pub type TxnNumber = u64;

/// Statement identifier within a transaction
pub type StmtId = u32;

/// Logical session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random session identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsid:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(SessionId::from_uuid(*a.as_uuid()), a);
    }

    #[test]
    fn test_uninitialized_orders_below_any_number() {
        let uninitialized: Option<TxnNumber> = None;
        assert!(uninitialized < Some(0));
        assert!(Some(0) < Some(1));
    }
}
