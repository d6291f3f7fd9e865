//! Write timestamp: position of a write in the write-ahead log

use serde::{Deserialize, Serialize};
use std::fmt;

/// Totally ordered position of an entry in the write-ahead log
///
/// Zero is the null position and means "no write yet".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteTimestamp(u64);

impl WriteTimestamp {
    pub const NULL: WriteTimestamp = WriteTimestamp(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The position immediately after this one, None once the space is exhausted
    pub fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl From<u64> for WriteTimestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for WriteTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts({})", self.0)
    }
}
