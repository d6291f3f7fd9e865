//! Session subsystem configuration and durability levels
//!
//! Provides options for balancing write latency against crash safety of the
//! write-ahead log and the persisted session table.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Durability level
///
/// Trades data safety against write throughput:
/// - Synchronous: safest, fsync on every append / commit
/// - Periodic: a background thread fsyncs at a fixed interval
/// - NoSync: never fsync, testing only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// fsync before returning from every append or table commit
    ///
    /// Zero data loss after a crash. Equivalent to PostgreSQL
    /// `synchronous_commit = on`.
    Synchronous,

    /// Background fsync every `interval_ms`
    ///
    /// A crash may lose up to one interval of writes.
    Periodic {
        /// Flush interval in milliseconds (default 100ms)
        interval_ms: u64,
    },

    /// Data only reaches the OS page cache. Testing and benchmarks only.
    NoSync,
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        DurabilityLevel::Synchronous
    }
}

impl DurabilityLevel {
    pub fn synchronous() -> Self {
        Self::Synchronous
    }

    pub fn periodic(interval_ms: u64) -> Self {
        Self::Periodic { interval_ms }
    }

    pub fn no_sync() -> Self {
        Self::NoSync
    }

    /// Whether each write must be fsynced before returning
    pub fn requires_immediate_sync(&self) -> bool {
        matches!(self, Self::Synchronous)
    }

    pub fn is_no_sync(&self) -> bool {
        matches!(self, Self::NoSync)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous (safest)",
            Self::Periodic { .. } => "periodic flush (fast)",
            Self::NoSync => "no sync (testing only)",
        }
    }
}

/// Write-ahead log configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OplogConfig {
    pub durability_level: DurabilityLevel,
}

/// Backoff policy for write-conflict retry loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts including the first one (None = retry until success)
    pub max_attempts: Option<u32>,

    /// First backoff delay; doubled on each further conflict
    pub initial_backoff_ms: u64,

    /// Upper bound for the backoff delay
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(100),
            initial_backoff_ms: 1,
            max_backoff_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Backoff before the given (1-based) retry attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// Session subsystem configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Write-ahead log configuration
    pub oplog: OplogConfig,

    /// fsync policy of the persisted session table snapshot
    pub table_durability: DurabilityLevel,

    /// Retry policy for secondary applies that hit write conflicts
    pub write_conflict_retry: RetryConfig,
}

impl SessionConfig {
    /// Every write fsynced before it is acknowledged
    pub fn for_durable() -> Self {
        Self {
            oplog: OplogConfig {
                durability_level: DurabilityLevel::Synchronous,
            },
            table_durability: DurabilityLevel::Synchronous,
            ..Default::default()
        }
    }

    /// Periodic log flushing with a synchronously persisted table
    pub fn for_general() -> Self {
        Self {
            oplog: OplogConfig {
                durability_level: DurabilityLevel::periodic(100),
            },
            table_durability: DurabilityLevel::Synchronous,
            ..Default::default()
        }
    }

    /// Fastest settings, no fsync and no backoff
    pub fn for_testing() -> Self {
        Self {
            oplog: OplogConfig {
                durability_level: DurabilityLevel::NoSync,
            },
            table_durability: DurabilityLevel::NoSync,
            write_conflict_retry: RetryConfig {
                max_attempts: Some(10),
                initial_backoff_ms: 0,
                max_backoff_ms: 0,
            },
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
