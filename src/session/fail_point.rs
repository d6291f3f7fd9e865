//! Fault injection hooks for tests

use crate::error::ErrorCode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// When an enabled fail point fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPointMode {
    Off,
    AlwaysOn,
    /// Fire the next `n` evaluations, then turn off
    Times(u32),
}

/// A named hook carrying data of type `T` while enabled
pub struct FailPoint<T> {
    name: &'static str,
    state: Mutex<(FailPointMode, Option<T>)>,
}

impl<T: Clone> FailPoint<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new((FailPointMode::Off, None)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enable(&self, mode: FailPointMode, data: T) {
        *self.state.lock() = (mode, Some(data));
        tracing::warn!(fail_point = self.name, ?mode, "fail point enabled");
    }

    pub fn disable(&self) {
        *self.state.lock() = (FailPointMode::Off, None);
    }

    pub fn mode(&self) -> FailPointMode {
        self.state.lock().0
    }

    /// Data of the fail point if it fires on this evaluation
    pub fn evaluate(&self) -> Option<T> {
        let mut state = self.state.lock();
        match state.0 {
            FailPointMode::Off => None,
            FailPointMode::AlwaysOn => state.1.clone(),
            FailPointMode::Times(remaining) => {
                let data = state.1.clone();
                if remaining <= 1 {
                    *state = (FailPointMode::Off, None);
                } else {
                    state.0 = FailPointMode::Times(remaining - 1);
                }
                data
            }
        }
    }
}

/// Behaviour injected after a transactional write on the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryWriteFailure {
    /// Close the client connection
    pub close_connection: bool,
    /// Fail the write before its unit of work commits
    pub fail_before_commit: Option<ErrorCode>,
}

impl Default for PrimaryWriteFailure {
    fn default() -> Self {
        Self {
            close_connection: true,
            fail_before_commit: None,
        }
    }
}

pub struct FailPointRegistry {
    pub on_primary_transactional_write: FailPoint<PrimaryWriteFailure>,
}

impl Default for FailPointRegistry {
    fn default() -> Self {
        Self {
            on_primary_transactional_write: FailPoint::new("onPrimaryTransactionalWrite"),
        }
    }
}
