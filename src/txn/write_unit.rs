//! Write Unit of Work
//!
//! Atomic storage write scope. Participants register changes while the unit is
//! active; `commit` makes them durable and then notifies them in registration
//! order, `abort` (or dropping the unit) rolls them back in reverse order.
//!
//! Commit callbacks registered with [`WriteUnitOfWork::on_commit`] run exactly
//! once after every change was made durable, and never if the unit aborts.

use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Global unit ID counter
static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Unit of work identifier
pub type UnitId = u64;

/// A change participating in a unit of work
pub trait RecoveryChange: Send {
    /// Make the change durable. An error aborts the whole unit.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called after every change of the unit was prepared
    fn commit(self: Box<Self>);

    /// Called when the unit aborts, whether or not `prepare` ran
    fn rollback(self: Box<Self>);
}

/// Commit-only closure adapter
struct CommitHandler<F>(F);

impl<F> RecoveryChange for CommitHandler<F>
where
    F: FnOnce() + Send,
{
    fn commit(self: Box<Self>) {
        (self.0)()
    }

    fn rollback(self: Box<Self>) {}
}

/// Unit state
///
/// State transitions:
/// ```text
/// Active ──commit──> Committed
///   │
///   └──abort/drop/prepare failure──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Active,
    Committed,
    Aborted,
}

pub struct WriteUnitOfWork {
    id: UnitId,
    state: UnitState,
    changes: Vec<Box<dyn RecoveryChange>>,
}

impl WriteUnitOfWork {
    pub fn new() -> Self {
        Self {
            id: NEXT_UNIT_ID.fetch_add(1, Ordering::SeqCst),
            state: UnitState::Active,
            changes: Vec::new(),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn register_change(&mut self, change: Box<dyn RecoveryChange>) {
        self.changes.push(change);
    }

    /// Run `callback` once this unit has durably committed
    pub fn on_commit<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_change(Box::new(CommitHandler(callback)));
    }

    /// Prepare every change, then commit them in registration order
    ///
    /// If any change fails to prepare, the unit is rolled back and the error
    /// is returned; no commit callback runs.
    pub fn commit(mut self) -> Result<()> {
        let mut failure = None;
        for change in self.changes.iter_mut() {
            if let Err(err) = change.prepare() {
                failure = Some(err);
                break;
            }
        }

        if let Some(err) = failure {
            debug!(unit = self.id, error = %err, "unit of work failed to prepare, rolling back");
            self.rollback_all();
            return Err(err);
        }

        self.state = UnitState::Committed;
        for change in self.changes.drain(..) {
            change.commit();
        }

        Ok(())
    }

    /// Roll back every registered change
    pub fn abort(mut self) {
        self.rollback_all();
    }

    fn rollback_all(&mut self) {
        self.state = UnitState::Aborted;
        while let Some(change) = self.changes.pop() {
            change.rollback();
        }
    }
}

impl Default for WriteUnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WriteUnitOfWork {
    fn drop(&mut self) {
        if self.state == UnitState::Active {
            self.rollback_all();
        }
    }
}
