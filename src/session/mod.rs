//! Session transaction-state cache
//!
//! One [`Session`] per logical session caches the row of the persisted session
//! table: the most recently admitted transaction number and the record of its
//! last durable write. The cache is filled lazily by
//! [`Session::refresh_from_storage_if_needed`] and updated after a write only
//! when the write's unit of work commits.
//!
//! ## Locking
//! A single mutex guards the cached fields. It is never held across storage
//! I/O: refresh reads the table unlocked and detects a racing
//! [`Session::invalidate`] through the invalidation counter, and commit
//! callbacks merge monotonically so they may run in any order.
//!
//! ```text
//!            invalidate()
//!   Valid ────────────────> Invalid ──refresh──> Valid
//!     │ begin_txn / commit merge
//!     └────────┐
//!              ▼ (active txn never decreases while valid)
//! ```

mod catalog;
mod context;
mod fail_point;

pub use catalog::SessionCatalog;
pub use context::{ClientConnection, OperationContext, ReadConcernLevel, StorageEnv};
pub use fail_point::{FailPoint, FailPointMode, FailPointRegistry, PrimaryWriteFailure};

use crate::storage::{UpdateRequest, SESSION_TXN_TABLE};
use crate::txn::{write_conflict_retry, OplogEntry, TransactionHistoryIterator, WriteUnitOfWork};
use crate::types::{SessionId, SessionTxnRecord, StmtId, TxnNumber, WriteTimestamp};
use crate::{Result, SessionError};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Default)]
struct SessionState {
    is_valid: bool,
    /// Bumped by every invalidation
    num_invalidations: u64,
    /// None until a transaction is admitted or loaded
    active_txn_number: Option<TxnNumber>,
    last_written_record: Option<SessionTxnRecord>,
}

pub struct Session {
    session_id: SessionId,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    /// New, not yet loaded, session cache
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().is_valid
    }

    pub fn active_txn_number(&self) -> Result<Option<TxnNumber>> {
        let state = self.state.lock();
        self.check_valid(&state)?;
        Ok(state.active_txn_number)
    }

    pub fn last_written_record(&self) -> Result<Option<SessionTxnRecord>> {
        let state = self.state.lock();
        self.check_valid(&state)?;
        Ok(state.last_written_record)
    }

    /// Load the session's row unless the cache is already valid
    ///
    /// Retries internally whenever an invalidation races the unlocked read.
    pub fn refresh_from_storage_if_needed(&self, op_ctx: &OperationContext) -> Result<()> {
        if op_ctx.read_concern() != ReadConcernLevel::Local {
            return Err(SessionError::UnsupportedReadConcern(op_ctx.read_concern()));
        }

        let mut state = self.state.lock();
        while !state.is_valid {
            let epoch = state.num_invalidations;

            let loaded = MutexGuard::unlocked(&mut state, || {
                op_ctx.store().find_one(&self.session_id)
            })
            .map_err(|err| log_if_fatal(self.session_id, err))?;

            if !state.is_valid && state.num_invalidations == epoch {
                state.active_txn_number = loaded.map(|record| record.txn_num);
                state.last_written_record = loaded;
                state.is_valid = true;
                debug!(session = %self.session_id, record = ?loaded, "session refreshed from storage");
                break;
            }

            trace!(session = %self.session_id, "session invalidated during refresh, reloading");
        }

        Ok(())
    }

    /// Admit `txn_number` as the session's active transaction
    pub fn begin_txn(&self, txn_number: TxnNumber) -> Result<()> {
        let mut state = self.state.lock();
        self.check_valid(&state)?;
        Self::begin_txn_locked(&mut state, self.session_id, txn_number)
    }

    /// Persist the session's row for a completed write of `txn_number`
    ///
    /// The row is written inside `unit`. The cache reflects the write only once
    /// `unit` commits; if it aborts the cache is left untouched.
    pub fn on_write_op_completed_on_primary(
        &self,
        op_ctx: &OperationContext,
        unit: &mut WriteUnitOfWork,
        txn_number: TxnNumber,
        stmt_ids_written: Vec<StmtId>,
        last_stmt_id_write_ts: WriteTimestamp,
    ) -> Result<()> {
        if last_stmt_id_write_ts.is_null() {
            return Err(SessionError::InvalidArgument(format!(
                "write for {} txnNumber {} has no write timestamp",
                self.session_id, txn_number
            )));
        }

        let update_request = {
            let state = self.state.lock();
            self.check_valid(&state)?;
            self.check_is_active_txn(&state, txn_number)?;
            self.make_update_request(state.last_written_record, txn_number, last_stmt_id_write_ts)
        };

        let result = op_ctx
            .store()
            .upsert(unit, &update_request)
            .map_err(|err| log_if_fatal(self.session_id, err))?;
        if result.is_noop() {
            debug!(
                session = %self.session_id,
                txn_number,
                "session row changed concurrently, write conflict"
            );
            return Err(SessionError::WriteConflict);
        }

        let state = Arc::clone(&self.state);
        let session_id = self.session_id;
        unit.on_commit(move || {
            let mut state = state.lock();
            Self::apply_committed_write(&mut state, session_id, txn_number, last_stmt_id_write_ts);
        });

        trace!(
            session = %self.session_id,
            txn_number,
            stmts = ?stmt_ids_written,
            ts = %last_stmt_id_write_ts,
            "session write staged"
        );

        if let Some(failure) = op_ctx.fail_points().on_primary_transactional_write.evaluate() {
            warn!(
                session = %self.session_id,
                txn_number,
                ?failure,
                "onPrimaryTransactionalWrite fail point fired"
            );
            if failure.close_connection {
                op_ctx.client().end();
            }
            if let Some(code) = failure.fail_before_commit {
                return Err(SessionError::FailPointTriggered {
                    code,
                    message: format!(
                        "Failing write for {}:{} due to failpoint. The write must not be reflected.",
                        self.session_id, txn_number
                    ),
                });
            }
        }

        Ok(())
    }

    /// Apply a record replicated from the primary, in its own unit of work
    ///
    /// The record is authoritative and replaces the stored row. Cached session
    /// state is not touched.
    pub fn update_session_record_on_secondary(
        op_ctx: &OperationContext,
        record: &SessionTxnRecord,
    ) -> Result<()> {
        let update_request = UpdateRequest::upsert_by_session_id(*record);

        write_conflict_retry(
            &op_ctx.config().write_conflict_retry,
            "updateSessionEntry",
            SESSION_TXN_TABLE,
            || {
                let mut unit = WriteUnitOfWork::new();
                op_ctx
                    .store()
                    .upsert(&mut unit, &update_request)
                    .map_err(|err| log_if_fatal(record.session_id, err))?;
                unit.commit().map_err(|err| log_if_fatal(record.session_id, err))
            },
        )
    }

    /// Drop all cached state; reads fail until the next refresh
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.is_valid = false;
        state.num_invalidations += 1;
        state.last_written_record = None;
        state.active_txn_number = None;
        trace!(session = %self.session_id, epoch = state.num_invalidations, "session invalidated");
    }

    /// Timestamp of the last write of `txn_number`, null if it has none
    pub fn get_last_write_ts(&self, txn_number: TxnNumber) -> Result<WriteTimestamp> {
        let state = self.state.lock();
        self.check_valid(&state)?;
        self.check_is_active_txn(&state, txn_number)?;

        Ok(match state.last_written_record {
            Some(record) if record.txn_num == txn_number => record.last_write_ts,
            _ => WriteTimestamp::NULL,
        })
    }

    /// The oplog entry of `stmt_id` if transaction `txn_number` already wrote it
    pub fn check_statement_executed(
        &self,
        op_ctx: &OperationContext,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Option<OplogEntry>> {
        let last_write_ts = {
            let state = self.state.lock();
            self.check_valid(&state)?;
            self.check_is_active_txn(&state, txn_number)?;

            match state.last_written_record {
                Some(record) if record.txn_num == txn_number => record.last_write_ts,
                _ => return Ok(None),
            }
        };

        let mut history = TransactionHistoryIterator::new(last_write_ts);
        while history.has_next() {
            let entry = history.next(op_ctx.oplog())?;
            if entry.session_id != Some(self.session_id) || entry.txn_number != Some(txn_number) {
                return Err(SessionError::IncompleteTransactionHistory(format!(
                    "oplog entry at {} does not belong to transaction {} of session {}",
                    entry.ts, txn_number, self.session_id
                )));
            }
            // Entries without a statement id never match
            if entry.stmt_id == Some(stmt_id) {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    fn begin_txn_locked(
        state: &mut SessionState,
        session_id: SessionId,
        txn_number: TxnNumber,
    ) -> Result<()> {
        match state.active_txn_number {
            Some(active) if txn_number < active => Err(SessionError::TransactionTooOld(format!(
                "Cannot start transaction {} on session {} because a newer transaction {} has already started.",
                txn_number, session_id, active
            ))),
            Some(active) if txn_number == active => Ok(()),
            _ => {
                state.active_txn_number = Some(txn_number);
                debug!(session = %session_id, txn_number, "transaction admitted");
                Ok(())
            }
        }
    }

    /// Merge a committed write into the cache
    fn apply_committed_write(
        state: &mut SessionState,
        session_id: SessionId,
        txn_number: TxnNumber,
        last_write_ts: WriteTimestamp,
    ) {
        // A later refresh reloads the committed row
        if !state.is_valid {
            debug!(session = %session_id, txn_number, "session invalid at commit, skipping cache merge");
            return;
        }

        // Superseded by a newer transaction while the unit was open
        if Self::begin_txn_locked(state, session_id, txn_number).is_err() {
            trace!(session = %session_id, txn_number, "skipping cache merge for superseded transaction");
            return;
        }

        match state.last_written_record.as_mut() {
            None => {
                state.last_written_record =
                    Some(SessionTxnRecord::new(session_id, txn_number, last_write_ts));
            }
            Some(record) => {
                if txn_number > record.txn_num {
                    record.txn_num = txn_number;
                }
                if last_write_ts > record.last_write_ts {
                    record.last_write_ts = last_write_ts;
                }
            }
        }
    }

    fn make_update_request(
        &self,
        previous: Option<SessionTxnRecord>,
        txn_number: TxnNumber,
        last_write_ts: WriteTimestamp,
    ) -> UpdateRequest {
        match previous {
            Some(previous) => UpdateRequest::set_if_unchanged(previous, txn_number, last_write_ts),
            None => UpdateRequest::insert_new(SessionTxnRecord::new(
                self.session_id,
                txn_number,
                last_write_ts,
            )),
        }
    }

    fn check_valid(&self, state: &SessionState) -> Result<()> {
        if !state.is_valid {
            return Err(SessionError::ConflictingOperationInProgress(format!(
                "Session {} was concurrently modified and the operation must be retried.",
                self.session_id
            )));
        }
        Ok(())
    }

    fn check_is_active_txn(&self, state: &SessionState, txn_number: TxnNumber) -> Result<()> {
        match state.active_txn_number {
            Some(active) if active == txn_number => Ok(()),
            active => Err(SessionError::ConflictingOperationInProgress(format!(
                "Cannot perform operations on transaction {} on session {} because a different transaction {:?} is now active.",
                txn_number, self.session_id, active
            ))),
        }
    }
}

/// Report a missing session table; every other error passes through quietly
fn log_if_fatal(session_id: SessionId, err: SessionError) -> SessionError {
    if err.is_fatal() {
        error!(session = %session_id, namespace = SESSION_TXN_TABLE, error = %err, "session table missing");
    }
    err
}
