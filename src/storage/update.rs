//! Update requests against the session table

use crate::types::{SessionId, SessionTxnRecord, TxnNumber, WriteTimestamp};
use crate::{Result, SessionError};

/// Which stored row a request applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    /// The row keyed by this session
    SessionId(SessionId),
    /// The row only if it still equals this record exactly
    Exact(SessionTxnRecord),
}

/// What the request writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSpec {
    /// Overwrite the transaction number and last write position
    Set {
        txn_num: TxnNumber,
        last_write_ts: WriteTimestamp,
    },
    /// Replace the whole row
    Replace(SessionTxnRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    pub session_id: SessionId,
    pub filter: RecordFilter,
    pub update: UpdateSpec,
    pub upsert: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<SessionId>,
}

impl UpdateResult {
    /// Neither modified nor inserted a row
    pub fn is_noop(&self) -> bool {
        self.modified_count == 0 && self.upserted_id.is_none()
    }
}

/// Result of evaluating a request against the current row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpdateOutcome {
    pub result: UpdateResult,
    /// Row to stage, if the request changes anything
    pub new_row: Option<SessionTxnRecord>,
}

impl UpdateRequest {
    /// Upsert `record` keyed by its session, replacing any existing row
    pub fn upsert_by_session_id(record: SessionTxnRecord) -> Self {
        Self {
            session_id: record.session_id,
            filter: RecordFilter::SessionId(record.session_id),
            update: UpdateSpec::Replace(record),
            upsert: true,
        }
    }

    /// Advance `previous` to the new number and position, only if the stored
    /// row still equals `previous`
    pub fn set_if_unchanged(
        previous: SessionTxnRecord,
        txn_num: TxnNumber,
        last_write_ts: WriteTimestamp,
    ) -> Self {
        Self {
            session_id: previous.session_id,
            filter: RecordFilter::Exact(previous),
            update: UpdateSpec::Set {
                txn_num,
                last_write_ts,
            },
            upsert: true,
        }
    }

    /// Insert `record` as a brand-new row
    ///
    /// Matches nothing (and inserts nothing) if some other row for the session
    /// already exists.
    pub fn insert_new(record: SessionTxnRecord) -> Self {
        Self {
            session_id: record.session_id,
            filter: RecordFilter::Exact(record),
            update: UpdateSpec::Replace(record),
            upsert: true,
        }
    }

    fn matches(&self, row: &SessionTxnRecord) -> bool {
        match &self.filter {
            RecordFilter::SessionId(session_id) => row.session_id == *session_id,
            RecordFilter::Exact(expected) => row == expected,
        }
    }

    fn apply_to(&self, row: &SessionTxnRecord) -> SessionTxnRecord {
        match self.update {
            UpdateSpec::Set {
                txn_num,
                last_write_ts,
            } => SessionTxnRecord {
                txn_num,
                last_write_ts,
                ..*row
            },
            UpdateSpec::Replace(record) => record,
        }
    }

    fn document_to_insert(&self) -> SessionTxnRecord {
        match (self.update, self.filter) {
            (UpdateSpec::Replace(record), _) => record,
            (
                UpdateSpec::Set {
                    txn_num,
                    last_write_ts,
                },
                RecordFilter::Exact(seed),
            ) => SessionTxnRecord {
                txn_num,
                last_write_ts,
                ..seed
            },
            (
                UpdateSpec::Set {
                    txn_num,
                    last_write_ts,
                },
                RecordFilter::SessionId(session_id),
            ) => SessionTxnRecord::new(session_id, txn_num, last_write_ts),
        }
    }

    fn validate(&self) -> Result<()> {
        let filter_session = match &self.filter {
            RecordFilter::SessionId(session_id) => *session_id,
            RecordFilter::Exact(record) => record.session_id,
        };
        let update_session = match &self.update {
            UpdateSpec::Set { .. } => self.session_id,
            UpdateSpec::Replace(record) => record.session_id,
        };

        if filter_session != self.session_id || update_session != self.session_id {
            return Err(SessionError::InvalidArgument(format!(
                "update request for {} touches another session's row",
                self.session_id
            )));
        }

        Ok(())
    }

    /// Evaluate against the row currently visible for `session_id`
    pub(crate) fn evaluate(&self, current: Option<&SessionTxnRecord>) -> Result<UpdateOutcome> {
        self.validate()?;

        match current {
            Some(row) if self.matches(row) => {
                let updated = self.apply_to(row);
                if updated == *row {
                    return Ok(UpdateOutcome {
                        result: UpdateResult {
                            matched_count: 1,
                            ..Default::default()
                        },
                        new_row: None,
                    });
                }
                Ok(UpdateOutcome {
                    result: UpdateResult {
                        matched_count: 1,
                        modified_count: 1,
                        upserted_id: None,
                    },
                    new_row: Some(updated),
                })
            }
            // The key is taken by a row the filter does not match
            Some(_) => Ok(UpdateOutcome {
                result: UpdateResult::default(),
                new_row: None,
            }),
            None if self.upsert => Ok(UpdateOutcome {
                result: UpdateResult {
                    upserted_id: Some(self.session_id),
                    ..Default::default()
                },
                new_row: Some(self.document_to_insert()),
            }),
            None => Ok(UpdateOutcome {
                result: UpdateResult::default(),
                new_row: None,
            }),
        }
    }
}
