//! Persisted session transaction table
//!
//! One row per session holding the last transaction number and write position.
//! Writes are staged inside the caller's [`WriteUnitOfWork`]:
//!
//! ```text
//! upsert ──> pending (row locked, invisible)
//!              │
//!              ├─ prepare: snapshot written with the staged row
//!              ├─ commit:  row visible, lock released
//!              └─ rollback: staged row dropped, snapshot rewritten
//! ```
//!
//! A file-backed table keeps a full snapshot, `[len][bincode rows][crc32]`,
//! replaced atomically (write to `.tmp`, then rename) on every prepare.

use super::checksum::Checksum;
use super::update::{UpdateRequest, UpdateResult};
use crate::config::DurabilityLevel;
use crate::txn::{RecoveryChange, UnitId, WriteUnitOfWork};
use crate::types::{SessionId, SessionTxnRecord};
use crate::{Result, SessionError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Namespace of the session transaction table
pub const SESSION_TXN_TABLE: &str = "config.transactions";

/// Point lookup and filtered upsert against the session table
pub trait SessionTxnStore: Send + Sync {
    fn find_one(&self, session_id: &SessionId) -> Result<Option<SessionTxnRecord>>;

    /// Stage `request` in `unit`; the write becomes visible when `unit` commits
    fn upsert(&self, unit: &mut WriteUnitOfWork, request: &UpdateRequest) -> Result<UpdateResult>;
}

struct PendingWrite {
    unit_id: UnitId,
    staged: SessionTxnRecord,
    /// Included in the on-disk snapshot
    prepared: bool,
}

#[derive(Default)]
struct TableInner {
    exists: bool,
    rows: HashMap<SessionId, SessionTxnRecord>,
    pending: HashMap<SessionId, PendingWrite>,
}

struct TableShared {
    state: RwLock<TableInner>,
    snapshot_path: Option<PathBuf>,
    durability: DurabilityLevel,
}

#[derive(Clone)]
pub struct SessionTxnTable {
    shared: Arc<TableShared>,
}

impl SessionTxnTable {
    /// Table without a backing file
    pub fn in_memory() -> Self {
        Self::with_rows(HashMap::new(), None, DurabilityLevel::NoSync)
    }

    /// Open (or create) a file-backed table
    pub fn open<P: AsRef<Path>>(path: P, durability: DurabilityLevel) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let rows = match fs::read(&path) {
            Ok(bytes) => decode_snapshot(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            rows = rows.len(),
            durability = durability.description(),
            "opened session table"
        );

        let table = Self::with_rows(rows, Some(path), durability);
        table.shared.persist(&table.shared.state.read())?;
        Ok(table)
    }

    fn with_rows(
        rows: HashMap<SessionId, SessionTxnRecord>,
        snapshot_path: Option<PathBuf>,
        durability: DurabilityLevel,
    ) -> Self {
        Self {
            shared: Arc::new(TableShared {
                state: RwLock::new(TableInner {
                    exists: true,
                    rows,
                    pending: HashMap::new(),
                }),
                snapshot_path,
                durability,
            }),
        }
    }

    /// Destroy the table out of band
    ///
    /// Every later operation fails with `NamespaceNotFound` until
    /// [`SessionTxnTable::create_table`] is called.
    pub fn drop_table(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        state.exists = false;
        state.rows.clear();
        state.pending.clear();

        if let Some(path) = &self.shared.snapshot_path {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        warn!(namespace = SESSION_TXN_TABLE, "session table dropped");
        Ok(())
    }

    /// Re-create a dropped table, empty
    pub fn create_table(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        if state.exists {
            return Ok(());
        }
        state.exists = true;
        self.shared.persist(&state)
    }

    pub fn exists(&self) -> bool {
        self.shared.state.read().exists
    }

    /// Number of committed rows
    pub fn len(&self) -> usize {
        self.shared.state.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.shared.snapshot_path.as_deref()
    }
}

impl SessionTxnStore for SessionTxnTable {
    fn find_one(&self, session_id: &SessionId) -> Result<Option<SessionTxnRecord>> {
        let state = self.shared.state.read();
        check_exists(&state)?;
        Ok(state.rows.get(session_id).copied())
    }

    fn upsert(&self, unit: &mut WriteUnitOfWork, request: &UpdateRequest) -> Result<UpdateResult> {
        let mut state = self.shared.state.write();
        check_exists(&state)?;

        let session_id = request.session_id;
        let own_staged = match state.pending.get(&session_id) {
            Some(pending) if pending.unit_id != unit.id() => {
                debug!(
                    session = %session_id,
                    holder = pending.unit_id,
                    unit = unit.id(),
                    "session row locked by another unit"
                );
                return Err(SessionError::WriteConflict);
            }
            Some(pending) => Some(pending.staged),
            None => None,
        };

        // A unit reads its own staged write
        let current = own_staged.or_else(|| state.rows.get(&session_id).copied());
        let outcome = request.evaluate(current.as_ref())?;

        if let Some(new_row) = outcome.new_row {
            if own_staged.is_some() {
                if let Some(pending) = state.pending.get_mut(&session_id) {
                    pending.staged = new_row;
                }
            } else {
                state.pending.insert(
                    session_id,
                    PendingWrite {
                        unit_id: unit.id(),
                        staged: new_row,
                        prepared: false,
                    },
                );
                unit.register_change(Box::new(StagedRowWrite {
                    shared: self.shared.clone(),
                    session_id,
                    unit_id: unit.id(),
                }));
            }
        }

        Ok(outcome.result)
    }
}

impl TableShared {
    /// Replace the snapshot file with committed rows plus prepared writes
    fn persist(&self, state: &TableInner) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let mut rows = state.rows.clone();
        for (session_id, pending) in &state.pending {
            if pending.prepared {
                rows.insert(*session_id, pending.staged);
            }
        }
        let mut records: Vec<SessionTxnRecord> = rows.into_values().collect();
        records.sort_by_key(|r| r.session_id);

        let payload = bincode::serialize(&records)?;
        let encoded = Checksum::encode_with_checksum(&payload)?;

        let tmp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&encoded)?;
        if self.durability.requires_immediate_sync() {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp_path, path)?;
        if self.durability.requires_immediate_sync() {
            if let Some(parent) = path.parent() {
                // Directory fsync is not supported everywhere
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }

        debug!(path = %path.display(), rows = records.len(), "persisted session table");
        Ok(())
    }
}

fn check_exists(state: &TableInner) -> Result<()> {
    if !state.exists {
        return Err(SessionError::NamespaceNotFound(SESSION_TXN_TABLE.to_string()));
    }
    Ok(())
}

fn decode_snapshot(bytes: &[u8]) -> Result<HashMap<SessionId, SessionTxnRecord>> {
    let payload = Checksum::decode_with_checksum(bytes)?;
    let records: Vec<SessionTxnRecord> = bincode::deserialize(&payload)?;
    Ok(records.into_iter().map(|r| (r.session_id, r)).collect())
}

/// A row staged by one unit of work
struct StagedRowWrite {
    shared: Arc<TableShared>,
    session_id: SessionId,
    unit_id: UnitId,
}

impl StagedRowWrite {
    fn owns(&self, pending: &PendingWrite) -> bool {
        pending.unit_id == self.unit_id
    }
}

impl RecoveryChange for StagedRowWrite {
    fn prepare(&mut self) -> Result<()> {
        let mut state = self.shared.state.write();
        check_exists(&state)?;

        match state.pending.get_mut(&self.session_id) {
            Some(pending) if pending.unit_id == self.unit_id => pending.prepared = true,
            _ => {
                return Err(SessionError::NamespaceNotFound(
                    SESSION_TXN_TABLE.to_string(),
                ))
            }
        }

        if let Err(err) = self.shared.persist(&state) {
            if let Some(pending) = state.pending.get_mut(&self.session_id) {
                pending.prepared = false;
            }
            return Err(err);
        }

        Ok(())
    }

    fn commit(self: Box<Self>) {
        let mut state = self.shared.state.write();
        let owned = state
            .pending
            .get(&self.session_id)
            .map_or(false, |p| self.owns(p));
        if !owned {
            return;
        }
        if let Some(pending) = state.pending.remove(&self.session_id) {
            state.rows.insert(self.session_id, pending.staged);
        }
    }

    fn rollback(self: Box<Self>) {
        let mut state = self.shared.state.write();
        let owned = state
            .pending
            .get(&self.session_id)
            .map_or(false, |p| self.owns(p));
        if !owned {
            return;
        }

        let was_prepared = state
            .pending
            .remove(&self.session_id)
            .map_or(false, |p| p.prepared);

        if was_prepared && state.exists {
            if let Err(err) = self.shared.persist(&state) {
                warn!(session = %self.session_id, error = %err, "failed to rewrite session table after rollback");
            }
        }
    }
}
