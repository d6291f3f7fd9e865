//! Per-operation context handed to session methods

use super::fail_point::FailPointRegistry;
use crate::config::SessionConfig;
use crate::storage::SessionTxnStore;
use crate::txn::OplogReader;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Read concern of the current operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadConcernLevel {
    /// Most recent locally committed snapshot
    #[default]
    Local,
    Majority,
    Linearizable,
    Snapshot,
    Available,
}

/// Client connection the operation runs on
#[derive(Debug)]
pub struct ClientConnection {
    id: u64,
    closed: AtomicBool,
}

impl ClientConnection {
    pub fn new() -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Close the connection; the client sees a network error
    pub fn end(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for ClientConnection {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage collaborators shared by every operation of a process
pub struct StorageEnv {
    pub store: Arc<dyn SessionTxnStore>,
    pub oplog: Arc<dyn OplogReader>,
    pub fail_points: FailPointRegistry,
    pub config: SessionConfig,
}

impl StorageEnv {
    pub fn new(
        store: Arc<dyn SessionTxnStore>,
        oplog: Arc<dyn OplogReader>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            oplog,
            fail_points: FailPointRegistry::default(),
            config,
        }
    }
}

pub struct OperationContext {
    env: Arc<StorageEnv>,
    client: Arc<ClientConnection>,
    read_concern: ReadConcernLevel,
}

impl OperationContext {
    /// Context with `Local` read concern
    pub fn new(env: Arc<StorageEnv>, client: Arc<ClientConnection>) -> Self {
        Self {
            env,
            client,
            read_concern: ReadConcernLevel::Local,
        }
    }

    pub fn with_read_concern(mut self, read_concern: ReadConcernLevel) -> Self {
        self.read_concern = read_concern;
        self
    }

    pub fn read_concern(&self) -> ReadConcernLevel {
        self.read_concern
    }

    pub fn store(&self) -> &dyn SessionTxnStore {
        self.env.store.as_ref()
    }

    pub fn oplog(&self) -> &dyn OplogReader {
        self.env.oplog.as_ref()
    }

    pub fn fail_points(&self) -> &FailPointRegistry {
        &self.env.fail_points
    }

    pub fn config(&self) -> &SessionConfig {
        &self.env.config
    }

    pub fn client(&self) -> &ClientConnection {
        &self.client
    }

    pub fn env(&self) -> &Arc<StorageEnv> {
        &self.env
    }
}
