//! In-Memory Transactional Engine
//!
//! A process-local implementation of the storage engine interface. It backs
//! the `tablekeep` node binary and every test in the crate.
//!
//! ## Design Decisions
//!
//! 1. **Ordered rows**: Each table keeps its rows in a `Vec` sorted by the
//!    comparator installed when the table was created.
//! 2. **Buffered transactions**: Writes are buffered in the transaction and
//!    applied atomically at commit under one commit lock.
//! 3. **Optimistic read locks**: A `ReadModifyWrite` read remembers the row
//!    version it saw; commit fails with `Conflict` if the row changed since.
//! 4. **Replication simulation**: Writes are refused on a client node, and
//!    [`MemoryEngine::reconfigure`] kills every open handle the way a
//!    topology change does in a replicated engine.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      MemoryEngine                           │
//! │  tables: RwLock<HashMap<name, TableData>>                   │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐                  │
//! │  │ users.db  │ │__expire.db│ │ ...       │  rows: RwLock    │
//! │  └───────────┘ └───────────┘ └───────────┘                  │
//! │  commit_lock: Mutex  ── serialises commits                  │
//! │  epoch: AtomicU64    ── bumped by reconfigure()             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::error::EngineError;
use crate::replication::NodeState;
use crate::storage::backend::{
    bytewise, Comparator, Cursor, Engine, Isolation, OpenOptions, PutMode, ReadLock, Table,
    TableKind, Transaction,
};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// One stored row.
#[derive(Debug, Clone)]
struct Row {
    key: Bytes,
    value: Bytes,
    /// Commit version that last wrote this row
    version: u64,
}

/// A single table.
#[derive(Debug)]
struct TableData {
    name: String,
    kind: TableKind,
    comparator: Comparator,
    rows: RwLock<Vec<Row>>,
}

impl TableData {
    fn new(name: &str, kind: TableKind, comparator: Comparator) -> Self {
        Self {
            name: name.to_string(),
            kind,
            comparator,
            rows: RwLock::new(Vec::new()),
        }
    }

    fn lookup(&self, key: &[u8]) -> Option<(Bytes, u64)> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.binary_search_by(|row| (self.comparator)(&row.key, key))
            .ok()
            .map(|i| (rows[i].value.clone(), rows[i].version))
    }

    fn version_of(&self, key: &[u8]) -> Option<u64> {
        self.lookup(key).map(|(_, version)| version)
    }

    fn upsert(&self, key: Bytes, value: Bytes, version: u64) {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        match rows.binary_search_by(|row| (self.comparator)(&row.key, &key)) {
            Ok(i) => {
                rows[i].value = value;
                rows[i].version = version;
            }
            Err(i) => rows.insert(
                i,
                Row {
                    key,
                    value,
                    version,
                },
            ),
        }
    }

    fn remove(&self, key: &[u8]) -> bool {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        match rows.binary_search_by(|row| (self.comparator)(&row.key, key)) {
            Ok(i) => {
                rows.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    fn snapshot(&self) -> Vec<(Bytes, Bytes)> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.iter()
            .map(|row| (row.key.clone(), row.value.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn same_key(&self, a: &[u8], b: &[u8]) -> bool {
        (self.comparator)(a, b) == std::cmp::Ordering::Equal
    }
}

struct EngineInner {
    tables: RwLock<HashMap<String, Arc<TableData>>>,
    state: NodeState,

    /// Bumped on every simulated topology change
    epoch: AtomicU64,

    /// Serialises commits and auto-commit writes
    commit_lock: Mutex<()>,

    /// Last assigned commit version
    version: AtomicU64,

    /// Failures returned by the next calls to `open`, in order
    open_failures: Mutex<VecDeque<EngineError>>,

    next_txn_id: AtomicU64,
    commit_count: AtomicU64,
    abort_count: AtomicU64,
    conflict_count: AtomicU64,
    open_count: AtomicU64,
}

impl EngineInner {
    fn check_writable(&self) -> Result<(), EngineError> {
        if self.state.is_master() {
            Ok(())
        } else {
            Err(EngineError::ReadOnly)
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub tables: usize,
    pub opens: u64,
    pub commits: u64,
    pub aborts: u64,
    pub conflicts: u64,
    pub epoch: u64,
}

/// The in-memory engine. Cloning shares the same tables.
///
/// # Example
///
/// ```
/// use tablekeep::replication::{NodeState, ReplicationRole};
/// use tablekeep::storage::{Engine, MemoryEngine, OpenOptions, PutMode, ReadLock, Table};
///
/// let engine = MemoryEngine::new(NodeState::new(ReplicationRole::Master));
/// let users = engine.open("users.db", OpenOptions::btree()).unwrap();
///
/// users.put(None, b"alice", b"admin", PutMode::Overwrite).unwrap();
/// let value = users.get(None, b"alice", ReadLock::None).unwrap();
/// assert_eq!(value.as_deref(), Some(&b"admin"[..]));
/// ```
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MemoryEngine")
            .field("tables", &stats.tables)
            .field("epoch", &stats.epoch)
            .field("commits", &stats.commits)
            .field("role", &self.inner.state.role())
            .finish()
    }
}

impl MemoryEngine {
    /// Creates an empty engine that follows the role in `state`.
    pub fn new(state: NodeState) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tables: RwLock::new(HashMap::new()),
                state,
                epoch: AtomicU64::new(0),
                commit_lock: Mutex::new(()),
                version: AtomicU64::new(0),
                open_failures: Mutex::new(VecDeque::new()),
                next_txn_id: AtomicU64::new(1),
                commit_count: AtomicU64::new(0),
                abort_count: AtomicU64::new(0),
                conflict_count: AtomicU64::new(0),
                open_count: AtomicU64::new(0),
            }),
        }
    }

    /// Invalidates every handle opened so far, as a replication topology
    /// change does. Table contents are kept.
    pub fn reconfigure(&self) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(epoch, "Engine topology changed, open handles invalidated");
    }

    /// Creates a table regardless of role, as if it arrived from the master
    /// through replication.
    pub fn install_table(&self, name: &str, options: OpenOptions) {
        let mut tables = self
            .inner
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        tables.entry(name.to_string()).or_insert_with(|| {
            debug!(table = name, "Table installed by replication");
            Arc::new(TableData::new(
                name,
                options.kind,
                options.comparator.unwrap_or(bytewise),
            ))
        });
    }

    /// Makes the next `count` calls to `open` fail with `Busy`.
    pub fn inject_busy_opens(&self, count: usize) {
        let mut failures = self.open_failures();
        failures.extend((0..count).map(|_| EngineError::Busy("recovering".to_string())));
    }

    /// Makes one call to `open`, after any already queued, fail with `error`.
    pub fn inject_open_failure(&self, error: EngineError) {
        self.open_failures().push_back(error);
    }

    fn open_failures(&self) -> std::sync::MutexGuard<'_, VecDeque<EngineError>> {
        self.inner
            .open_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if the table exists.
    pub fn has_table(&self, name: &str) -> bool {
        self.inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Number of rows in a table (0 if it does not exist).
    pub fn table_len(&self, name: &str) -> usize {
        self.inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tables: self
                .inner
                .tables
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            opens: self.inner.open_count.load(Ordering::Relaxed),
            commits: self.inner.commit_count.load(Ordering::Relaxed),
            aborts: self.inner.abort_count.load(Ordering::Relaxed),
            conflicts: self.inner.conflict_count.load(Ordering::Relaxed),
            epoch: self.inner.current_epoch(),
        }
    }
}

impl Engine for MemoryEngine {
    type Txn = MemoryTxn;
    type Table = MemoryTable;

    fn open(&self, name: &str, options: OpenOptions) -> Result<MemoryTable, EngineError> {
        if let Some(failure) = self.open_failures().pop_front() {
            debug!(table = name, code = failure.code(), "Injected open failure");
            return Err(failure);
        }

        let existing = self
            .inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();

        let data = match existing {
            Some(data) => data,
            None if !options.create => return Err(EngineError::NoSuchTable(name.to_string())),
            None => {
                self.inner.check_writable()?;
                let kind = match options.kind {
                    TableKind::Unknown => TableKind::BTree,
                    kind => kind,
                };
                let mut tables = self
                    .inner
                    .tables
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                let data = tables.entry(name.to_string()).or_insert_with(|| {
                    info!(table = name, kind = ?kind, "Created table");
                    Arc::new(TableData::new(
                        name,
                        kind,
                        options.comparator.unwrap_or(bytewise),
                    ))
                });
                Arc::clone(data)
            }
        };

        self.inner.open_count.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryTable {
            engine: Arc::clone(&self.inner),
            data,
            epoch: self.inner.current_epoch(),
        })
    }

    fn begin(&self, isolation: Isolation) -> Result<MemoryTxn, EngineError> {
        Ok(MemoryTxn {
            id: self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed),
            isolation,
            engine: Arc::clone(&self.inner),
            locks: Vec::new(),
            writes: Vec::new(),
        })
    }
}

/// A read lock taken with `ReadModifyWrite`.
#[derive(Debug)]
struct LockedRead {
    table: Arc<TableData>,
    key: Bytes,
    version: Option<u64>,
}

#[derive(Debug, Clone)]
enum WriteOp {
    Put { value: Bytes, no_overwrite: bool },
    Delete,
}

#[derive(Debug)]
struct BufferedWrite {
    table: Arc<TableData>,
    /// Epoch of the handle the write went through
    epoch: u64,
    key: Bytes,
    op: WriteOp,
}

/// A buffered transaction.
pub struct MemoryTxn {
    id: u64,
    isolation: Isolation,
    engine: Arc<EngineInner>,
    locks: Vec<LockedRead>,
    writes: Vec<BufferedWrite>,
}

impl std::fmt::Debug for MemoryTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTxn")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("locks", &self.locks.len())
            .field("writes", &self.writes.len())
            .finish()
    }
}

impl MemoryTxn {
    /// The latest buffered write for `key`, if any.
    fn pending(&self, table: &Arc<TableData>, key: &[u8]) -> Option<&WriteOp> {
        self.writes
            .iter()
            .rev()
            .find(|w| Arc::ptr_eq(&w.table, table) && table.same_key(&w.key, key))
            .map(|w| &w.op)
    }

    /// Value as seen by this transaction: own writes first, then committed.
    fn visible(&self, table: &Arc<TableData>, key: &[u8]) -> Option<Bytes> {
        match self.pending(table, key) {
            Some(WriteOp::Put { value, .. }) => Some(value.clone()),
            Some(WriteOp::Delete) => None,
            None => table.lookup(key).map(|(value, _)| value),
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        let epoch = self.engine.current_epoch();
        if self.writes.iter().any(|w| w.epoch != epoch) {
            return Err(EngineError::TopologyChanged);
        }
        if !self.writes.is_empty() {
            self.engine.check_writable()?;
        }
        for lock in &self.locks {
            if lock.table.version_of(&lock.key) != lock.version {
                self.engine.conflict_count.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::Conflict);
            }
        }
        for (i, write) in self.writes.iter().enumerate() {
            let WriteOp::Put {
                no_overwrite: true, ..
            } = write.op
            else {
                continue;
            };
            let touched_earlier = self.writes[..i].iter().any(|w| {
                Arc::ptr_eq(&w.table, &write.table) && write.table.same_key(&w.key, &write.key)
            });
            if !touched_earlier && write.table.lookup(&write.key).is_some() {
                return Err(EngineError::KeyExists);
            }
        }
        Ok(())
    }
}

impl Transaction for MemoryTxn {
    fn commit(self) -> Result<(), EngineError> {
        let engine = Arc::clone(&self.engine);
        let _guard = engine
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = self.validate() {
            engine.abort_count.fetch_add(1, Ordering::Relaxed);
            debug!(txn = self.id, error = %e, "Transaction failed validation");
            return Err(e);
        }

        if !self.writes.is_empty() {
            let version = engine.next_version();
            for write in self.writes {
                match write.op {
                    WriteOp::Put { value, .. } => write.table.upsert(write.key, value, version),
                    WriteOp::Delete => {
                        write.table.remove(&write.key);
                    }
                }
            }
        }
        engine.commit_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn abort(self) -> Result<(), EngineError> {
        self.engine.abort_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Handle to one table, bound to the epoch it was opened in.
#[derive(Clone)]
pub struct MemoryTable {
    engine: Arc<EngineInner>,
    data: Arc<TableData>,
    epoch: u64,
}

impl std::fmt::Debug for MemoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTable")
            .field("name", &self.data.name)
            .field("kind", &self.data.kind)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl MemoryTable {
    fn check_live(&self) -> Result<(), EngineError> {
        if self.engine.current_epoch() == self.epoch {
            Ok(())
        } else {
            Err(EngineError::TopologyChanged)
        }
    }

    /// Number of committed rows.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> TableKind {
        self.data.kind
    }
}

impl Table for MemoryTable {
    type Txn = MemoryTxn;
    type Cursor = MemoryCursor;

    fn name(&self) -> &str {
        &self.data.name
    }

    fn get(
        &self,
        txn: Option<&mut MemoryTxn>,
        key: &[u8],
        lock: ReadLock,
    ) -> Result<Option<Bytes>, EngineError> {
        self.check_live()?;
        let Some(txn) = txn else {
            return Ok(self.data.lookup(key).map(|(value, _)| value));
        };

        if lock == ReadLock::ReadModifyWrite && txn.pending(&self.data, key).is_none() {
            txn.locks.push(LockedRead {
                table: Arc::clone(&self.data),
                key: Bytes::copy_from_slice(key),
                version: self.data.version_of(key),
            });
        }
        Ok(txn.visible(&self.data, key))
    }

    fn put(
        &self,
        txn: Option<&mut MemoryTxn>,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
    ) -> Result<(), EngineError> {
        self.check_live()?;
        self.engine.check_writable()?;
        let no_overwrite = mode == PutMode::NoOverwrite;

        let Some(txn) = txn else {
            let _guard = self
                .engine
                .commit_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if no_overwrite && self.data.lookup(key).is_some() {
                return Err(EngineError::KeyExists);
            }
            let version = self.engine.next_version();
            self.data.upsert(
                Bytes::copy_from_slice(key),
                Bytes::copy_from_slice(value),
                version,
            );
            return Ok(());
        };

        if no_overwrite && txn.visible(&self.data, key).is_some() {
            return Err(EngineError::KeyExists);
        }
        txn.writes.push(BufferedWrite {
            table: Arc::clone(&self.data),
            epoch: self.epoch,
            key: Bytes::copy_from_slice(key),
            op: WriteOp::Put {
                value: Bytes::copy_from_slice(value),
                no_overwrite,
            },
        });
        Ok(())
    }

    fn delete(&self, txn: Option<&mut MemoryTxn>, key: &[u8]) -> Result<(), EngineError> {
        self.check_live()?;
        self.engine.check_writable()?;

        let Some(txn) = txn else {
            let _guard = self
                .engine
                .commit_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.engine.next_version();
            return if self.data.remove(key) {
                Ok(())
            } else {
                Err(EngineError::NotFound)
            };
        };

        if txn.visible(&self.data, key).is_none() {
            return Err(EngineError::NotFound);
        }
        txn.writes.push(BufferedWrite {
            table: Arc::clone(&self.data),
            epoch: self.epoch,
            key: Bytes::copy_from_slice(key),
            op: WriteOp::Delete,
        });
        Ok(())
    }

    fn cursor(&self, isolation: Isolation) -> Result<MemoryCursor, EngineError> {
        self.check_live()?;
        Ok(MemoryCursor {
            table: self.clone(),
            isolation,
            rows: self.data.snapshot(),
            pos: 0,
            current: None,
        })
    }
}

/// Cursor over a snapshot of a table taken when the cursor was opened.
pub struct MemoryCursor {
    table: MemoryTable,
    isolation: Isolation,
    rows: Vec<(Bytes, Bytes)>,
    pos: usize,
    current: Option<Bytes>,
}

impl std::fmt::Debug for MemoryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCursor")
            .field("table", &self.table.data.name)
            .field("isolation", &self.isolation)
            .field("pos", &self.pos)
            .field("rows", &self.rows.len())
            .finish()
    }
}

impl Cursor for MemoryCursor {
    fn next_entry(&mut self) -> Result<Option<(Bytes, Bytes)>, EngineError> {
        self.table.check_live()?;
        match self.rows.get(self.pos) {
            Some((key, value)) => {
                self.pos += 1;
                self.current = Some(key.clone());
                Ok(Some((key.clone(), value.clone())))
            }
            None => {
                self.current = None;
                Ok(None)
            }
        }
    }

    fn delete_current(&mut self) -> Result<(), EngineError> {
        let Some(key) = self.current.take() else {
            return Err(EngineError::NotFound);
        };
        self.table.delete(None, &key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationRole;
    use tokio_test::{assert_err, assert_ok};

    fn master() -> (MemoryEngine, NodeState) {
        let state = NodeState::new(ReplicationRole::Master);
        (MemoryEngine::new(state.clone()), state)
    }

    fn get(table: &MemoryTable, key: &[u8]) -> Option<Bytes> {
        table.get(None, key, ReadLock::None).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let (engine, _) = master();
        let table = engine.open("t.db", OpenOptions::btree()).unwrap();

        assert_ok!(table.put(None, b"k", b"v", PutMode::Overwrite));
        assert_eq!(get(&table, b"k"), Some(Bytes::from("v")));
        assert_ok!(table.delete(None, b"k"));
        assert_eq!(get(&table, b"k"), None);
        assert_eq!(table.delete(None, b"k"), Err(EngineError::NotFound));
    }

    #[test]
    fn test_no_overwrite() {
        let (engine, _) = master();
        let table = engine.open("t.db", OpenOptions::btree()).unwrap();

        assert_ok!(table.put(None, b"k", b"1", PutMode::NoOverwrite));
        assert_eq!(
            table.put(None, b"k", b"2", PutMode::NoOverwrite),
            Err(EngineError::KeyExists)
        );
        assert_eq!(get(&table, b"k"), Some(Bytes::from("1")));
    }

    #[test]
    fn test_open_missing_without_create() {
        let (engine, _) = master();
        assert_eq!(
            engine.open("missing.db", OpenOptions::existing()).unwrap_err(),
            EngineError::NoSuchTable("missing.db".into())
        );
        assert!(!engine.has_table("missing.db"));
    }

    #[test]
    fn test_client_cannot_create_or_write() {
        let state = NodeState::new(ReplicationRole::Client);
        let engine = MemoryEngine::new(state.clone());

        assert_eq!(
            engine.open("t.db", OpenOptions::btree()).unwrap_err(),
            EngineError::ReadOnly
        );

        engine.install_table("t.db", OpenOptions::btree());
        let table = engine.open("t.db", OpenOptions::existing()).unwrap();
        assert_eq!(
            table.put(None, b"k", b"v", PutMode::Overwrite),
            Err(EngineError::ReadOnly)
        );

        state.set_role(ReplicationRole::Master);
        assert_ok!(table.put(None, b"k", b"v", PutMode::Overwrite));
    }

    #[test]
    fn test_rows_follow_comparator() {
        fn reverse(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
            b.cmp(a)
        }

        let (engine, _) = master();
        let table = engine
            .open("rev.db", OpenOptions::btree().with_comparator(reverse))
            .unwrap();
        for key in [b"a", b"c", b"b"] {
            table.put(None, key, b"", PutMode::Overwrite).unwrap();
        }

        let mut cursor = table.cursor(Isolation::ReadUncommitted).unwrap();
        let mut keys = Vec::new();
        while let Some((key, _)) = cursor.next_entry().unwrap() {
            keys.push(key);
        }
        assert_eq!(keys, vec![Bytes::from("c"), Bytes::from("b"), Bytes::from("a")]);
    }

    #[test]
    fn test_txn_writes_are_invisible_until_commit() {
        let (engine, _) = master();
        let table = engine.open("t.db", OpenOptions::btree()).unwrap();

        let mut txn = engine.begin(Isolation::ReadCommitted).unwrap();
        table.put(Some(&mut txn), b"k", b"v", PutMode::Overwrite).unwrap();
        assert_eq!(
            table.get(Some(&mut txn), b"k", ReadLock::None).unwrap(),
            Some(Bytes::from("v"))
        );
        assert_eq!(get(&table, b"k"), None);

        txn.commit().unwrap();
        assert_eq!(get(&table, b"k"), Some(Bytes::from("v")));
    }

    #[test]
    fn test_scoped_txn_abort_discards_writes() {
        let (engine, _) = master();
        let table = engine.open("t.db", OpenOptions::btree()).unwrap();
        {
            let mut txn = engine.begin_scoped(Isolation::ReadCommitted).unwrap();
            table.put(txn.txn(), b"k", b"v", PutMode::Overwrite).unwrap();
        }
        assert_eq!(get(&table, b"k"), None);
        assert_eq!(engine.stats().aborts, 1);
    }

    #[test]
    fn test_read_modify_write_conflict() {
        let (engine, _) = master();
        let table = engine.open("t.db", OpenOptions::btree()).unwrap();
        table.put(None, b"k", b"1", PutMode::Overwrite).unwrap();

        let mut txn = engine.begin(Isolation::ReadCommitted).unwrap();
        table
            .get(Some(&mut txn), b"k", ReadLock::ReadModifyWrite)
            .unwrap();
        table.delete(Some(&mut txn), b"k").unwrap();

        // A concurrent writer changes the locked row
        table.put(None, b"k", b"2", PutMode::Overwrite).unwrap();

        assert_eq!(assert_err!(txn.commit()), EngineError::Conflict);
        assert_eq!(get(&table, b"k"), Some(Bytes::from("2")));
        assert_eq!(engine.stats().conflicts, 1);
    }

    #[test]
    fn test_no_overwrite_checked_again_at_commit() {
        let (engine, _) = master();
        let table = engine.open("t.db", OpenOptions::btree()).unwrap();

        let mut txn = engine.begin(Isolation::ReadCommitted).unwrap();
        table
            .put(Some(&mut txn), b"k", b"mine", PutMode::NoOverwrite)
            .unwrap();
        table.put(None, b"k", b"theirs", PutMode::Overwrite).unwrap();

        assert_eq!(txn.commit(), Err(EngineError::KeyExists));
        assert_eq!(get(&table, b"k"), Some(Bytes::from("theirs")));
    }

    #[test]
    fn test_reconfigure_kills_handles() {
        let (engine, _) = master();
        let table = engine.open("t.db", OpenOptions::btree()).unwrap();
        table.put(None, b"k", b"v", PutMode::Overwrite).unwrap();

        engine.reconfigure();
        assert_eq!(
            table.get(None, b"k", ReadLock::None),
            Err(EngineError::TopologyChanged)
        );
        assert!(table.cursor(Isolation::ReadUncommitted).is_err());

        // A fresh handle sees the data
        let reopened = engine.open("t.db", OpenOptions::existing()).unwrap();
        assert_eq!(get(&reopened, b"k"), Some(Bytes::from("v")));
    }

    #[test]
    fn test_commit_after_reconfigure_fails() {
        let (engine, _) = master();
        let table = engine.open("t.db", OpenOptions::btree()).unwrap();
        let mut txn = engine.begin(Isolation::ReadCommitted).unwrap();
        table.put(Some(&mut txn), b"k", b"v", PutMode::Overwrite).unwrap();

        engine.reconfigure();
        assert_eq!(txn.commit(), Err(EngineError::TopologyChanged));
        assert_eq!(engine.table_len("t.db"), 0);
    }

    #[test]
    fn test_cursor_delete_current() {
        let (engine, _) = master();
        let table = engine.open("t.db", OpenOptions::btree()).unwrap();
        for key in [b"a", b"b", b"c"] {
            table.put(None, key, b"", PutMode::Overwrite).unwrap();
        }

        let mut cursor = table.cursor(Isolation::ReadUncommitted).unwrap();
        assert_eq!(cursor.delete_current(), Err(EngineError::NotFound));
        cursor.next_entry().unwrap();
        cursor.next_entry().unwrap();
        cursor.delete_current().unwrap();

        assert_eq!(get(&table, b"b"), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_injected_busy_opens() {
        let (engine, _) = master();
        engine.inject_busy_opens(2);
        assert!(matches!(
            engine.open("t.db", OpenOptions::btree()),
            Err(EngineError::Busy(_))
        ));
        assert!(engine.open("t.db", OpenOptions::btree()).is_err());
        assert_ok!(engine.open("t.db", OpenOptions::btree()));
    }

    #[test]
    fn test_injected_open_failures_run_in_order() {
        let (engine, _) = master();
        engine.inject_busy_opens(1);
        engine.inject_open_failure(EngineError::ReadOnly);

        assert!(matches!(
            engine.open("t.db", OpenOptions::btree()),
            Err(EngineError::Busy(_))
        ));
        assert_eq!(
            engine.open("t.db", OpenOptions::btree()).err(),
            Some(EngineError::ReadOnly)
        );
        assert_ok!(engine.open("t.db", OpenOptions::btree()));
        assert_eq!(engine.stats().opens, 1);
    }
}
