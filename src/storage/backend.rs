//! Storage Engine Interface
//!
//! The core never stores anything itself. It drives a transactional,
//! replicated key-value engine through the narrow set of traits below:
//!
//! ```text
//! Engine ──open()──> Table ──get/put/delete(txn)──> rows
//!    │                 │
//!    └──begin()──> Txn └──cursor()──> Cursor ──next_entry/delete_current
//! ```
//!
//! Durability, replication and locking are the engine's business. The only
//! replication facts the core sees are the node role (see
//! [`NodeState`](crate::replication::NodeState)) and
//! [`EngineError::TopologyChanged`] on a dead handle.

use crate::error::EngineError;
use bytes::Bytes;
use std::cmp::Ordering;
use tracing::warn;

/// Key ordering function installed on a table at open time.
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

/// Byte-lexicographic order, used when a table has no comparator.
pub fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Access method of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Ordered table; honours the comparator
    BTree,
    /// Point-lookup table
    Hash,
    /// Open whatever exists; never creates
    Unknown,
}

/// Parameters for [`Engine::open`].
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub kind: TableKind,
    /// Create the table when it is missing
    pub create: bool,
    pub comparator: Option<Comparator>,
}

impl OpenOptions {
    /// An ordered table, created if missing.
    pub fn btree() -> Self {
        Self {
            kind: TableKind::BTree,
            create: true,
            comparator: None,
        }
    }

    /// A hash table, created if missing.
    pub fn hash() -> Self {
        Self {
            kind: TableKind::Hash,
            create: true,
            comparator: None,
        }
    }

    /// A table that must already exist.
    pub fn existing() -> Self {
        Self {
            kind: TableKind::Unknown,
            create: false,
            comparator: None,
        }
    }

    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    ReadCommitted,
    /// Dirty reads allowed; used by the non-blocking schedule cursor
    ReadUncommitted,
}

/// Locking behaviour of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadLock {
    #[default]
    None,
    /// Lock the key for a later write in the same transaction
    ReadModifyWrite,
}

/// Behaviour of a put on an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    #[default]
    Overwrite,
    /// Fail with [`EngineError::KeyExists`] instead of replacing
    NoOverwrite,
}

/// An engine transaction. Consumed by commit or abort.
pub trait Transaction: Send + 'static {
    fn commit(self) -> Result<(), EngineError>;

    fn abort(self) -> Result<(), EngineError>;
}

/// A cursor over one table, positioned before the first entry when opened.
pub trait Cursor: Send {
    /// Advances and returns the next `(key, value)`, or `None` when exhausted.
    fn next_entry(&mut self) -> Result<Option<(Bytes, Bytes)>, EngineError>;

    /// Deletes the entry last returned by [`Cursor::next_entry`].
    fn delete_current(&mut self) -> Result<(), EngineError>;
}

/// An opened table handle. Clones share the same underlying handle.
///
/// Passing `None` as the transaction auto-commits the single operation.
pub trait Table: Clone + Send + Sync + 'static {
    type Txn: Transaction;
    type Cursor: Cursor;

    fn name(&self) -> &str;

    fn get(
        &self,
        txn: Option<&mut Self::Txn>,
        key: &[u8],
        lock: ReadLock,
    ) -> Result<Option<Bytes>, EngineError>;

    fn put(
        &self,
        txn: Option<&mut Self::Txn>,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
    ) -> Result<(), EngineError>;

    /// Fails with [`EngineError::NotFound`] when the key is absent.
    fn delete(&self, txn: Option<&mut Self::Txn>, key: &[u8]) -> Result<(), EngineError>;

    fn cursor(&self, isolation: Isolation) -> Result<Self::Cursor, EngineError>;
}

/// The transactional storage engine.
pub trait Engine: Send + Sync + 'static {
    type Txn: Transaction;
    type Table: Table<Txn = Self::Txn>;

    fn open(&self, name: &str, options: OpenOptions) -> Result<Self::Table, EngineError>;

    fn begin(&self, isolation: Isolation) -> Result<Self::Txn, EngineError>;

    /// Begins a transaction that aborts when dropped uncommitted.
    fn begin_scoped(&self, isolation: Isolation) -> Result<ScopedTxn<Self::Txn>, EngineError> {
        self.begin(isolation).map(ScopedTxn::new)
    }
}

/// Transaction guard: aborts on drop unless committed.
#[derive(Debug)]
pub struct ScopedTxn<T: Transaction> {
    txn: Option<T>,
}

impl<T: Transaction> ScopedTxn<T> {
    pub fn new(txn: T) -> Self {
        Self { txn: Some(txn) }
    }

    /// The transaction, in the form table operations take it.
    pub fn txn(&mut self) -> Option<&mut T> {
        self.txn.as_mut()
    }

    pub fn commit(mut self) -> Result<(), EngineError> {
        match self.txn.take() {
            Some(txn) => txn.commit(),
            None => Ok(()),
        }
    }

    pub fn abort(mut self) -> Result<(), EngineError> {
        match self.txn.take() {
            Some(txn) => txn.abort(),
            None => Ok(()),
        }
    }
}

impl<T: Transaction> Drop for ScopedTxn<T> {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Err(e) = txn.abort() {
                warn!(op = "abort", code = e.code(), error = %e, "Abort on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct CountingTxn {
        commits: Arc<AtomicUsize>,
        aborts: Arc<AtomicUsize>,
    }

    impl Transaction for CountingTxn {
        fn commit(self) -> Result<(), EngineError> {
            self.commits.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        fn abort(self) -> Result<(), EngineError> {
            self.aborts.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> (CountingTxn, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let commits = Arc::new(AtomicUsize::new(0));
        let aborts = Arc::new(AtomicUsize::new(0));
        let txn = CountingTxn {
            commits: Arc::clone(&commits),
            aborts: Arc::clone(&aborts),
        };
        (txn, commits, aborts)
    }

    #[test]
    fn test_scoped_txn_aborts_on_drop() {
        let (txn, commits, aborts) = counting();
        {
            let mut scoped = ScopedTxn::new(txn);
            assert!(scoped.txn().is_some());
        }
        assert_eq!(commits.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(aborts.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_scoped_txn_commit_does_not_abort() {
        let (txn, commits, aborts) = counting();
        ScopedTxn::new(txn).commit().unwrap();
        assert_eq!(commits.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(aborts.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_open_options() {
        let opts = OpenOptions::btree().with_comparator(bytewise).with_create(false);
        assert_eq!(opts.kind, TableKind::BTree);
        assert!(!opts.create);
        assert!(opts.comparator.is_some());
        assert!(!OpenOptions::existing().create);
    }
}
