//! Store Facade
//!
//! Live-record access by external key. Every operation splits the key into
//! `table:inner`, resolves the table through the router and works on the
//! inner key:
//!
//! ```text
//! "users:alice" ──split──> ("users", "alice") ──resolve──> users.db
//! "alice"       ──split──> ("__default", "alice") ───────> __default.db
//! ```
//!
//! TTLs are registered through the expiry subsystem in the same transaction
//! as the live write, with a sequence number drawn from this store's
//! [`SequenceGenerator`] and the configured originator id.
//!
//! A topology change reported by a live table evicts that table from the
//! router before the error is returned; the next call reopens it.

use crate::error::{EngineError, Error, Result};
use crate::keys::{split, ScheduleKey};
use crate::storage::backend::{Engine, Isolation, PutMode, ReadLock, Table};
use crate::storage::expiry::{unix_now, Expiry};
use crate::storage::router::TableRouter;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Hands out per-originator sequence numbers for schedule entries.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU32,
}

impl SequenceGenerator {
    pub fn new(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start),
        }
    }

    /// Seeds from the millisecond clock so a restarted originator does not
    /// reuse the numbers it handed out before, unless it averaged more than
    /// one registration per millisecond.
    pub fn from_clock() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Self::new(millis as u32)
    }

    /// Returns the next sequence number. Wraps at `u32::MAX`.
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Live-record operations by external key, with TTL support.
pub struct Store<E: Engine> {
    engine: Arc<E>,
    router: Arc<TableRouter<E>>,
    expiry: Arc<Expiry<E>>,
    sequence: SequenceGenerator,
    originator: u32,
}

impl<E: Engine> std::fmt::Debug for Store<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("originator", &self.originator)
            .field("sequence", &self.sequence)
            .field("router", &self.router)
            .finish()
    }
}

impl<E: Engine> Store<E> {
    pub fn new(expiry: Arc<Expiry<E>>, originator: u32) -> Self {
        Self::with_sequence(expiry, originator, SequenceGenerator::from_clock())
    }

    pub fn with_sequence(
        expiry: Arc<Expiry<E>>,
        originator: u32,
        sequence: SequenceGenerator,
    ) -> Self {
        let router = Arc::clone(expiry.router());
        Self {
            engine: Arc::clone(router.engine()),
            router,
            expiry,
            sequence,
            originator,
        }
    }

    pub fn expiry(&self) -> &Arc<Expiry<E>> {
        &self.expiry
    }

    pub fn originator(&self) -> u32 {
        self.originator
    }

    /// Evicts `table` if `e` came from a dead handle.
    fn observe(&self, table: &str, e: EngineError) -> Error {
        if e.is_topology_change() {
            warn!(table, code = e.code(), "Live table handle is dead, evicting");
            self.router.invalidate(table);
        }
        e.into()
    }

    /// Evicts both the live table and the expiry handles after a failed
    /// commit; the engine does not say which handle died.
    fn observe_commit(&self, table: &str, e: EngineError) -> Error {
        if e.is_topology_change() {
            self.expiry.invalidate_tables();
        }
        self.observe(table, e)
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let target = split(key);
        let table = target.table();
        let live = self.router.resolve(&table).await?;
        live.get(None, target.inner(), ReadLock::None)
            .map_err(|e| self.observe(&table, e))
    }

    /// Writes `value` and clears any TTL on the key.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let target = split(key);
        let table = target.table();
        let live = self.router.resolve(&table).await?;
        let tables = self.expiry.tables().await?;

        let mut txn = self.engine.begin_scoped(Isolation::ReadCommitted)?;
        live.put(txn.txn(), target.inner(), value, PutMode::Overwrite)
            .map_err(|e| self.observe(&table, e))?;
        self.expiry.clear(&tables, &mut txn, key)?;
        txn.commit().map_err(|e| self.observe_commit(&table, e))
    }

    /// Deletes the record. Returns false if it did not exist.
    ///
    /// The key's index entry goes with it, so any outstanding schedule entry
    /// is retired as orphaned.
    pub async fn delete(&self, key: &[u8]) -> Result<bool> {
        let target = split(key);
        let table = target.table();
        let live = self.router.resolve(&table).await?;
        let tables = self.expiry.tables().await?;

        let mut txn = self.engine.begin_scoped(Isolation::ReadCommitted)?;
        match live.delete(txn.txn(), target.inner()) {
            Ok(()) => {}
            Err(EngineError::NotFound) => return Ok(false),
            Err(e) => return Err(self.observe(&table, e)),
        }
        self.expiry.clear(&tables, &mut txn, key)?;
        txn.commit().map_err(|e| self.observe_commit(&table, e))?;
        Ok(true)
    }

    /// Writes `value` and schedules it to expire in `ttl_secs`.
    pub async fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl_secs: i64) -> Result<ScheduleKey> {
        self.set_with_ttl_at(key, value, ttl_secs, unix_now()).await
    }

    /// [`Store::set_with_ttl`] with an explicit clock.
    pub async fn set_with_ttl_at(
        &self,
        key: &[u8],
        value: &[u8],
        ttl_secs: i64,
        now: i64,
    ) -> Result<ScheduleKey> {
        let target = split(key);
        let table = target.table();
        let live = self.router.resolve(&table).await?;
        let tables = self.expiry.tables().await?;

        let mut txn = self.engine.begin_scoped(Isolation::ReadCommitted)?;
        live.put(txn.txn(), target.inner(), value, PutMode::Overwrite)
            .map_err(|e| self.observe(&table, e))?;
        let entry = self.expiry.register(
            &tables,
            &mut txn,
            key,
            ttl_secs,
            self.sequence.next(),
            self.originator,
            now,
        )?;
        commit_registration(txn.commit(), &entry).map_err(|e| match e {
            Error::Engine(e) => self.observe_commit(&table, e),
            other => other,
        })?;

        debug!(table = %table, entry = %entry, "Record written with TTL");
        Ok(entry)
    }

    /// Sets a TTL on an existing record. Returns `None` if there is no
    /// record to expire.
    pub async fn expire(&self, key: &[u8], ttl_secs: i64) -> Result<Option<ScheduleKey>> {
        self.expire_at(key, ttl_secs, unix_now()).await
    }

    /// [`Store::expire`] with an explicit clock.
    pub async fn expire_at(
        &self,
        key: &[u8],
        ttl_secs: i64,
        now: i64,
    ) -> Result<Option<ScheduleKey>> {
        let target = split(key);
        let table = target.table();
        let live = self.router.resolve(&table).await?;
        let tables = self.expiry.tables().await?;

        let mut txn = self.engine.begin_scoped(Isolation::ReadCommitted)?;
        let exists = live
            .get(txn.txn(), target.inner(), ReadLock::ReadModifyWrite)
            .map_err(|e| self.observe(&table, e))?
            .is_some();
        if !exists {
            return Ok(None);
        }

        let entry = self.expiry.register(
            &tables,
            &mut txn,
            key,
            ttl_secs,
            self.sequence.next(),
            self.originator,
            now,
        )?;
        commit_registration(txn.commit(), &entry).map_err(|e| match e {
            Error::Engine(e) => self.observe_commit(&table, e),
            other => other,
        })?;
        Ok(Some(entry))
    }

    /// Seconds until `key` expires, or `None` if it has no TTL.
    pub async fn ttl(&self, key: &[u8]) -> Result<Option<i64>> {
        self.ttl_at(key, unix_now()).await
    }

    /// [`Store::ttl`] with an explicit clock. Never negative.
    pub async fn ttl_at(&self, key: &[u8], now: i64) -> Result<Option<i64>> {
        Ok(self
            .expiry
            .lookup(key)
            .await?
            .map(|entry| entry.expire_at.saturating_sub(now).max(0)))
    }
}

/// Maps a commit-time uniqueness failure back to the schedule entry.
fn commit_registration(
    committed: std::result::Result<(), EngineError>,
    entry: &ScheduleKey,
) -> Result<()> {
    match committed {
        Ok(()) => Ok(()),
        Err(EngineError::KeyExists) => Err(Error::DuplicateSchedule {
            expire_at: entry.expire_at,
            sequence: entry.sequence,
            originator: entry.originator,
        }),
        Err(e) => Err(e.into()),
    }
}
