//! TTL Expiry
//!
//! Expiry is tracked in two side tables next to the live tables:
//!
//! ```text
//! __expire.db        (btree, earliest first)
//!   (expire_at, sequence, originator) ──> canonical key
//!
//! __expire.index.db  (hash)
//!   canonical key ──> (expire_at, sequence, originator)   latest registration only
//! ```
//!
//! Both tables use the canonical `<table>:<inner>` spelling of the external
//! key, so `foo`, `:foo` and `__default:foo` share one index entry.
//!
//! Registering a TTL inserts a schedule entry and overwrites the index entry
//! in one transaction. Re-registering a key leaves the old schedule entry in
//! place; the index tells the sweeper which one is current.
//!
//! ## Sweep
//!
//! Each tick the sweeper looks at the earliest schedule entries. For every
//! due entry (up to `batch_size`):
//!
//! ```text
//! Scanned ──> Validating ──┬── index missing ──────────> Orphaned   ─┐
//!                          ├── index points elsewhere ─> Superseded ─┼─> Retired
//!                          └── index matches ──> delete index + live ─┘
//!                                                 (Reconciled)
//! ```
//!
//! Validation reads the index entry with a read-modify-write lock, so a
//! registration racing the sweep either lands first (the sweep sees it and
//! leaves the live record alone) or makes the sweep's commit fail.
//!
//! If a live table reports a topology change, its router entry is evicted and
//! the tick fails without retiring the schedule entry; it is retried later.
//!
//! ## Background Task
//!
//! [`ExpirySweeper`] runs the sweep on a fixed tick, only while this node is
//! master; a client parks until the role changes. Any sweep failure drops
//! both expiry handles; they are reacquired on the next iteration.

use crate::error::{EngineError, Error, Result};
use crate::keys::schedule::{self, ScheduleKey};
use crate::keys::{canonical, split};
use crate::replication::NodeState;
use crate::storage::acquire::{open_with_retry, DEFAULT_BACKOFF};
use crate::storage::backend::{
    Cursor, Engine, Isolation, OpenOptions, PutMode, ReadLock, ScopedTxn, Table,
};
use crate::storage::router::TableRouter;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Schedule table: due-time ordered entries.
pub const SCHEDULE_TABLE: &str = "__expire.db";

/// Reverse index: external key to its current schedule entry.
pub const INDEX_TABLE: &str = "__expire.index.db";

/// Current time in seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Configuration for expiry.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Interval between sweeps (default: 1s)
    pub tick_interval: Duration,

    /// Due entries retired per sweep (default: 1)
    pub batch_size: usize,

    /// Delay between attempts to open the expiry tables (default: 1s)
    pub acquire_backoff: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            batch_size: 1,
            acquire_backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Handles to the two expiry tables.
#[derive(Debug, Clone)]
pub struct ExpiryTables<T> {
    pub schedule: T,
    pub index: T,
}

/// What happened to one swept schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Index matched: the live record and index entry were deleted
    Reconciled,
    /// A later registration owns the key: live record left alone
    Superseded,
    /// No index entry: nothing left to expire
    Orphaned,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reconciled: usize,
    pub superseded: usize,
    pub orphaned: usize,
    /// Schedule entries whose key could not be decoded
    pub malformed: usize,
}

impl SweepReport {
    /// Schedule entries retired by this sweep.
    pub fn retired(&self) -> usize {
        self.reconciled + self.superseded + self.orphaned + self.malformed
    }

    pub fn is_empty(&self) -> bool {
        self.retired() == 0
    }

    fn record(&mut self, outcome: Reconciliation) {
        match outcome {
            Reconciliation::Reconciled => self.reconciled += 1,
            Reconciliation::Superseded => self.superseded += 1,
            Reconciliation::Orphaned => self.orphaned += 1,
        }
    }
}

/// The expiry subsystem: registration and sweeping.
pub struct Expiry<E: Engine> {
    engine: Arc<E>,
    router: Arc<TableRouter<E>>,
    state: NodeState,
    config: ExpiryConfig,
    tables: RwLock<Option<ExpiryTables<E::Table>>>,
}

impl<E: Engine> std::fmt::Debug for Expiry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expiry")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("acquired", &self.cached_tables().is_some())
            .finish()
    }
}

impl<E: Engine> Expiry<E> {
    /// Creates the subsystem. Live tables are resolved through `router`,
    /// which must share `engine`.
    pub fn new(router: Arc<TableRouter<E>>, config: ExpiryConfig) -> Self {
        Self {
            engine: Arc::clone(router.engine()),
            state: router.state().clone(),
            router,
            config,
            tables: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ExpiryConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<TableRouter<E>> {
        &self.router
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    fn cached_tables(&self) -> Option<ExpiryTables<E::Table>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the expiry table handles, opening them on first use.
    pub async fn tables(&self) -> Result<ExpiryTables<E::Table>> {
        if let Some(tables) = self.cached_tables() {
            return Ok(tables);
        }

        let backoff = self.config.acquire_backoff;
        let schedule = open_with_retry(
            self.engine.as_ref(),
            &self.state,
            SCHEDULE_TABLE,
            OpenOptions::btree().with_comparator(schedule::compare),
            backoff,
        )
        .await?;
        let index = open_with_retry(
            self.engine.as_ref(),
            &self.state,
            INDEX_TABLE,
            OpenOptions::hash(),
            backoff,
        )
        .await?;

        let tables = ExpiryTables { schedule, index };
        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = Some(tables.clone());
        debug!("Expiry tables acquired");
        Ok(tables)
    }

    /// Drops both expiry handles; the next use reopens them.
    pub fn invalidate_tables(&self) {
        if self
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("Expiry table handles dropped");
        }
    }

    /// Schedules `key` to expire `ttl_secs` after `now` inside `txn`.
    ///
    /// Both writes go through `txn` and land together when the caller
    /// commits. Entries are keyed by the canonical spelling of `key`. A
    /// schedule entry with the same composite key fails with
    /// [`Error::DuplicateSchedule`].
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        tables: &ExpiryTables<E::Table>,
        txn: &mut ScopedTxn<E::Txn>,
        key: &[u8],
        ttl_secs: i64,
        sequence: u32,
        originator: u32,
        now: i64,
    ) -> Result<ScheduleKey> {
        let entry = ScheduleKey::new(now.saturating_add(ttl_secs), sequence, originator);
        let encoded = entry.encode();
        let key = canonical(key);

        match tables
            .schedule
            .put(txn.txn(), &encoded, &key, PutMode::NoOverwrite)
        {
            Ok(()) => {}
            Err(EngineError::KeyExists) => return Err(duplicate(&entry)),
            Err(e) => {
                error!(op = "put|expire", code = e.code(), error = %e, entry = %entry, "Schedule insert failed");
                return Err(e.into());
            }
        }
        if let Err(e) = tables
            .index
            .put(txn.txn(), &key, &encoded, PutMode::Overwrite)
        {
            error!(op = "put|expire.index", code = e.code(), error = %e, entry = %entry, "Index update failed");
            return Err(e.into());
        }

        trace!(entry = %entry, "TTL registered");
        Ok(entry)
    }

    /// Drops the TTL of `key` inside `txn`. Returns false if it had none.
    ///
    /// The outstanding schedule entry stays and is retired as orphaned.
    pub fn clear(
        &self,
        tables: &ExpiryTables<E::Table>,
        txn: &mut ScopedTxn<E::Txn>,
        key: &[u8],
    ) -> Result<bool> {
        match tables.index.delete(txn.txn(), &canonical(key)) {
            Ok(()) => Ok(true),
            Err(EngineError::NotFound) => Ok(false),
            Err(e) => {
                error!(op = "delete|expire.index", code = e.code(), error = %e, "Index delete failed");
                Err(e.into())
            }
        }
    }

    /// Schedules `key` to expire `ttl_secs` from now in its own transaction.
    pub async fn schedule_expiry(
        &self,
        key: &[u8],
        ttl_secs: i64,
        sequence: u32,
        originator: u32,
    ) -> Result<ScheduleKey> {
        self.schedule_expiry_at(key, ttl_secs, sequence, originator, unix_now())
            .await
    }

    /// [`Expiry::schedule_expiry`] with an explicit clock.
    pub async fn schedule_expiry_at(
        &self,
        key: &[u8],
        ttl_secs: i64,
        sequence: u32,
        originator: u32,
        now: i64,
    ) -> Result<ScheduleKey> {
        let tables = self.tables().await?;
        let mut txn = self.engine.begin_scoped(Isolation::ReadCommitted)?;
        let entry = self.register(&tables, &mut txn, key, ttl_secs, sequence, originator, now)?;
        match txn.commit() {
            Ok(()) => Ok(entry),
            Err(EngineError::KeyExists) => Err(duplicate(&entry)),
            Err(e) => Err(e.into()),
        }
    }

    /// The current schedule entry for `key`, if a TTL is registered.
    pub async fn lookup(&self, key: &[u8]) -> Result<Option<ScheduleKey>> {
        let tables = self.tables().await?;
        match tables.index.get(None, &canonical(key), ReadLock::None)? {
            Some(raw) => Ok(Some(ScheduleKey::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Runs one sweep against the current time.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep_at(unix_now()).await
    }

    /// Runs one sweep treating `now` as the current time.
    ///
    /// Does nothing unless this node is master.
    pub async fn sweep_at(&self, now: i64) -> Result<SweepReport> {
        if !self.state.is_master() {
            trace!("Not master, skipping sweep");
            return Ok(SweepReport::default());
        }
        let tables = self.tables().await?;
        self.sweep_with(&tables, now).await
    }

    async fn sweep_with(&self, tables: &ExpiryTables<E::Table>, now: i64) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut cursor = tables.schedule.cursor(Isolation::ReadUncommitted)?;

        while report.retired() < self.config.batch_size.max(1) {
            let Some((raw, external)) = cursor.next_entry()? else {
                break;
            };

            match ScheduleKey::decode(&raw) {
                Ok(entry) if !entry.is_due(now) => break,
                Ok(entry) => {
                    let outcome = self.reconcile(tables, &entry, &external).await?;
                    trace!(entry = %entry, outcome = ?outcome, "Schedule entry swept");
                    report.record(outcome);
                }
                Err(e) => {
                    error!(op = "sweep|expire", code = "MALFORMED_KEY", error = %e, "Discarding undecodable schedule entry");
                    report.malformed += 1;
                }
            }

            match cursor.delete_current() {
                Ok(()) | Err(EngineError::NotFound) => {}
                Err(e) => {
                    error!(op = "delete|expire", code = e.code(), error = %e, "Could not retire schedule entry");
                    return Err(e.into());
                }
            }
        }

        Ok(report)
    }

    /// Validates one due entry against the index and expires the live record
    /// if it is still current.
    async fn reconcile(
        &self,
        tables: &ExpiryTables<E::Table>,
        entry: &ScheduleKey,
        external: &[u8],
    ) -> Result<Reconciliation> {
        let mut txn = self.engine.begin_scoped(Isolation::ReadCommitted)?;

        let current = tables
            .index
            .get(txn.txn(), external, ReadLock::ReadModifyWrite)
            .map_err(|e| {
                error!(op = "get|expire.index", code = e.code(), error = %e, "Index read failed");
                e
            })?;
        let Some(current) = current else {
            return Ok(Reconciliation::Orphaned);
        };

        match ScheduleKey::decode(&current) {
            Ok(current) if current == *entry => {}
            Ok(_) => {
                txn.abort()?;
                return Ok(Reconciliation::Superseded);
            }
            Err(e) => {
                warn!(op = "get|expire.index", code = "MALFORMED_KEY", error = %e, "Index entry undecodable, treating as superseded");
                txn.abort()?;
                return Ok(Reconciliation::Superseded);
            }
        }

        tables.index.delete(txn.txn(), external)?;

        let target = split(external);
        let table_name = target.table();
        let live = self.router.resolve(&table_name).await?;
        match live.delete(txn.txn(), target.inner()) {
            Ok(()) | Err(EngineError::NotFound) => {}
            Err(e) => {
                error!(op = "delete|expire", table = %table_name, code = e.code(), error = %e, "Live delete failed");
                if e.is_topology_change() {
                    self.router.invalidate(&table_name);
                }
                return Err(e.into());
            }
        }

        if let Err(e) = txn.commit() {
            if e.is_topology_change() {
                self.router.invalidate(&table_name);
            }
            return Err(e.into());
        }
        Ok(Reconciliation::Reconciled)
    }
}

fn duplicate(entry: &ScheduleKey) -> Error {
    Error::DuplicateSchedule {
        expire_at: entry.expire_at,
        sequence: entry.sequence,
        originator: entry.originator,
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    /// Cancelled to stop the task; a child of the node's shutdown token
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Starts the sweeper as a background task.
    ///
    /// The task stops when [`ExpirySweeper::stop`] is called, when the handle
    /// is dropped, or when the node shuts down.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use tablekeep::replication::{NodeState, ReplicationRole};
    /// use tablekeep::storage::{Expiry, ExpiryConfig, ExpirySweeper, MemoryEngine, RouterConfig, TableRouter};
    ///
    /// # tokio_test::block_on(async {
    /// let state = NodeState::new(ReplicationRole::Master);
    /// let engine = Arc::new(MemoryEngine::new(state.clone()));
    /// let router = Arc::new(TableRouter::new(engine, state, RouterConfig::default()));
    /// let expiry = Arc::new(Expiry::new(router, ExpiryConfig::default()));
    ///
    /// let sweeper = ExpirySweeper::start(expiry);
    /// sweeper.join().await;
    /// # });
    /// ```
    pub fn start<E: Engine>(expiry: Arc<Expiry<E>>) -> Self {
        let token = expiry.state().shutdown_token().child_token();
        let task = tokio::spawn(sweeper_loop(expiry, token.clone()));

        info!("Background expiry sweeper started");

        Self {
            token,
            task: Some(task),
        }
    }

    /// Stops the sweeper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            self.token.cancel();
            info!("Background expiry sweeper stopped");
        }
    }

    /// Stops the sweeper and waits for the task to finish.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Expiry sweeper task failed");
            }
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweeper_loop<E: Engine>(expiry: Arc<Expiry<E>>, token: CancellationToken) {
    let tick = expiry.config().tick_interval;
    let mut roles = expiry.state().subscribe_role();

    loop {
        let tables = tokio::select! {
            _ = token.cancelled() => break,
            acquired = expiry.tables() => match acquired {
                Ok(tables) => tables,
                Err(Error::ShuttingDown) => break,
                Err(e) => {
                    error!(op = "acquire", code = e.code(), error = %e, "Could not acquire expiry tables");
                    if pause(&token, tick).await {
                        break;
                    }
                    continue;
                }
            },
        };

        if pause(&token, tick).await {
            break;
        }

        if !roles.borrow_and_update().is_master() {
            trace!("Not master, waiting for promotion");
            tokio::select! {
                _ = token.cancelled() => break,
                changed = roles.changed() => {
                    if changed.is_err() && pause(&token, tick).await {
                        break;
                    }
                }
            }
            continue;
        }

        match expiry.sweep_with(&tables, unix_now()).await {
            Ok(report) if !report.is_empty() => {
                debug!(
                    reconciled = report.reconciled,
                    superseded = report.superseded,
                    orphaned = report.orphaned,
                    malformed = report.malformed,
                    "Expired entries swept"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(op = "sweep|expire", code = e.code(), error = %e, "Sweep failed, reacquiring expiry tables");
                expiry.invalidate_tables();
            }
        }
    }

    debug!("Expiry sweeper received shutdown signal");
}

/// Sleeps for `tick`. Returns true if cancelled first.
async fn pause(token: &CancellationToken, tick: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(tick) => false,
        _ = token.cancelled() => true,
    }
}
