//! Table Router
//!
//! Maps table names to opened handles. Handles are opened lazily on first
//! use and cached until explicitly invalidated; there is no LRU or idle
//! eviction.
//!
//! ```text
//! resolve("users") ──hit──> cached handle
//!        │
//!        └──miss──> open_with_retry("users.db") ──> cache ──> handle
//!
//! op fails with TopologyChanged ──> invalidate("users") ──> next resolve reopens
//! ```
//!
//! Invalidation only affects later lookups: an operation already holding a
//! handle finishes with it.

use crate::error::Result;
use crate::replication::NodeState;
use crate::storage::acquire::{open_with_retry, DEFAULT_BACKOFF};
use crate::storage::backend::{Comparator, Engine, OpenOptions};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// File name of a tenant table.
pub fn table_file(table: &str) -> String {
    format!("{}.db", table)
}

/// Configuration for the table router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Delay between open attempts (default: 1s)
    pub backoff: Duration,

    /// Key order for tables created by the router (default: bytewise)
    pub key_order: Option<Comparator>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            key_order: None,
        }
    }
}

/// Lazily opened, cached per-table handles.
pub struct TableRouter<E: Engine> {
    engine: Arc<E>,
    state: NodeState,
    config: RouterConfig,
    handles: RwLock<HashMap<String, E::Table>>,

    /// Statistics: tables opened by this router
    open_count: AtomicU64,

    /// Statistics: handles evicted by invalidation
    invalidation_count: AtomicU64,
}

impl<E: Engine> std::fmt::Debug for TableRouter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRouter")
            .field("cached", &self.len())
            .field("opens", &self.open_count.load(Ordering::Relaxed))
            .field(
                "invalidations",
                &self.invalidation_count.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl<E: Engine> TableRouter<E> {
    pub fn new(engine: Arc<E>, state: NodeState, config: RouterConfig) -> Self {
        Self {
            engine,
            state,
            config,
            handles: RwLock::new(HashMap::new()),
            open_count: AtomicU64::new(0),
            invalidation_count: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Returns the cached handle without opening anything.
    pub fn cached(&self, table: &str) -> Option<E::Table> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
    }

    /// Returns the handle for `table`, opening `<table>.db` on first use.
    ///
    /// The table is created if missing only on a master; a client waits for
    /// it to replicate. Fails with
    /// [`Error::ShuttingDown`](crate::error::Error::ShuttingDown) if shutdown
    /// is requested while waiting, and with the engine error if the open
    /// fails for a reason waiting will not fix.
    pub async fn resolve(&self, table: &str) -> Result<E::Table> {
        if let Some(handle) = self.cached(table) {
            return Ok(handle);
        }

        let mut options = OpenOptions::btree();
        if let Some(order) = self.config.key_order {
            options = options.with_comparator(order);
        }
        let file = table_file(table);
        let handle = open_with_retry(
            self.engine.as_ref(),
            &self.state,
            &file,
            options,
            self.config.backoff,
        )
        .await?;

        self.open_count.fetch_add(1, Ordering::Relaxed);
        debug!(table, file = %file, "Table handle cached");

        let mut handles = self
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        handles.insert(table.to_string(), handle.clone());
        Ok(handle)
    }

    /// Evicts the cached handle for `table`. Returns true if one was cached.
    pub fn invalidate(&self, table: &str) -> bool {
        let removed = self
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table)
            .is_some();
        if removed {
            self.invalidation_count.fetch_add(1, Ordering::Relaxed);
            info!(table, "Table handle invalidated");
        }
        removed
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tables this router has opened.
    pub fn opens(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }
}
