//! Storage Module
//!
//! Everything that talks to the transactional storage engine: the engine
//! interface, the in-memory engine, table acquisition and routing, and TTL
//! expiry.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌───────────────────────────┐
//! │    Store     │────>│ TableRouter  │────>│          Engine           │
//! │ (by ext key) │     │ name -> hdl  │     │  users.db  __default.db   │
//! └──────┬───────┘     └──────▲───────┘     │  __expire.db              │
//!        │                    │             │  __expire.index.db        │
//!        ▼                    │             └─────────────▲─────────────┘
//! ┌──────────────┐            │                           │
//! │    Expiry    │────────────┴───── open_with_retry ─────┘
//! │ register +   │
//! │ sweep        │<──── ExpirySweeper (background tokio task)
//! └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use tablekeep::replication::{NodeState, ReplicationRole};
//! use tablekeep::storage::{Expiry, ExpiryConfig, MemoryEngine, RouterConfig, TableRouter};
//! use tablekeep::Store;
//!
//! # tokio_test::block_on(async {
//! let state = NodeState::new(ReplicationRole::Master);
//! let engine = Arc::new(MemoryEngine::new(state.clone()));
//! let router = Arc::new(TableRouter::new(engine, state, RouterConfig::default()));
//! let expiry = Arc::new(Expiry::new(router, ExpiryConfig::default()));
//! let store = Store::new(Arc::clone(&expiry), 1);
//!
//! store.set_with_ttl_at(b"session:abc", b"token", 60, 1_000).await.unwrap();
//! assert!(store.get(b"session:abc").await.unwrap().is_some());
//!
//! expiry.sweep_at(1_060).await.unwrap();
//! assert!(store.get(b"session:abc").await.unwrap().is_none());
//! # });
//! ```

pub mod acquire;
pub mod backend;
pub mod engine;
pub mod expiry;
pub mod router;

// Re-export commonly used types
pub use acquire::{open_with_retry, DEFAULT_BACKOFF};
pub use backend::{
    bytewise, Comparator, Cursor, Engine, Isolation, OpenOptions, PutMode, ReadLock, ScopedTxn,
    Table, TableKind, Transaction,
};
pub use engine::{EngineStats, MemoryCursor, MemoryEngine, MemoryTable, MemoryTxn};
pub use expiry::{
    unix_now, Expiry, ExpiryConfig, ExpirySweeper, ExpiryTables, Reconciliation, SweepReport,
    INDEX_TABLE, SCHEDULE_TABLE,
};
pub use router::{table_file, RouterConfig, TableRouter};
