//! # tablekeep - Table Routing and TTL Expiry for a Replicated Store
//!
//! tablekeep is the core that sits between an application and a
//! transactional, replicated key-value engine. It routes external keys to
//! per-tenant tables, orders structured keys, and expires records whose TTL
//! has passed without ever deleting a record that was refreshed in the
//! meantime.
//!
//! ## Features
//!
//! - **Structured keys**: MessagePack-encoded integers, strings and arrays
//!   with a total order usable as a table comparator
//! - **Table routing**: `table:key` external keys, lazily opened and cached
//!   table handles, eviction on replication topology changes
//! - **TTL expiry**: a schedule table ordered by expiry time plus a reverse
//!   index that guards against stale schedule entries
//! - **Replication aware**: only the master creates tables or sweeps; clients
//!   wait for tables to replicate
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              tablekeep                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │    Store    │───>│  Namespace  │───>│ TableRouter │──┐               │
//! │  │ get/set/ttl │    │  Splitter   │    │ (cache)     │  │               │
//! │  └──────┬──────┘    └─────────────┘    └─────────────┘  │               │
//! │         │                                               ▼               │
//! │         ▼                              ┌──────────────────────────────┐ │
//! │  ┌─────────────┐   open_with_retry     │     Transactional Engine     │ │
//! │  │   Expiry    │──────────────────────>│  <table>.db   __expire.db    │ │
//! │  │ register    │                       │  __expire.index.db           │ │
//! │  └──────▲──────┘                       └──────────────────────────────┘ │
//! │         │                                                               │
//! │  ┌──────┴──────────────────────────────────────────┐                    │
//! │  │           ExpirySweeper (Background Tokio Task) │                    │
//! │  └─────────────────────────────────────────────────┘                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`keys`]: structured key codec and comparator, schedule keys, namespace
//!   splitting
//! - [`replication`]: node role and shutdown flag
//! - [`storage`]: engine interface, in-memory engine, router, expiry
//! - [`store`]: live-record access by external key
//! - [`error`]: error types
//!
//! ## Design Highlights
//!
//! ### Reconciling Sweeps
//!
//! Refreshing a TTL writes a new schedule entry and repoints the index; the
//! old schedule entry stays behind. When the sweeper reaches an entry it
//! checks the index under a read-modify-write lock and only deletes the live
//! record if the entry is still the current one.
//!
//! ### Throttled Expiry
//!
//! One due entry is retired per tick by default. `ExpiryConfig::batch_size`
//! raises that.

pub mod error;
pub mod keys;
pub mod replication;
pub mod storage;
pub mod store;

// Re-export commonly used types for convenience
pub use error::{EngineError, Error, KeyError, Result};
pub use keys::{ScheduleKey, StructuredKey};
pub use replication::{NodeState, ReplicationRole};
pub use storage::{Expiry, ExpiryConfig, ExpirySweeper, MemoryEngine, RouterConfig, TableRouter};
pub use store::{SequenceGenerator, Store};

/// Version of tablekeep
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
