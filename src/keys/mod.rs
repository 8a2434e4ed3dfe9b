//! Key Encodings and Orderings
//!
//! - `structured`: self-describing MessagePack keys and their total order
//! - `schedule`: fixed-width `(expire_at, sequence, originator)` keys of the
//!   expiry schedule, ordered earliest first
//! - `namespace`: splitting `table:key` external keys
//!
//! Both orderings are plain `fn(&[u8], &[u8]) -> Ordering` so they can be
//! handed to the storage engine when a table is opened.

pub mod namespace;
pub mod schedule;
pub mod structured;

pub use namespace::{canonical, split, Namespaced, DEFAULT_TABLE};
pub use schedule::ScheduleKey;
pub use structured::StructuredKey;
