//! Core data model, error types, and backend contracts for SOP.
//!
//! `sop-core` defines the vocabulary every other SOP crate speaks: the
//! [`Handle`]/[`Node`]/[`StoreInfo`] data model, the identifier newtypes that
//! keep logical, physical, and item UUIDs from being accidentally swapped,
//! the [`SopError`] umbrella error type, and the backend *contracts*
//! (`BlobStore`, `Registry`, `L2Cache`, `StoreRepository`, `TransactionLog`)
//! that `sop-storage` and `sop-durability` implement. Nothing in this crate
//! talks to a real disk or network — it is pure data and trait definitions.

#![warn(missing_docs)]

pub mod comparator;
pub mod error;
pub mod handle;
pub mod ids;
pub mod node;
pub mod retry;
pub mod store_info;
pub mod time;
pub mod traits;

pub use comparator::{ByteLexComparator, KeyComparator};
pub use error::{Result, SopError};
pub use handle::Handle;
pub use ids::{ItemId, LogicalId, PhysicalId, TransactionId};
pub use node::{Node, Slot};
pub use retry::{DefaultJitter, FixedJitter, JitterSource, RetryPolicy};
pub use store_info::{StoreInfo, StoreOptions};
pub use time::now_micros;
