//! Transaction Core: working set, two-phase commit, conflict detection,
//! rollback, and the store lifecycle that issues transactions (C6's
//! counterpart on the concurrency-control side of spec.md's architecture).
//!
//! `sop-engine` depends on this crate, not the reverse — the B-tree's
//! [`sop_engine::NodeRepository`](../sop_engine/trait.NodeRepository.html)
//! is implemented *for* [`Transaction`] over there, since Rust's orphan
//! rule only allows a crate to implement its own trait for a foreign type.
//! Everything in this crate is plain node/value staging: `get`/`stage_*`
//! methods that buffer in a [`WorkingSet`] until `commit` runs.

#![warn(missing_docs)]

mod conflict;
pub mod manager;
pub mod metrics;
pub mod transaction;
mod validation;
pub mod working_set;

pub use manager::TransactionManager;
pub use metrics::{MetricsSnapshot, TransactionMetrics};
pub use transaction::{Backends, Transaction, TransactionMode};
pub use working_set::WorkingSet;
