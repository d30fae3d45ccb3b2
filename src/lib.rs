//! # SOP — Scalable Objects Persistence
//!
//! A transactional, ordered key-value storage engine: a B-tree with
//! optimistic concurrency control, two-phase commit, a logical-to-physical
//! Registry for copy-on-write node updates, a content-addressable Blob
//! Store, layered L1/L2 caches, an append-only transaction log, and a
//! Recovery Sweeper that compensates transactions abandoned mid-commit.
//!
//! ```ignore
//! use sop::{Backends, Store, StoreOptions, TransactionMode};
//!
//! let backends: Backends = /* wire up Registry, Blob Store, caches, etc. */;
//! let mut store = Store::new_btree("orders", StoreOptions::default(), backends)?;
//! let mut tx = store.begin(TransactionMode::ForWriting)?;
//! tx.add(b"order-1".to_vec(), b"payload".to_vec())?;
//! tx.commit()?;
//! ```
//!
//! Each concern lives in its own crate — `sop-core` (data model, errors,
//! backend contracts), `sop-storage` (Blob Store, Registry, caches),
//! `sop-durability` (transaction log, rollback, Recovery Sweeper),
//! `sop-concurrency` (the Transaction Core and two-phase commit),
//! `sop-engine` (the B-tree algorithm) — this crate is a thin facade
//! re-exporting `sop-api`'s public surface.

pub use sop_api::*;
