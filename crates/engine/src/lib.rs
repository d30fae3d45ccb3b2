//! The transactional B-tree algorithm (C6).
//!
//! Everything in this crate is CPU-bound: the algorithm never talks to a
//! backend directly. It reads and writes nodes exclusively through the
//! [`NodeRepository`] view `sop-concurrency` provides, which buffers every
//! mutation in a transaction's working set: the tree talks to nodes only
//! through a node-repository view exposed by the Transaction Core.

#![warn(missing_docs)]

pub mod btree;
pub mod cursor;
pub mod node_repository;
mod transaction_adapter;

pub use btree::{Btree, BtreeConfig, FindKind};
pub use cursor::Cursor;
pub use node_repository::NodeRepository;
