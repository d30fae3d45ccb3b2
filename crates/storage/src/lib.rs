//! Blob Store, Registry, caches, and Store Repository backends.
//!
//! Houses C1 (Blob Store), C2 (Registry), C3/C4 (L2/L1 caches), and C5
//! (Store Repository) — every backend the Transaction Core reads and writes
//! through the `sop_core::traits` contracts. In-memory implementations are
//! the reference backends used by every other crate's tests; `LocalFsBlobStore`
//! is the one on-disk backend this implementation ships.

#![warn(missing_docs)]

pub mod blobstore;
pub mod gc;
pub mod l1cache;
pub mod l2cache;
pub mod registry;
pub mod retrying;
pub mod store_repo;
pub mod ttl;

pub use blobstore::{LocalFsBlobStore, MemBlobStore};
pub use gc::{DeferredGc, FifoDeferredGc, GcTask};
pub use l1cache::MruCache;
pub use l2cache::MemL2Cache;
pub use registry::MemRegistry;
pub use retrying::{RetryingBlobStore, RetryingL2Cache, RetryingRegistry};
pub use store_repo::MemStoreRepository;
