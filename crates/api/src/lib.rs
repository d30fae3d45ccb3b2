//! Public entry points for SOP.
//!
//! Everything a caller needs lives behind two types: [`Store`] opens or
//! creates a named B-tree and issues transactions against it; [`StoreTransaction`]
//! is one transaction, combining `sop-concurrency`'s [`Transaction`] (staging,
//! two-phase commit, rollback) with `sop-engine`'s [`Btree`] (the ordered
//! key-value operations themselves) so a caller drives both through one
//! handle instead of wiring the B-tree's node-repository view up itself.
//!
//! ```ignore
//! let backends = Backends { /* ... */ };
//! let mut store = Store::new_btree("orders", StoreOptions::default(), backends)?;
//! let mut tx = store.begin(TransactionMode::ForWriting)?;
//! tx.add(b"order-1".to_vec(), b"payload".to_vec())?;
//! tx.commit()?;
//! ```

#![warn(missing_docs)]

mod recovery;
mod store;
mod transaction;

pub use recovery::recovery_sweeper;
pub use store::Store;
pub use transaction::StoreTransaction;

// Re-exported so a caller depending only on `sop-api` (or the root `sop`
// facade) has everything needed to open a store and drive a transaction,
// without an explicit dependency on the lower crates.
pub use sop_concurrency::{Backends, TransactionMode};
pub use sop_core::comparator::{ByteLexComparator, KeyComparator};
pub use sop_core::error::{Result, SopError};
pub use sop_core::ids::{ItemId, LogicalId, TransactionId};
pub use sop_core::store_info::{StoreInfo, StoreOptions};
pub use sop_durability::SweepReport;
pub use sop_engine::{Cursor, FindKind};
