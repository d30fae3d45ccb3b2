//! Recovery Sweeper convenience constructor (C9).

use sop_concurrency::Backends;
use sop_durability::{RecoverySweeper, RollbackExecutor};
use std::time::Duration;

/// Build a [`RecoverySweeper`] over the same backends a [`crate::Store`]
/// commits through. Typically run on a background interval by whatever
/// process owns a store's backends, independent of any one application's
/// transactions.
pub fn recovery_sweeper(backends: &Backends, max_duration: Duration) -> RecoverySweeper {
    let rollback = RollbackExecutor::new(
        backends.registry.clone(),
        backends.blob_store.clone(),
        backends.l2_cache.clone(),
        backends.store_repo.clone(),
    );
    RecoverySweeper::new(
        backends.log.clone(),
        backends.l2_cache.clone(),
        rollback,
        max_duration,
    )
}
