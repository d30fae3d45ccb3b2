//! Optimistic concurrency control: validating a transaction's read set.
//!
//! Spec §4.6 phase-1 "verify": a commit fails with
//! [`sop_core::error::SopError::Conflict`] if any logical ID it read (to
//! traverse the tree, or to stage an update against) has since advanced
//! past the version this transaction observed, or is currently staged by
//! another in-flight commit. This is what turns the read-write conflict
//! scenario (spec §8) into a retry rather than a lost update.

use sop_core::error::{Result, SopError};
use sop_core::ids::LogicalId;
use sop_core::traits::Registry;
use std::collections::HashMap;

/// Validate every `(logical_id, version)` pair a transaction observed
/// against the registry's current state.
///
/// Fails fast on the first mismatch: a missing handle (concurrently
/// tombstoned and GC'd), a version that has moved on, or a handle another
/// transaction has staged (`is_work_in_progress`) are all treated as a
/// conflict a caller should retry the whole transaction to recover from.
pub(crate) fn validate_read_set(
    registry: &dyn Registry,
    table: &str,
    read_versions: &HashMap<LogicalId, u32>,
) -> Result<()> {
    for (&id, &expected_version) in read_versions {
        match registry.get(table, id)? {
            None => {
                return Err(SopError::Conflict(format!(
                    "logical id {id} was removed since this transaction read it"
                )))
            }
            Some(handle) if handle.is_deleted => {
                return Err(SopError::Conflict(format!(
                    "logical id {id} was deleted since this transaction read it"
                )))
            }
            Some(handle) if handle.version != expected_version => {
                return Err(SopError::Conflict(format!(
                    "logical id {id} changed from version {expected_version} to {}",
                    handle.version
                )))
            }
            Some(handle) if handle.is_work_in_progress() => {
                return Err(SopError::Conflict(format!(
                    "logical id {id} is staged by another in-flight commit"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}
