//! The Registry's per-logical-ID record.
//!
//! See spec.md §3 and §6 for the normative field list and the 62-byte wire
//! layout. The binary form is bit-exact: `LogicalID(16) || PhysicalIDA(16)
//! || PhysicalIDB(16) || IsActiveIDB(1) || Version(u32 LE, 4) ||
//! WIPTimestamp(i64 LE, 8) || IsDeleted(1)`.

use crate::ids::LogicalId;
use crate::ids::PhysicalId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of a Handle's wire form.
pub const HANDLE_WIRE_SIZE: usize = 16 + 16 + 16 + 1 + 4 + 8 + 1;

/// Registry record mapping one logical ID to its two physical slots.
///
/// Exactly one of `physical_id_a`/`physical_id_b` is the "active" (readable)
/// copy, selected by `is_active_id_b`. A transaction writing an update
/// allocates a fresh physical ID for the *inactive* slot (copy-on-write),
/// and only phase-2 commit flips `is_active_id_b` to publish it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    /// Stable identity known to the B-tree.
    pub logical_id: LogicalId,
    /// Physical slot A.
    pub physical_id_a: PhysicalId,
    /// Physical slot B.
    pub physical_id_b: PhysicalId,
    /// Selects which of A/B is currently active (readable).
    pub is_active_id_b: bool,
    /// Monotone version, incremented on each successful commit touching
    /// this handle.
    pub version: u32,
    /// Non-zero while a commit has staged a write to the inactive slot;
    /// acts as a lock and an age marker for the recovery sweeper.
    pub work_in_progress_timestamp: i64,
    /// Tombstone pending physical GC.
    pub is_deleted: bool,
}

impl Handle {
    /// A brand-new handle for a freshly added node: physical slot A holds
    /// the only copy, slot B is unused, and version starts at 1.
    pub fn new_added(logical_id: LogicalId, physical_id_a: PhysicalId) -> Self {
        Handle {
            logical_id,
            physical_id_a,
            physical_id_b: PhysicalId::nil(),
            is_active_id_b: false,
            version: 1,
            work_in_progress_timestamp: 0,
            is_deleted: false,
        }
    }

    /// The currently active (readable) physical ID.
    pub fn active_physical_id(&self) -> PhysicalId {
        if self.is_active_id_b {
            self.physical_id_b
        } else {
            self.physical_id_a
        }
    }

    /// The currently inactive physical ID — the slot a copy-on-write update
    /// stages its new blob into.
    pub fn inactive_physical_id(&self) -> PhysicalId {
        if self.is_active_id_b {
            self.physical_id_a
        } else {
            self.physical_id_b
        }
    }

    /// True if some transaction has claimed this handle's inactive slot and
    /// not yet released it: a nonzero `work_in_progress_timestamp` marks an
    /// in-flight transaction holding the inactive slot.
    pub fn is_work_in_progress(&self) -> bool {
        self.work_in_progress_timestamp != 0
    }

    /// Stage a fresh physical ID into the inactive slot and mark the handle
    /// work-in-progress as of `commit_start`. Does not flip the active
    /// slot — that only happens on phase-2 commit.
    pub fn stage_inactive(&mut self, new_physical_id: PhysicalId, commit_start: i64) {
        if self.is_active_id_b {
            self.physical_id_a = new_physical_id;
        } else {
            self.physical_id_b = new_physical_id;
        }
        self.work_in_progress_timestamp = commit_start;
    }

    /// Phase-2 commit: publish the staged inactive slot as active, clear the
    /// WIP marker, and bump the version.
    pub fn flip_active(&mut self) {
        self.is_active_id_b = !self.is_active_id_b;
        self.work_in_progress_timestamp = 0;
        self.version = self.version.wrapping_add(1);
    }

    /// Clear a WIP claim without flipping — used by rollback to undo a
    /// staged-but-never-flipped update.
    pub fn clear_work_in_progress(&mut self) {
        self.work_in_progress_timestamp = 0;
    }

    /// Serialize to the 62-byte wire form (§6).
    pub fn to_bytes(&self) -> [u8; HANDLE_WIRE_SIZE] {
        let mut buf = [0u8; HANDLE_WIRE_SIZE];
        let mut off = 0;
        buf[off..off + 16].copy_from_slice(self.logical_id.as_bytes());
        off += 16;
        buf[off..off + 16].copy_from_slice(self.physical_id_a.as_bytes());
        off += 16;
        buf[off..off + 16].copy_from_slice(self.physical_id_b.as_bytes());
        off += 16;
        buf[off] = self.is_active_id_b as u8;
        off += 1;
        buf[off..off + 4].copy_from_slice(&self.version.to_le_bytes());
        off += 4;
        buf[off..off + 8].copy_from_slice(&self.work_in_progress_timestamp.to_le_bytes());
        off += 8;
        buf[off] = self.is_deleted as u8;
        buf
    }

    /// Deserialize from the 62-byte wire form. Returns `None` if `bytes` is
    /// not exactly [`HANDLE_WIRE_SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HANDLE_WIRE_SIZE {
            return None;
        }
        let mut off = 0;
        let mut take16 = |off: &mut usize| -> [u8; 16] {
            let mut a = [0u8; 16];
            a.copy_from_slice(&bytes[*off..*off + 16]);
            *off += 16;
            a
        };
        let logical_id = LogicalId::from_bytes(take16(&mut off));
        let physical_id_a = PhysicalId::from_bytes(take16(&mut off));
        let physical_id_b = PhysicalId::from_bytes(take16(&mut off));
        let is_active_id_b = bytes[off] != 0;
        off += 1;
        let version = u32::from_le_bytes(bytes[off..off + 4].try_into().ok()?);
        off += 4;
        let work_in_progress_timestamp = i64::from_le_bytes(bytes[off..off + 8].try_into().ok()?);
        off += 8;
        let is_deleted = bytes[off] != 0;
        Some(Handle {
            logical_id,
            physical_id_a,
            physical_id_b,
            is_active_id_b,
            version,
            work_in_progress_timestamp,
            is_deleted,
        })
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle(logical={}, active={}, v{}, wip={}, deleted={})",
            self.logical_id,
            self.active_physical_id(),
            self.version,
            self.work_in_progress_timestamp,
            self.is_deleted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_handle() -> Handle {
        Handle {
            logical_id: LogicalId::new(),
            physical_id_a: PhysicalId::new(),
            physical_id_b: PhysicalId::new(),
            is_active_id_b: true,
            version: 7,
            work_in_progress_timestamp: 123_456_789,
            is_deleted: false,
        }
    }

    #[test]
    fn wire_size_is_62_bytes() {
        assert_eq!(HANDLE_WIRE_SIZE, 62);
    }

    #[test]
    fn round_trip_binary_form() {
        let h = sample_handle();
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), 62);
        let decoded = Handle::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn round_trip_preserves_deleted_flag() {
        let mut h = sample_handle();
        h.is_deleted = true;
        let decoded = Handle::from_bytes(&h.to_bytes()).unwrap();
        assert!(decoded.is_deleted);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(Handle::from_bytes(&[0u8; 61]).is_none());
        assert!(Handle::from_bytes(&[0u8; 63]).is_none());
    }

    #[test]
    fn active_and_inactive_physical_id_follow_flag() {
        let mut h = sample_handle();
        h.is_active_id_b = false;
        assert_eq!(h.active_physical_id(), h.physical_id_a);
        assert_eq!(h.inactive_physical_id(), h.physical_id_b);
        h.is_active_id_b = true;
        assert_eq!(h.active_physical_id(), h.physical_id_b);
        assert_eq!(h.inactive_physical_id(), h.physical_id_a);
    }

    #[test]
    fn stage_inactive_then_flip_publishes_new_physical_id() {
        let mut h = Handle::new_added(LogicalId::new(), PhysicalId::new());
        let original_active = h.active_physical_id();
        let staged = PhysicalId::new();
        h.stage_inactive(staged, 1000);
        assert!(h.is_work_in_progress());
        assert_eq!(h.active_physical_id(), original_active); // not yet visible
        assert_eq!(h.version, 1);

        h.flip_active();
        assert!(!h.is_work_in_progress());
        assert_eq!(h.active_physical_id(), staged);
        assert_eq!(h.version, 2);
    }

    #[test]
    fn new_added_starts_at_version_one_inactive_b() {
        let logical = LogicalId::new();
        let physical = PhysicalId::new();
        let h = Handle::new_added(logical, physical);
        assert_eq!(h.version, 1);
        assert!(!h.is_active_id_b);
        assert_eq!(h.active_physical_id(), physical);
        assert!(!h.is_work_in_progress());
    }
}
