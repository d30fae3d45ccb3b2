//! Error types for SOP.
//!
//! [`SopError`] is the single error type returned by every transaction
//! method. It classifies into a small set of well-known error kinds, and
//! each backend crate's narrower error type converts into it via `#[from]`
//! or an explicit `From` impl so callers only ever match on one enum.

use crate::ids::{LogicalId, TransactionId};
use std::io;
use thiserror::Error;

/// Result type alias used throughout SOP.
pub type Result<T> = std::result::Result<T, SopError>;

/// Unified error type for SOP.
///
/// See spec.md §7 for the authoritative description of each kind and its
/// propagation policy.
#[derive(Debug, Error)]
pub enum SopError {
    /// Version mismatch, lost lock, or concurrent update detected during
    /// commit. Retryable at the transaction boundary (the caller re-runs the
    /// whole transaction from `begin`, not just the commit call).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A commit's merge-retry loop or a context deadline elapsed before the
    /// operation could complete.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A backend call failed in a way expected to be transient (network
    /// blip, backend overload). Already retried internally with Fibonacci
    /// backoff up to the configured attempt limit; surfaced only once that
    /// budget is exhausted.
    #[error("backend transient error: {0}")]
    BackendTransient(String),

    /// A backend call failed in a way that will not succeed on retry: no
    /// space, read-only filesystem, permission denied, invalid argument, or
    /// not-found on a read that requires existence.
    #[error("backend permanent error: {0}")]
    BackendPermanent(String),

    /// An internal invariant was violated: a corrupt handle, a missing blob
    /// for an active handle, or a count mismatch. The transaction aborts
    /// without attempting to roll back state that was consistent before it
    /// started.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A store was re-opened with options that don't match the persisted
    /// `StoreInfo` (slot length, uniqueness, or value placement).
    #[error("config mismatch: {0}")]
    ConfigMismatch(String),

    /// An operation requires an active transaction but none has begun.
    #[error("transaction has not begun")]
    NotBegun,

    /// `begin` was called on a transaction that has already begun.
    #[error("transaction has already begun")]
    AlreadyBegun,

    /// The requested logical ID has no entry in the Registry.
    #[error("logical id not found: {0}")]
    NotFound(LogicalId),

    /// A transaction log entry references a transaction ID the log store
    /// doesn't know about.
    #[error("transaction log not found: {0}")]
    TransactionNotFound(TransactionId),

    /// I/O failure underlying a filesystem-backed implementation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization failure for a Node, Item, or StoreInfo payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SopError {
    /// A version mismatch, lost lock, or concurrent-update conflict.
    ///
    /// Callers should retry the whole transaction from `begin`.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SopError::Conflict(_))
    }

    /// An error that is safe to retry without caller intervention, either
    /// because the backend call itself is retried internally
    /// (`BackendTransient`) or because re-running the transaction is the
    /// documented recovery path (`Conflict`, `Timeout`).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SopError::Conflict(_) | SopError::Timeout(_) | SopError::BackendTransient(_)
        )
    }

    /// A permanent failure: retrying without changing something about the
    /// environment (free space, permissions, filesystem mode) cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SopError::BackendPermanent(_) | SopError::Invariant(_))
    }

    /// True for the programmer-error variants (`NotBegun`/`AlreadyBegun`)
    /// that indicate a misuse of the transaction API rather than a runtime
    /// condition.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, SopError::NotBegun | SopError::AlreadyBegun)
    }
}

/// Classify a raw I/O error from a backend call as transient or permanent.
///
/// Filesystem-backed backends call this instead of converting straight to
/// `SopError::Io`, so kinds a retry can plausibly fix (interrupted syscalls,
/// resets, timeouts) feed `RetryPolicy` as `BackendTransient`, while kinds no
/// amount of retrying helps (permissions, invalid input, disk full) surface
/// immediately as `BackendPermanent`.
pub fn classify_io_error(e: io::Error) -> SopError {
    use io::ErrorKind::*;
    match e.kind() {
        Interrupted | WouldBlock | TimedOut | ConnectionReset | ConnectionAborted
        | ConnectionRefused | BrokenPipe | UnexpectedEof => SopError::BackendTransient(e.to_string()),
        _ => SopError::BackendPermanent(e.to_string()),
    }
}
