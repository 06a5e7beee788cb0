use thiserror::Error;

/// Error kinds a caller can usefully match on.
///
/// Everything else flows as `anyhow::Error` with `.context(...)` breadcrumbs;
/// these variants exist because callers sometimes need to branch on *why*
/// an operation failed (e.g. skip committing on a hash mismatch) rather than
/// just log-and-propagate. Use `anyhow::Error::downcast_ref::<CacheError>()`
/// to recover one of these from a boxed error.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid locator {locator:?}: {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Internal signal raised by the quick read path when a concurrent
    /// bulk-sweep closed the entry out from under a reader. Never surfaced
    /// past [`crate::heldopen`] — it always triggers a slow-path retry.
    #[error("lost race with held-open pool eviction")]
    LostRace,
}
