//! A disk-backed, content-addressed read/write cache that sits in front of
//! an upstream block-storage [`Gateway`] and implements that same interface
//! itself, so instances stack as decorators.
//!
//! Reads are served from a local, bucketed directory when possible, filling
//! it from the upstream on miss; writes are passed through to the upstream
//! while simultaneously landing in the local directory, so a block is
//! available locally as soon as it's been written once. A background tidy
//! pass keeps the local directory under a size budget by evicting the
//! least-recently-used blocks.

pub mod cache;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod gateway;
pub mod heldopen;
pub mod layout;
pub mod locator;
pub mod logging;
mod prelude;
pub(crate) mod scheduler;
pub(crate) mod tidy;
pub(crate) mod write;

/// An in-memory [`Gateway`] double. Exported unconditionally (not just under
/// `cfg(test)`) because the demonstration binary and downstream integration
/// tests need it too.
pub mod test_util;

pub use cache::Cache;
pub use config::{CacheLogger, Config};
pub use error::CacheError;
pub use gateway::{BlockSource, BlockWriteOptions, BlockWriteResponse, Gateway};
pub use locator::Locator;
