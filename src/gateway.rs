//! The upstream gateway contract this cache decorates.
//!
//! This is the one boundary the surrounding system treats as a black box:
//! a real implementation talks to a remote block-storage service. This
//! crate ships only [`crate::test_util::MemoryGateway`], an in-memory double
//! for tests and the demonstration binary.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::locator::Locator;
use crate::prelude::*;

/// The source of bytes for a [`BlockWriteOptions`]: either an in-memory
/// buffer (the common case for small blocks) or an arbitrary async reader
/// (for streaming writes of large blocks).
pub enum BlockSource {
    Bytes(Vec<u8>),
    Reader(Pin<Box<dyn AsyncRead + Send>>),
}

impl BlockSource {
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            BlockSource::Bytes(b) => Some(b.len() as u64),
            BlockSource::Reader(_) => None,
        }
    }
}

/// Arguments to [`Gateway::block_write`].
pub struct BlockWriteOptions {
    pub source: BlockSource,
    /// Expected length in bytes, if known ahead of time.
    pub expected_size: Option<u64>,
    /// Expected content hash (hex, lowercase), if known ahead of time.
    pub expected_hash: Option<String>,
    /// Opaque hints forwarded to the upstream untouched.
    pub hints: Option<String>,
}

impl BlockWriteOptions {
    pub fn from_bytes(data: Vec<u8>) -> BlockWriteOptions {
        BlockWriteOptions {
            source: BlockSource::Bytes(data),
            expected_size: None,
            expected_hash: None,
            hints: None,
        }
    }

    pub fn with_expected_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_hash = Some(hash.into());
        self
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }
}

/// What a successful [`Gateway::block_write`] reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWriteResponse {
    pub locator: Locator,
}

/// The four-operation surface every gateway — upstream or this cache itself
/// — implements. Decorators stack: a `Cache` is itself a valid `Gateway`.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Read `dst.len()` bytes starting at `offset` from the block named by
    /// `locator`.
    async fn read_at(&self, locator: &Locator, dst: &mut [u8], offset: u64) -> Result<usize>;

    /// Stream the entire block named by `locator` into `writer`, returning
    /// the number of bytes written.
    async fn block_read(
        &self,
        locator: &Locator,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;

    /// Store a new block, returning the locator it was assigned.
    async fn block_write(&self, opts: BlockWriteOptions) -> Result<BlockWriteResponse>;

    /// Normalize a locator (e.g. resolve hints to a specific replica).
    /// Pass-through only; this crate's cache never calls it itself.
    async fn local_locator(&self, locator: &Locator) -> Result<Locator>;
}
