//! In-memory [`Gateway`] double used by tests and the demonstration binary.
//! Stands in for whatever remote block-storage service a real deployment
//! talks to.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::gateway::{BlockSource, BlockWriteOptions, BlockWriteResponse, Gateway};
use crate::locator::Locator;
use crate::prelude::*;

#[derive(Default)]
pub struct MemoryGateway {
    blocks: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryGateway {
    pub fn new() -> MemoryGateway {
        MemoryGateway::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn read_at(&self, locator: &Locator, dst: &mut [u8], offset: u64) -> Result<usize> {
        let blocks = self.blocks.lock().unwrap();
        let data = blocks
            .get(locator.hash_and_size())
            .ok_or_else(|| anyhow!("no such block: {}", locator.hash_and_size()))?;

        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let end = (start + dst.len()).min(data.len());
        let n = end - start;
        dst[..n].copy_from_slice(&data[start..end]);
        Ok(n)
    }

    async fn block_read(
        &self,
        locator: &Locator,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let data = {
            let blocks = self.blocks.lock().unwrap();
            blocks
                .get(locator.hash_and_size())
                .ok_or_else(|| anyhow!("no such block: {}", locator.hash_and_size()))?
                .clone()
        };
        writer
            .write_all(&data)
            .await
            .context("writing block_read output")?;
        Ok(data.len() as u64)
    }

    async fn block_write(&self, opts: BlockWriteOptions) -> Result<BlockWriteResponse> {
        let data = match opts.source {
            BlockSource::Bytes(b) => b,
            BlockSource::Reader(mut r) => {
                let mut buf = Vec::new();
                r.read_to_end(&mut buf)
                    .await
                    .context("reading write source")?;
                buf
            }
        };

        if let Some(expected) = opts.expected_size {
            if expected != data.len() as u64 {
                bail!(CacheError::SizeMismatch {
                    expected,
                    actual: data.len() as u64,
                });
            }
        }

        let hash = format!("{:x}", md5::compute(&data));
        if let Some(expected) = &opts.expected_hash {
            if !expected.eq_ignore_ascii_case(&hash) {
                bail!(CacheError::HashMismatch {
                    expected: expected.clone(),
                    actual: hash,
                });
            }
        }

        let locator = Locator::from_hash_and_size(&hash, data.len() as u64);
        self.blocks
            .lock()
            .unwrap()
            .insert(locator.hash_and_size().to_string(), data);
        Ok(BlockWriteResponse { locator })
    }

    async fn local_locator(&self, locator: &Locator) -> Result<Locator> {
        Ok(locator.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn round_trips_bytes() {
        let gw = MemoryGateway::new();
        let resp = gw
            .block_write(BlockWriteOptions::from_bytes(b"hello".to_vec()))
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        let n = gw.read_at(&resp.locator, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn rejects_wrong_expected_hash() {
        let gw = MemoryGateway::new();
        let err = gw
            .block_write(
                BlockWriteOptions::from_bytes(b"hello".to_vec())
                    .with_expected_hash("deadbeefdeadbeefdeadbeefdeadbeef"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::HashMismatch { .. })
        ));
        assert!(gw.is_empty());
    }
}
