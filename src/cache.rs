//! The cache itself: a [`Gateway`] decorator that fills a local, bucketed,
//! content-addressed directory on miss and serves from it on hit.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::config::Config;
use crate::gateway::{BlockWriteOptions, BlockWriteResponse, Gateway};
use crate::heldopen::HeldOpenPool;
use crate::layout::Layout;
use crate::locator::Locator;
use crate::prelude::*;
use crate::scheduler::TidyScheduler;

pub(crate) struct CacheInner {
    pub(crate) config: Config,
    pub(crate) layout: Layout,
    pub(crate) pool: Arc<HeldOpenPool>,
    pub(crate) upstream: Arc<dyn Gateway>,
    pub(crate) scheduler: TidyScheduler,
    /// Cached result of the dynamic max-size computation, so repeated tidy
    /// passes don't re-query `fs2::available_space` every time.
    pub(crate) default_max_size: AtomicU64,
}

/// A disk-backed, content-addressed read/write cache sitting in front of an
/// upstream [`Gateway`]. Cheap to clone — it's an `Arc` underneath.
#[derive(Clone)]
pub struct Cache(Arc<CacheInner>);

impl Cache {
    /// Open (creating if necessary) a cache rooted at `config.dir`, backed by
    /// `upstream` for misses and for relaying writes.
    pub async fn new(config: Config, upstream: Arc<dyn Gateway>) -> Result<Cache> {
        let layout = Layout::new(config.dir.clone());
        let base = layout.base().to_path_buf();
        let staging_dir = layout.staging_dir();

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            std::fs::create_dir_all(&base)?;
            std::fs::create_dir_all(&staging_dir)?;
            Ok(())
        })
        .await
        .context("cache directory setup task panicked")?
        .with_context(|| format!("creating cache directory {}", config.dir.display()))?;

        config.log(format!("cache opened at {}", config.dir.display()));

        Ok(Cache(Arc::new(CacheInner {
            config,
            layout,
            pool: Arc::new(HeldOpenPool::new()),
            upstream,
            scheduler: TidyScheduler::new(),
            default_max_size: AtomicU64::new(0),
        })))
    }

    pub(crate) fn inner(&self) -> &Arc<CacheInner> {
        &self.0
    }
}

/// Runs `f` on the blocking thread pool and flattens the join error into the
/// same `anyhow::Result` as the I/O it performs.
async fn blocking_io<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("blocking task panicked")?
        .map_err(Into::into)
}

async fn positional_read(
    pool: &Arc<HeldOpenPool>,
    path: &Path,
    dst: &mut [u8],
    offset: u64,
) -> Result<usize> {
    match crate::heldopen::quick_read_at(pool, path, vec![0u8; dst.len()], offset).await? {
        Some((n, buf)) => {
            dst[..n].copy_from_slice(&buf[..n]);
            Ok(n)
        }
        None => bail!("cache file vanished immediately after warming"),
    }
}

/// Stream the full block from the upstream into a buffer and copy out the
/// requested window, bypassing the local cache entirely. Used as the
/// graceful-degradation fallback when the cache directory itself is
/// unusable.
async fn read_via_upstream(
    inner: &Arc<CacheInner>,
    locator: &Locator,
    dst: &mut [u8],
    offset: u64,
) -> Result<usize> {
    let mut buf = Vec::with_capacity(locator.size() as usize);
    inner
        .upstream
        .block_read(locator, &mut buf)
        .await
        .context("reading from upstream")?;

    let start = offset as usize;
    if start >= buf.len() {
        return Ok(0);
    }
    let end = (start + dst.len()).min(buf.len());
    let n = end - start;
    dst[..n].copy_from_slice(&buf[start..end]);
    Ok(n)
}

/// Fill `file` from the upstream's streaming `block_read`, truncating to
/// whatever the upstream actually sends and verifying it against the
/// locator's declared size.
async fn fill_from_upstream(inner: &Arc<CacheInner>, locator: &Locator, file: &File) -> Result<()> {
    let std_file = file.try_clone().context("cloning cache file handle")?;
    let mut async_file = tokio::fs::File::from_std(std_file);
    async_file.set_len(0).await.context("truncating cache file")?;
    async_file
        .seek(io::SeekFrom::Start(0))
        .await
        .context("seeking cache file")?;

    let written = inner
        .upstream
        .block_read(locator, &mut async_file)
        .await
        .context("reading from upstream")?;
    if written != locator.size() {
        bail!(CacheError::SizeMismatch {
            expected: locator.size(),
            actual: written,
        });
    }
    async_file.sync_all().await.context("fsyncing cache file")?;
    Ok(())
}

/// The slow read path: open-or-create the cache file, take a shared lock to
/// check whether it's already filled, and if not, upgrade to exclusive and
/// fill it from the upstream. Falls back to serving directly from the
/// upstream on any local I/O failure.
async fn slow_read_at(
    inner: &Arc<CacheInner>,
    locator: &Locator,
    dst: &mut [u8],
    offset: u64,
) -> Result<usize> {
    let path = inner.layout.committed_path(locator);

    let open_result: io::Result<File> = tokio::task::spawn_blocking({
        let path = path.clone();
        move || {
            let mut options = OpenOptions::new();
            options.read(true).write(true).create(true);
            crate::fsutil::open_or_create(&path, &options)
        }
    })
    .await
    .context("cache file open task panicked")?;

    let file = match open_result {
        Ok(f) => Arc::new(f),
        Err(e) => {
            warn!("read_at: opening cache file failed ({e}); falling back to upstream");
            return read_via_upstream(inner, locator, dst, offset).await;
        }
    };

    let lock_and_len: Result<u64> = blocking_io({
        let file = file.clone();
        move || {
            fs2::FileExt::lock_shared(&*file)?;
            file.metadata().map(|m| m.len())
        }
    })
    .await;

    let existing_len = match lock_and_len {
        Ok(len) => len,
        Err(e) => {
            warn!("read_at: locking cache file failed ({e:#}); falling back to upstream");
            return read_via_upstream(inner, locator, dst, offset).await;
        }
    };

    if existing_len == locator.size() {
        let _ = blocking_io({
            let file = file.clone();
            move || fs2::FileExt::unlock(&*file)
        })
        .await;
        crate::heldopen::warm(&inner.pool, &path).await;
        return positional_read(&inner.pool, &path, dst, offset).await;
    }

    let upgrade: Result<()> = blocking_io({
        let file = file.clone();
        move || {
            fs2::FileExt::unlock(&*file)?;
            fs2::FileExt::lock_exclusive(&*file)
        }
    })
    .await;
    if let Err(e) = upgrade {
        warn!("read_at: upgrading cache file lock failed ({e:#}); falling back to upstream");
        return read_via_upstream(inner, locator, dst, offset).await;
    }

    // Another process may have filled the file while we waited for the
    // exclusive lock; re-check before overwriting its work.
    let recheck: Result<u64> = blocking_io({
        let file = file.clone();
        move || file.metadata().map(|m| m.len())
    })
    .await;
    let already_filled = matches!(recheck, Ok(len) if len == locator.size());

    if !already_filled {
        if let Err(e) = fill_from_upstream(inner, locator, &file).await {
            let _ = blocking_io({
                let file = file.clone();
                move || fs2::FileExt::unlock(&*file)
            })
            .await;
            warn!("read_at: filling cache file failed ({e:#}); serving directly from upstream");
            return read_via_upstream(inner, locator, dst, offset).await;
        }
    }

    let _ = blocking_io({
        let file = file.clone();
        move || fs2::FileExt::unlock(&*file)
    })
    .await;

    crate::heldopen::warm(&inner.pool, &path).await;
    positional_read(&inner.pool, &path, dst, offset).await
}

#[async_trait]
impl Gateway for Cache {
    #[tracing::instrument(skip(self, dst), fields(locator = %locator, offset, len = dst.len()))]
    async fn read_at(&self, locator: &Locator, dst: &mut [u8], offset: u64) -> Result<usize> {
        TidyScheduler::trigger(&self.0);
        let path = self.0.layout.committed_path(locator);

        match crate::heldopen::quick_read_at(&self.0.pool, &path, vec![0u8; dst.len()], offset).await
        {
            Ok(Some((n, buf))) => {
                dst[..n].copy_from_slice(&buf[..n]);
                return Ok(n);
            }
            Ok(None) => {}
            Err(e) => {
                trace!("read_at: quick path missed ({e:#}); falling back to slow path");
            }
        }

        slow_read_at(&self.0, locator, dst, offset).await
    }

    #[tracing::instrument(skip(self, writer), fields(locator = %locator))]
    async fn block_read(
        &self,
        locator: &Locator,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.read_at(locator, &mut buf, total).await?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .context("writing block_read output")?;
            total += n as u64;
            if total >= locator.size() {
                break;
            }
        }
        Ok(total)
    }

    #[tracing::instrument(skip(self, opts))]
    async fn block_write(&self, opts: BlockWriteOptions) -> Result<BlockWriteResponse> {
        crate::write::block_write(&self.0, opts).await
    }

    #[tracing::instrument(skip(self), fields(locator = %locator))]
    async fn local_locator(&self, locator: &Locator) -> Result<Locator> {
        self.0.upstream.local_locator(locator).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::MemoryGateway;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MemoryGateway::new());
        let cache = Cache::new(Config::new(dir.path()), upstream).await.unwrap();

        let resp = cache
            .block_write(BlockWriteOptions::from_bytes(b"hello world".to_vec()))
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        let n = cache.read_at(&resp.locator, &mut buf, 6).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn read_fills_from_upstream_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MemoryGateway::new());
        let direct = upstream
            .block_write(BlockWriteOptions::from_bytes(b"not cached yet".to_vec()))
            .await
            .unwrap();

        let cache = Cache::new(Config::new(dir.path()), upstream).await.unwrap();
        let mut buf = vec![0u8; direct.locator.size() as usize];
        let n = cache.read_at(&direct.locator, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"not cached yet");

        // Second read should be served from the local file without the
        // upstream being consulted again; we can't observe that directly
        // through this double, but a quick-path hit requires the entry to
        // already be warm.
        let n2 = cache.read_at(&direct.locator, &mut buf, 0).await.unwrap();
        assert_eq!(n2, n);
    }

    #[tokio::test]
    async fn block_read_streams_whole_block() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MemoryGateway::new());
        let cache = Cache::new(Config::new(dir.path()), upstream).await.unwrap();

        let data = vec![7u8; 200_000];
        let resp = cache
            .block_write(BlockWriteOptions::from_bytes(data.clone()))
            .await
            .unwrap();

        let mut out = Vec::new();
        let n = cache.block_read(&resp.locator, &mut out).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }
}
