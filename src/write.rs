//! The write pass-through pipeline: tee a single source into a temp file, an
//! incremental MD5 hash, and a pipe read by the upstream gateway, then
//! rename the temp file into place once everything checks out.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::cache::CacheInner;
use crate::gateway::{BlockSource, BlockWriteOptions, BlockWriteResponse, Gateway as _};
use crate::layout::Layout;
use crate::prelude::*;
use crate::scheduler::TidyScheduler;

const CHUNK_SIZE: usize = 64 * 1024;

/// Removes the staging file on drop unless [`Self::keep`] was called. The
/// feeder owns this: it is the only task that closes and renames the temp
/// file, so it is also the only task that cleans it up on failure.
struct StagingGuard {
    path: Option<PathBuf>,
}

impl StagingGuard {
    fn new(path: PathBuf) -> StagingGuard {
        StagingGuard { path: Some(path) }
    }

    fn keep(mut self) {
        self.path = None;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

struct FeederOutcome {
    committed_path: Option<PathBuf>,
}

/// How a failed feeder outcome should be treated by its caller.
enum FeedError {
    /// Reading the caller's own source failed; nothing trustworthy was
    /// produced, so this is surfaced as the primary error.
    Source(anyhow::Error),
    /// The computed size or hash didn't match what the caller declared. The
    /// upstream write may still have succeeded, but the cache has nothing
    /// to show for it; surfaced as the primary error regardless.
    Mismatch(anyhow::Error),
    /// A local disk problem with the temp file itself (open, write, fsync,
    /// rename). The cache side-effect is dropped, but this is not the
    /// caller's problem if the upstream write went through fine — the
    /// caller falls back to the upstream's own result instead of surfacing
    /// this.
    LocalIo(anyhow::Error),
}

pub(crate) async fn block_write(
    inner: &Arc<CacheInner>,
    opts: BlockWriteOptions,
) -> Result<BlockWriteResponse> {
    TidyScheduler::trigger(inner);

    let staging_path = inner.layout.staging_path();
    let open_result = tokio::task::spawn_blocking({
        let staging_path = staging_path.clone();
        move || {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create_new(true);
            crate::fsutil::open_or_create(&staging_path, &options)
        }
    })
    .await
    .context("temp file open task panicked")?;

    let temp_file = match open_result {
        Ok(f) => f,
        Err(e) => {
            warn!("block_write: couldn't create temp file ({e}); falling back to upstream directly");
            return inner.upstream.block_write(opts).await;
        }
    };

    let expected_size = opts.expected_size.or_else(|| opts.source.len_hint());
    let expected_hash = opts.expected_hash;
    let hints = opts.hints;
    let source = opts.source;

    let (pipe_writer, pipe_reader) = tokio::io::duplex(CHUNK_SIZE);
    let cancel = CancellationToken::new();

    let feeder_handle = tokio::spawn(feed(
        source,
        tokio::fs::File::from_std(temp_file),
        pipe_writer,
        expected_size,
        expected_hash.clone(),
        inner.layout.clone(),
        staging_path,
        cancel.clone(),
    ));

    let upstream_opts = BlockWriteOptions {
        source: BlockSource::Reader(Box::pin(pipe_reader)),
        expected_size,
        expected_hash,
        hints,
    };
    let upstream_result = inner.upstream.block_write(upstream_opts).await;
    if upstream_result.is_err() {
        // Symmetric to the feeder cancelling the upstream on its own
        // errors: an upstream failure tells the feeder there's no point
        // continuing to copy.
        cancel.cancel();
    }

    let feeder_result: std::result::Result<FeederOutcome, FeedError> =
        feeder_handle.await.context("write feeder task panicked")?;

    match feeder_result {
        Err(FeedError::Source(e)) | Err(FeedError::Mismatch(e)) => {
            // The feeder's error is strictly more diagnostic than whatever
            // "cancelled" or "broken pipe" the upstream saw as a
            // consequence of it.
            Err(e)
        }
        Err(FeedError::LocalIo(e)) => {
            // A disk hiccup on our own staging file is not the caller's
            // problem if the upstream committed the block fine.
            warn!("block_write: cache side-effect dropped after local I/O error ({e:#})");
            upstream_result
        }
        Ok(outcome) => {
            if let Some(path) = &outcome.committed_path {
                crate::heldopen::warm(&inner.pool, path).await;
            }
            upstream_result
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn feed(
    source: BlockSource,
    mut temp_file: tokio::fs::File,
    mut pipe_writer: tokio::io::DuplexStream,
    expected_size: Option<u64>,
    expected_hash: Option<String>,
    layout: Layout,
    staging_path: PathBuf,
    cancel: CancellationToken,
) -> std::result::Result<FeederOutcome, FeedError> {
    let guard = StagingGuard::new(staging_path.clone());
    let mut hasher = md5::Context::new();
    let mut written: u64 = 0;
    // Once a temp-file write fails, stop attempting further ones (the file
    // is presumed broken) but keep reading the source and feeding the pipe,
    // so a disk problem on our side doesn't starve the upstream of bytes it
    // would otherwise have committed successfully.
    let mut local_io_err: Option<anyhow::Error> = None;

    async fn write_temp(
        temp_file: &mut tokio::fs::File,
        buf: &[u8],
        local_io_err: &mut Option<anyhow::Error>,
    ) {
        if local_io_err.is_some() {
            return;
        }
        if let Err(e) = temp_file.write_all(buf).await {
            *local_io_err = Some(anyhow!(e).context("writing temp file"));
        }
    }

    match source {
        BlockSource::Bytes(data) => {
            hasher.consume(&data);
            write_temp(&mut temp_file, &data, &mut local_io_err).await;
            // Upstream may have already stopped reading (e.g. it failed
            // for unrelated reasons); that's not this feeder's problem to
            // report.
            let _ = pipe_writer.write_all(&data).await;
            written = data.len() as u64;
        }
        BlockSource::Reader(mut reader) => {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let n = match reader.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        cancel.cancel();
                        return Err(FeedError::Source(anyhow!(e).context("reading write source")));
                    }
                };
                if n == 0 {
                    break;
                }
                hasher.consume(&buf[..n]);
                write_temp(&mut temp_file, &buf[..n], &mut local_io_err).await;
                if pipe_writer.write_all(&buf[..n]).await.is_err() {
                    // Upstream closed its end; keep filling the cache file
                    // from the rest of the source regardless.
                }
                written += n as u64;
            }
        }
    }

    if let Some(expected) = expected_size {
        if expected != written {
            cancel.cancel();
            error!("block_write: size mismatch (expected {expected}, wrote {written})");
            return Err(FeedError::Mismatch(anyhow!(CacheError::SizeMismatch {
                expected,
                actual: written,
            })));
        }
    }

    if let Some(e) = local_io_err {
        return Err(FeedError::LocalIo(e));
    }

    if let Err(e) = temp_file.sync_all().await {
        return Err(FeedError::LocalIo(anyhow!(e).context("fsyncing temp file")));
    }
    drop(temp_file);

    let digest = hasher.compute();
    let hash_hex = format!("{digest:x}");

    if let Some(expected) = &expected_hash {
        if !expected.eq_ignore_ascii_case(&hash_hex) {
            cancel.cancel();
            error!("block_write: hash mismatch (expected {expected}, computed {hash_hex})");
            return Err(FeedError::Mismatch(anyhow!(CacheError::HashMismatch {
                expected: expected.clone(),
                actual: hash_hex,
            })));
        }
    }

    let hash_and_size = format!("{hash_hex}+{written}");
    let committed_path = layout.committed_path_for(&hash_hex, &hash_and_size);
    let committed_path_for_rename = committed_path.clone();
    let rename_result = tokio::task::spawn_blocking(move || {
        crate::fsutil::rename_with_parent(&staging_path, &committed_path_for_rename)
    })
    .await;

    match rename_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(FeedError::LocalIo(anyhow!(e).context("renaming temp file into place")));
        }
        Err(e) => {
            return Err(FeedError::LocalIo(anyhow!("rename task panicked: {e}")));
        }
    }

    guard.keep();
    Ok(FeederOutcome {
        committed_path: Some(committed_path),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::Cache;
    use crate::config::Config;
    use crate::test_util::MemoryGateway;

    #[tokio::test]
    async fn commits_matching_hash() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MemoryGateway::new());
        let cache = Cache::new(Config::new(dir.path()), upstream).await.unwrap();

        let data = b"hello world".to_vec();
        let hash = format!("{:x}", md5::compute(&data));
        let opts = BlockWriteOptions::from_bytes(data.clone()).with_expected_hash(hash.clone());
        let resp = cache.block_write(opts).await.unwrap();
        assert_eq!(resp.locator.hash(), hash);
        assert_eq!(resp.locator.size(), data.len() as u64);
    }

    #[tokio::test]
    async fn rejects_hash_mismatch_without_committing() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MemoryGateway::new());
        let cache = Cache::new(Config::new(dir.path()), upstream).await.unwrap();

        let opts = BlockWriteOptions::from_bytes(b"hello".to_vec())
            .with_expected_hash("deadbeefdeadbeefdeadbeefdeadbeef");
        let err = cache.block_write(opts).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::HashMismatch { .. })
        ));

        let mut entries = walkdir::WalkDir::new(dir.path().join("tmp"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file());
        assert!(entries.next().is_none(), "temp file should have been removed");
    }

    #[tokio::test]
    async fn rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MemoryGateway::new());
        let cache = Cache::new(Config::new(dir.path()), upstream).await.unwrap();

        let opts = BlockWriteOptions::from_bytes(b"hello".to_vec()).with_expected_size(99);
        let err = cache.block_write(opts).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::SizeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn local_io_error_falls_back_to_upstream_result() {
        // A temp-file write failure must not mask a successful upstream
        // write: the caller should still get back the upstream's locator,
        // not an error, and nothing should land under the cache directory.
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MemoryGateway::new());
        let cache = Cache::new(Config::new(dir.path()), upstream).await.unwrap();

        let staging_path = dir.path().join("tmp").join("broken.tmp");
        std::fs::create_dir_all(staging_path.parent().unwrap()).unwrap();
        std::fs::write(&staging_path, b"").unwrap();
        let read_only_temp_file = tokio::fs::File::from_std(
            std::fs::OpenOptions::new().read(true).open(&staging_path).unwrap(),
        );

        let (pipe_writer, mut pipe_reader) = tokio::io::duplex(CHUNK_SIZE);
        let cancel = CancellationToken::new();
        let data = b"hello world".to_vec();

        let feed_handle = tokio::spawn(feed(
            BlockSource::Bytes(data.clone()),
            read_only_temp_file,
            pipe_writer,
            None,
            None,
            cache.inner().layout.clone(),
            staging_path.clone(),
            cancel,
        ));

        // Drain the pipe the way the upstream would, so the feeder isn't
        // blocked on a full buffer.
        let mut drained = Vec::new();
        pipe_reader.read_to_end(&mut drained).await.unwrap();
        assert_eq!(drained, data);

        let result = feed_handle.await.unwrap();
        assert!(matches!(result, Err(FeedError::LocalIo(_))));
        assert!(!staging_path.exists(), "staging guard should have removed the temp file");
    }
}
