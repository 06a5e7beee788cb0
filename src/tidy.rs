//! Background eviction: walk the cache directory, and if it's over budget,
//! delete the oldest-by-atime files until it isn't.

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::cache::CacheInner;
use crate::layout::BLOCK_SUFFIX;
use crate::prelude::*;

const GIB: u64 = 1024 * 1024 * 1024;

struct Entry {
    path: PathBuf,
    atime: SystemTime,
    size: u64,
}

fn atime_or_mtime(meta: &fs::Metadata) -> SystemTime {
    meta.accessed().or_else(|_| meta.modified()).unwrap_or(SystemTime::UNIX_EPOCH)
}

fn is_tracked_file(path: &std::path::Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    name.ends_with(BLOCK_SUFFIX) || name.ends_with(".tmp")
}

fn scan(base: &std::path::Path) -> (Vec<Entry>, u64) {
    let mut entries = Vec::new();
    let mut total = 0u64;
    for dirent in walkdir::WalkDir::new(base)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_tracked_file(e.path()))
    {
        let meta = match dirent.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let size = meta.len();
        total += size;
        entries.push(Entry {
            path: dirent.into_path(),
            atime: atime_or_mtime(&meta),
            size,
        });
    }
    (entries, total)
}

fn resolve_max_size(inner: &CacheInner, scanned_total: u64) -> u64 {
    if inner.config.max_size > 0 {
        return inner.config.max_size;
    }
    let cached = inner.default_max_size.load(std::sync::atomic::Ordering::SeqCst);
    if cached != 0 {
        return cached;
    }

    let default = match fs2::available_space(inner.layout.base()) {
        Ok(available) => available / 10,
        Err(_) => {
            if scanned_total < GIB {
                GIB
            } else {
                scanned_total
            }
        }
    };
    inner
        .default_max_size
        .store(default, std::sync::atomic::Ordering::SeqCst);
    default
}

/// Run one tidy pass. Never returns an error to the caller's caller — tidy
/// failures are logged and swallowed, since eviction is a background
/// best-effort; this function returns `Result` only so its own
/// implementation can use `?` internally.
#[tracing::instrument(skip(inner), fields(dir = %inner.layout.base().display()))]
pub(crate) async fn run(inner: &CacheInner) -> Result<()> {
    let lock_path = inner.layout.tidy_lock_path();
    let base = inner.layout.base().to_path_buf();

    let lock_file = tokio::task::spawn_blocking(move || -> Result<Option<std::fs::File>> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true);
        let lock_file = crate::fsutil::open_or_create(&lock_path, &options)
            .with_context(|| format!("opening tidy lock {}", lock_path.display()))?;
        match fs2::FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => Ok(Some(lock_file)),
            Err(_) => Ok(None),
        }
    })
    .await??;

    let Some(lock_file) = lock_file else {
        trace!("tidy: another process is already tidying; skipping");
        return Ok(());
    };
    let _guard = crate::fsutil::LockGuard(&lock_file);

    let (mut entries, total) = tokio::task::spawn_blocking({
        let base = base.clone();
        move || scan(&base)
    })
    .await?;

    let maxsize = resolve_max_size(inner, total);
    if total <= maxsize {
        trace!("tidy: {total} bytes <= {maxsize} byte budget; nothing to do");
        return Ok(());
    }

    entries.sort_by_key(|e| e.atime);

    let mut remaining = total;
    let mut deleted = 0usize;
    for entry in entries {
        if remaining <= maxsize {
            break;
        }
        match std::fs::remove_file(&entry.path) {
            Ok(()) => {
                remaining = remaining.saturating_sub(entry.size);
                deleted += 1;
            }
            Err(e) => warn!("tidy: failed to delete {}: {e}", entry.path.display()),
        }
    }
    info!("tidy: deleted {deleted} file(s), {total} -> {remaining} bytes (budget {maxsize})");

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::Cache;
    use crate::config::Config;
    use crate::test_util::MemoryGateway;
    use std::sync::Arc;

    async fn write_block(cache: &Cache, data: &[u8]) -> crate::locator::Locator {
        use crate::gateway::{BlockWriteOptions, Gateway as _};
        let resp = cache
            .block_write(BlockWriteOptions::from_bytes(data.to_vec()))
            .await
            .unwrap();
        resp.locator
    }

    #[tokio::test]
    async fn trims_oldest_entry_first() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MemoryGateway::new());
        let config = Config::new(dir.path()).with_max_size(1024);
        let cache = Cache::new(config, upstream).await.unwrap();

        let _a = write_block(&cache, &[1u8; 512]).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let _b = write_block(&cache, &[2u8; 512]).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let _c = write_block(&cache, &[3u8; 512]).await;

        run(cache.inner()).await.unwrap();

        let (_entries, total) = scan(dir.path());
        assert!(total <= 1024, "expected total <= 1024, got {total}");
    }
}
