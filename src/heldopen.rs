//! The held-open file-descriptor pool and the quick/slow read paths that sit
//! on top of it.
//!
//! The pool is a plain `HashMap` behind a short-lived [`parking_lot::Mutex`]:
//! lock, look up or insert, unlock, and do the expensive work (opening a
//! file, or closing a batch of them) outside the lock. Per-entry access goes
//! through the entry's own [`tokio::sync::RwLock`], so a slow open doesn't
//! block unrelated entries and a read guard can be held across the
//! `spawn_blocking` call that does the actual positional read.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::prelude::*;

/// What a held-open entry currently holds.
enum Slot {
    /// The file is open, locked shared, and ready for positional reads.
    Open(Arc<File>),
    /// Opening the file failed; every reader should see the same failure
    /// until the entry is evicted and a fresh open is attempted.
    Failed,
    /// A bulk sweep (or explicit eviction) closed this entry. Any reader
    /// that observes this must retry via the slow path — this is the
    /// "lost race" signal the quick read path surfaces to its caller.
    Closed,
}

struct Entry {
    slot: RwLock<Slot>,
}

/// Process-wide cache of open read-only file handles.
pub struct HeldOpenPool {
    cap: once_cell::sync::OnceCell<usize>,
    map: Mutex<HashMap<PathBuf, Arc<Entry>>>,
}

impl Default for HeldOpenPool {
    fn default() -> Self {
        HeldOpenPool {
            cap: once_cell::sync::OnceCell::new(),
            map: Mutex::new(HashMap::new()),
        }
    }
}

/// Computes the pool capacity from the process's open-file soft limit.
/// Falls back to 256 if the limit can't be queried.
fn compute_cap() -> usize {
    match rlimit::Resource::NOFILE.get() {
        Ok((soft, _hard)) if soft > 40_000 => 10_000,
        Ok((soft, _hard)) if soft > 0 => (soft / 4).max(1) as usize,
        _ => 256,
    }
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(not(unix))]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    // Best effort only: without a native pread, concurrent callers racing on
    // the same fd could interleave seek+read. This crate's locking protocol
    // targets POSIX advisory locks, so non-unix targets are not the primary
    // deployment platform.
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

impl HeldOpenPool {
    pub fn new() -> HeldOpenPool {
        Self::default()
    }

    fn cap(&self) -> usize {
        *self.cap.get_or_init(compute_cap)
    }

    /// Look up an existing entry without creating one. Used by the quick
    /// read path, which must never pay for an open.
    fn existing(&self, path: &Path) -> Option<Arc<Entry>> {
        self.map.lock().get(path).cloned()
    }

    /// Get-or-create the entry for `path`, opening the file if this call is
    /// the one that created it. Returns the (possibly freshly populated)
    /// entry.
    async fn get_or_open(self: &Arc<Self>, path: &Path) -> Arc<Entry> {
        let (entry, owner) = {
            let mut map = self.map.lock();
            if let Some(entry) = map.get(path) {
                (entry.clone(), false)
            } else {
                let entry = Arc::new(Entry {
                    slot: RwLock::new(Slot::Closed),
                });
                map.insert(path.to_path_buf(), entry.clone());
                let exceeded = map.len() > self.cap();
                let swept = if exceeded {
                    Some(std::mem::take(&mut *map))
                } else {
                    None
                };
                if let Some(swept) = swept {
                    // Re-insert the entry we just created; everything else
                    // in `swept` gets closed in the background below.
                    map.insert(path.to_path_buf(), entry.clone());
                    self.spawn_bulk_close(swept, path.to_path_buf());
                }
                (entry, true)
            }
        };

        if owner {
            let mut guard = entry.slot.write().await;
            *guard = open_entry(path).await;
        }

        entry
    }

    /// Close every handle in `detached` (except the one at `keep`, which the
    /// caller has just (re)inserted) after briefly acquiring each entry's
    /// exclusive lock. This is the pool's entire eviction policy: crude, but
    /// cheap, because the pathological worst case is one extra open/close
    /// per read.
    fn spawn_bulk_close(self: &Arc<Self>, detached: HashMap<PathBuf, Arc<Entry>>, keep: PathBuf) {
        tokio::spawn(async move {
            for (path, entry) in detached {
                if path == keep {
                    continue;
                }
                let mut guard = entry.slot.write().await;
                *guard = Slot::Closed;
            }
        });
    }

    /// Schedule removal of `path`'s entry from the map, but only if it is
    /// still the same entry the caller observed failing — a concurrent bulk
    /// sweep or reopen may have already replaced it.
    fn schedule_removal(self: &Arc<Self>, path: PathBuf, observed: Arc<Entry>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut map = pool.map.lock();
            if let Some(current) = map.get(&path) {
                if Arc::ptr_eq(current, &observed) {
                    map.remove(&path);
                }
            }
        });
    }
}

async fn open_entry(path: &Path) -> Slot {
    let path = path.to_path_buf();
    let opened = tokio::task::spawn_blocking(move || -> io::Result<File> {
        let file = File::open(&path)?;
        fs2::FileExt::lock_shared(&file)?;
        Ok(file)
    })
    .await;

    match opened {
        Ok(Ok(file)) => Slot::Open(Arc::new(file)),
        Ok(Err(e)) => {
            trace!("heldopen: open failed: {e}");
            Slot::Failed
        }
        Err(e) => {
            trace!("heldopen: open task panicked: {e}");
            Slot::Failed
        }
    }
}

/// A lock-free-on-miss fast path over the held-open pool. Returns `Ok(None)`
/// if there is no entry yet (the caller should take the slow path to create
/// one), `Ok(Some(n))` on a successful read of `n` bytes, or an error —
/// including [`CacheError::LostRace`] — that always means "retry via the
/// slow path".
pub async fn quick_read_at(
    pool: &Arc<HeldOpenPool>,
    path: &Path,
    mut buf: Vec<u8>,
    offset: u64,
) -> Result<Option<(usize, Vec<u8>)>> {
    let Some(entry) = pool.existing(path) else {
        return Ok(None);
    };

    let result = {
        let guard = entry.slot.read().await;
        match &*guard {
            Slot::Open(file) => {
                let file = file.clone();
                let read = tokio::task::spawn_blocking(move || {
                    let n = positional_read(&file, &mut buf, offset)?;
                    Ok::<_, io::Error>((n, buf))
                })
                .await;
                match read {
                    Ok(Ok(pair)) => Ok(pair),
                    Ok(Err(e)) => Err(anyhow!(e)),
                    Err(e) => Err(anyhow!("positional read task panicked: {e}")),
                }
            }
            Slot::Failed => Err(anyhow!("cache file is known-bad")),
            Slot::Closed => Err(anyhow!(CacheError::LostRace)),
        }
    };

    match result {
        Ok(pair) => Ok(Some(pair)),
        Err(e) => {
            pool.schedule_removal(path.to_path_buf(), entry);
            Err(e)
        }
    }
}

/// Ensure an entry exists for `path` (opening it if necessary) and return
/// whether it is healthy. Used by the slow read path after it has filled
/// the file, so the next quick read hits a warm entry instead of racing to
/// create one.
pub async fn warm(pool: &Arc<HeldOpenPool>, path: &Path) {
    let _ = pool.get_or_open(path).await;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn quick_read_misses_without_entry() {
        let pool = Arc::new(HeldOpenPool::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let got = quick_read_at(&pool, &path, vec![0; 4], 0).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn quick_read_hits_after_warm() {
        let pool = Arc::new(HeldOpenPool::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        warm(&pool, &path).await;
        let (n, buf) = quick_read_at(&pool, &path, vec![0; 5], 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn bulk_sweep_triggers_lost_race() {
        let pool = Arc::new(HeldOpenPool::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"data").unwrap();

        warm(&pool, &path).await;
        let entry = pool.existing(&path).unwrap();
        {
            let mut guard = entry.slot.write().await;
            *guard = Slot::Closed;
        }
        let err = quick_read_at(&pool, &path, vec![0; 4], 0)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<CacheError>().is_some());
    }
}
