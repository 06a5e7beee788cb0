//! Deterministic filesystem paths derived from locators.

use crate::locator::Locator;
use crate::prelude::*;

/// Fan-out width: the first `BUCKET_WIDTH` hex characters of the hash become
/// a bucket directory, bounding the number of entries in any one directory.
pub const BUCKET_WIDTH: usize = 3;

/// Extension for a committed cache file.
pub const BLOCK_SUFFIX: &str = ".keepcacheblock";

/// Name of the staging subdirectory for in-flight writes.
pub const TMP_DIRNAME: &str = "tmp";

/// Name of the inter-process tidy lock file, relative to the staging directory.
pub const TIDY_LOCK_NAME: &str = "tidy.lock";

/// The directory layout rooted at a cache directory `D`.
#[derive(Debug, Clone)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    pub fn new(base: impl Into<PathBuf>) -> Layout {
        Layout { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `D/<xxx>/<hash>+<size>.keepcacheblock`
    pub fn committed_path(&self, locator: &Locator) -> PathBuf {
        self.committed_path_for(locator.hash(), locator.hash_and_size())
    }

    /// Same as [`Self::committed_path`], but from raw hash/hash+size strings
    /// — used when deriving the final path from a hash computed *during* a
    /// write, rather than from the caller's locator.
    pub fn committed_path_for(&self, hash: &str, hash_and_size: &str) -> PathBuf {
        let bucket = &hash[..hash.len().min(BUCKET_WIDTH)];
        self.base
            .join(bucket)
            .join(format!("{hash_and_size}{BLOCK_SUFFIX}"))
    }

    /// `D/tmp/`
    pub fn staging_dir(&self) -> PathBuf {
        self.base.join(TMP_DIRNAME)
    }

    /// `D/tmp/<unique>.tmp`, where `<unique>` combines the PID and a UUIDv4
    /// so sibling processes sharing `D` never collide.
    pub fn staging_path(&self) -> PathBuf {
        let unique = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());
        self.staging_dir().join(format!("{unique}.tmp"))
    }

    /// `D/tmp/tidy.lock`
    pub fn tidy_lock_path(&self) -> PathBuf {
        self.staging_dir().join(TIDY_LOCK_NAME)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn committed_path_uses_three_char_bucket() {
        let layout = Layout::new("/cache");
        let locator = Locator::parse("abcdef0123+16").unwrap();
        let path = layout.committed_path(&locator);
        assert_eq!(
            path,
            PathBuf::from("/cache/abc/abcdef0123+16.keepcacheblock")
        );
    }

    #[test]
    fn staging_paths_are_unique() {
        let layout = Layout::new("/cache");
        assert_ne!(layout.staging_path(), layout.staging_path());
    }
}
