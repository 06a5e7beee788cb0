//! Open-or-create and rename-with-parent helpers.
//!
//! Both helpers try the plain operation first, and only pay for
//! `create_dir_all` on the (rare) first-use-of-a-bucket path.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use crate::prelude::*;

#[cfg(unix)]
fn apply_mode(options: &mut OpenOptions, mode: u32) {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(mode);
}

#[cfg(not(unix))]
fn apply_mode(_options: &mut OpenOptions, _mode: u32) {}

#[cfg(unix)]
fn create_dir_mode(dir: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
}

#[cfg(not(unix))]
fn create_dir_mode(dir: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Open `path` with `options`, creating its parent directory (mode `0700`)
/// and retrying exactly once if the open failed because the parent didn't
/// exist yet. Files are always opened mode `0600`.
pub fn open_or_create(path: &Path, options: &OpenOptions) -> io::Result<File> {
    let mut options = options.clone();
    apply_mode(&mut options, 0o600);

    match options.open(path) {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let dir = path
                .parent()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
            match create_dir_mode(dir, 0o700) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            options.open(path)
        }
        Err(e) => Err(e),
    }
}

/// Rename `src` to `dst`, creating `dst`'s parent directory and retrying
/// exactly once on failure.
pub fn rename_with_parent(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            let dir = dst
                .parent()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
            match create_dir_mode(dir, 0o700) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            fs::rename(src, dst)
        }
    }
}

/// RAII guard that releases an advisory flock when dropped, regardless of
/// the path execution took to get there.
pub struct LockGuard<'a>(pub &'a File);

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(self.0);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn open_or_create_makes_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucket").join("file.dat");
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        let f = open_or_create(&path, &options).unwrap();
        drop(f);
        assert!(path.exists());
    }

    #[test]
    fn rename_with_parent_makes_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.tmp");
        fs::write(&src, b"hi").unwrap();
        let dst = dir.path().join("bucket").join("dst.dat");
        rename_with_parent(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"hi");
    }
}
