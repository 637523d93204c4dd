//! File relocation shared by unpack, preprocess and collectinfo placement
//!
//! [`relocate`] is the only place that decides between moving a file and
//! copying it. In read-only input mode the source is never modified.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Move `src` to `dst`, or copy it when `read_only` is set
///
/// Parent directories of `dst` are created. A rename that fails (for example
/// across filesystems) falls back to copy and remove.
pub fn relocate(src: &Path, dst: &Path, read_only: bool) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if read_only {
        trace!(src = %src.display(), dst = %dst.display(), "copy");
        fs::copy(src, dst)?;
        return Ok(());
    }

    trace!(src = %src.display(), dst = %dst.display(), "move");
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        },
    }
}

/// Map `path` under `from_root` to the same relative location under `to_root`
pub fn mirror_path(path: &Path, from_root: &Path, to_root: &Path) -> Option<PathBuf> {
    path.strip_prefix(from_root).ok().map(|rel| to_root.join(rel))
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_relocate_moves_when_writable() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in/a.log");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"line\n").unwrap();

        let dst = dir.path().join("out/cluster/1_node_1");
        relocate(&src, &dst, false).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"line\n");
    }

    #[test]
    fn test_relocate_copies_when_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.log");
        fs::write(&src, b"line\n").unwrap();

        let dst = dir.path().join("copy/a.log");
        relocate(&src, &dst, true).unwrap();
        assert!(src.exists());
        assert!(dst.exists());
    }

    #[test]
    fn test_mirror_path() {
        let mirrored = mirror_path(
            Path::new("/data/input/s3source/a/b.tgz"),
            Path::new("/data/input"),
            Path::new("/data/staging"),
        );
        assert_eq!(mirrored, Some(PathBuf::from("/data/staging/s3source/a/b.tgz")));
        assert_eq!(
            mirror_path(Path::new("/elsewhere/b.tgz"), Path::new("/data/input"), Path::new("/s")),
            None
        );
    }
}
