//! Per-run scratch workspace and failure artifact preservation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{HarnessError, HarnessResult};

pub const WORKSPACE_PREFIX: &str = "libfprint-umockdev-test-";

/// Recursively copies `src` into `dst`, creating directories and
/// overwriting existing files. Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Private temporary directory for one harness run. Removed by [`close`]
/// or, failing that, on drop.
///
/// [`close`]: Workspace::close
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> HarnessResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir()
            .map_err(|e| HarnessError::io(std::env::temp_dir(), e))?;
        debug!(path = %dir.path().display(), "created workspace");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copies the workspace to `<errors_root>/<name>`, merging into any
    /// earlier copy.
    pub fn preserve(&self, errors_root: &Path, name: &str) -> HarnessResult<PathBuf> {
        let dest = errors_root.join(name);
        let copied = copy_tree(self.path(), &dest).map_err(|e| HarnessError::io(&dest, e))?;
        info!(dest = %dest.display(), files = copied, "preserved failure artifacts");
        Ok(dest)
    }

    /// Removes the workspace.
    pub fn close(self) -> HarnessResult<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| HarnessError::io(&path, e))?;
        debug!(path = %path.display(), "removed workspace");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_prefix_and_removal() {
        let ws = Workspace::new().unwrap();
        let path = ws.path().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(WORKSPACE_PREFIX));
        assert!(path.is_dir());
        ws.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_preserve_copies_tree_and_overwrites() {
        let errors = tempfile::tempdir().unwrap();
        let ws = Workspace::new().unwrap();
        fs::write(ws.path().join("capture.png"), b"new").unwrap();
        fs::create_dir(ws.path().join("logs")).unwrap();
        fs::write(ws.path().join("logs/driver.log"), b"log").unwrap();

        let dest = errors.path().join("synaptics");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("capture.png"), b"old").unwrap();
        fs::write(dest.join("stale.txt"), b"kept").unwrap();

        let preserved = ws.preserve(errors.path(), "synaptics").unwrap();
        assert_eq!(preserved, dest);
        assert_eq!(fs::read(dest.join("capture.png")).unwrap(), b"new");
        assert_eq!(fs::read(dest.join("logs/driver.log")).unwrap(), b"log");
        assert!(dest.join("stale.txt").exists());

        ws.close().unwrap();
        assert!(dest.join("capture.png").exists());
    }

    #[test]
    fn test_preserve_into_unwritable_root_fails() {
        let ws = Workspace::new().unwrap();
        fs::write(ws.path().join("a"), b"a").unwrap();
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let err = ws.preserve(blocker.path(), "x").unwrap_err();
        assert!(matches!(err, HarnessError::Io { .. }));
    }

    #[test]
    fn test_copy_tree_counts_files() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("a/b/c"), b"c").unwrap();
        fs::write(src.path().join("d"), b"d").unwrap();
        assert_eq!(copy_tree(src.path(), &dst.path().join("out")).unwrap(), 2);
    }
}
