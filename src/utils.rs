//! Utility functions.
//!
//! Lexical path arithmetic, tree walking, and the atomic file replacement every
//! in-place rewrite goes through.

use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{IoContext, Result};

/// Lexically resolve `.` and `..` components without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether `path` lies at or below `dir`, compared component-wise.
pub fn is_within(path: &Path, dir: &Path) -> bool {
    normalize(path).starts_with(normalize(dir))
}

/// Relative path leading from directory `from` to `to`.
///
/// Both paths should be absolute. Returns `.` when they are the same directory.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from = normalize(from);
    let to = normalize(to);
    let from_parts: Vec<_> = from.components().collect();
    let to_parts: Vec<_> = to.components().collect();

    let common = from_parts
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from_parts.len() {
        rel.push("..");
    }
    for part in &to_parts[common..] {
        rel.push(part.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// All regular files below `root`, sorted. Symlinks are not followed.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).with_path(&dir)? {
            let entry = entry.with_path(&dir)?;
            let kind = entry.file_type().with_path(entry.path())?;
            if kind.is_dir() {
                pending.push(entry.path());
            } else if kind.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Map a file read-only.
pub fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).with_path(path)?;
    // SAFETY: the tree is not modified by anyone else while a pass runs, and
    // rewrites replace the file by rename rather than writing through the map.
    unsafe { Mmap::map(&file) }.with_path(path)
}

/// Replace `path` with `contents` through a temporary file in the same
/// directory, preserving the original permissions. Readers never observe a
/// partially written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).with_path(dir)?;
    tmp.write_all(contents).with_path(tmp.path())?;
    tmp.as_file().sync_all().with_path(tmp.path())?;
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions()).with_path(tmp.path())?;
    }
    tmp.persist(path).map_err(|e| e.error).with_path(path)?;
    Ok(())
}

/// Recursively copy `src` into `dst`, recreating symlinks as symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_path(dst)?;
    for entry in fs::read_dir(src).with_path(src)? {
        let entry = entry.with_path(src)?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let kind = entry.file_type().with_path(&from)?;
        if kind.is_symlink() {
            let target = fs::read_link(&from).with_path(&from)?;
            symlink(&target, &to).with_path(&to)?;
        } else if kind.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).with_path(&to)?;
        }
    }
    Ok(())
}

/// The last `max` bytes of a log file, lossily decoded. Empty if the file
/// cannot be opened; a failed read keeps what was read before it.
pub fn tail(path: &Path, max: u64) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if file.seek(SeekFrom::Start(len.saturating_sub(max))).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if let Err(err) = file.read_to_end(&mut buf) {
        warn!(path = %path.display(), %err, "log tail is incomplete");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn relative_path_between_siblings() {
        assert_eq!(
            relative_path(Path::new("/t/bin"), Path::new("/t/lib")),
            PathBuf::from("../lib")
        );
        assert_eq!(
            relative_path(Path::new("/t/lib/python3.10/lib-dynload"), Path::new("/t/lib")),
            PathBuf::from("../..")
        );
        assert_eq!(
            relative_path(Path::new("/t/lib"), Path::new("/t/lib")),
            PathBuf::from(".")
        );
    }

    #[test]
    fn within_is_component_wise() {
        assert!(is_within(Path::new("/t/a/../lib/x.so"), Path::new("/t")));
        assert!(!is_within(Path::new("/tree2/lib"), Path::new("/tree")));
        assert!(!is_within(Path::new("/t/../etc"), Path::new("/t")));
    }

    #[test]
    fn atomic_write_keeps_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        write_atomic(&path, b"new contents").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new contents");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn walk_skips_symlinks_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/b.so"), b"b").unwrap();
        fs::write(dir.path().join("a"), b"a").unwrap();
        symlink("b.so", dir.path().join("lib/c.so")).unwrap();

        let files = walk_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("a"), dir.path().join("lib/b.so")]);
    }

    #[test]
    fn tail_returns_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("x.log");
        fs::write(&log, b"0123456789").unwrap();
        assert_eq!(tail(&log, 4), "6789");
        assert_eq!(tail(&dir.path().join("missing"), 4), "");
    }

    #[test]
    fn tail_of_unreadable_log_is_empty() {
        // Opening a directory succeeds on Linux but reading it fails.
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(tail(dir.path(), 4), "");
    }
}
