//! Build records and file listings of finished trees.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::arch::{ArchPair, Platform};
use crate::deps::BuiltDependency;
use crate::error::{Error, IoContext, Result};
use crate::fetch::sha256_file;
use crate::tree::{BuildTree, RECORD_FILE};
use crate::utils::{relative_path, walk_files, write_atomic};

/// What a tree was built from, written to `portable-manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub version: String,
    pub platform: Platform,
    pub pair: ArchPair,
    /// RFC 3339 creation time.
    pub created: String,
    pub dependencies: Vec<BuiltDependency>,
    pub interpreter: Option<BuiltDependency>,
}

impl BuildRecord {
    pub fn new(
        tree: &BuildTree,
        pair: ArchPair,
        dependencies: Vec<BuiltDependency>,
        interpreter: Option<BuiltDependency>,
    ) -> Self {
        Self {
            version: tree.version.clone(),
            platform: tree.platform,
            pair,
            created: chrono::Utc::now().to_rfc3339(),
            dependencies,
            interpreter,
        }
    }

    pub fn write(&self, tree: &BuildTree) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Manifest(e.to_string()))?;
        write_atomic(&tree.record_path(), json.as_bytes())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_path(path)?;
        serde_json::from_str(&text).map_err(|e| Error::Manifest(format!("{}: {e}", path.display())))
    }
}

/// One regular file of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the tree root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// Every regular file under `root` with its digest, sorted by path. The build
/// record is left out since it changes on every build.
pub fn file_manifest(root: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for file in walk_files(root)? {
        let rel = relative_path(root, &file);
        if rel == Path::new(RECORD_FILE) {
            continue;
        }
        let size = fs::metadata(&file).with_path(&file)?.len();
        entries.push(FileEntry {
            path: rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            size,
            sha256: sha256_file(&file)?,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::tree::WorkDirs;

    #[test]
    fn record_round_trips_through_tree() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = WorkDirs::new(dir.path());
        let tree = BuildTree::new(&dirs, Platform::Linux, Architecture::Aarch64, "3.10.13");
        fs::create_dir_all(&tree.root).unwrap();
        let zlib = BuiltDependency {
            name: "zlib".to_string(),
            version: "1.2.13".to_string(),
            url: "https://zlib.net/fossils/zlib-1.2.13.tar.gz".to_string(),
            sha256: "00".repeat(32),
        };
        let record = BuildRecord::new(
            &tree,
            ArchPair::new(Architecture::X86_64, Architecture::Aarch64),
            vec![zlib],
            None,
        );
        record.write(&tree).unwrap();
        let loaded = BuildRecord::load(&tree.record_path()).unwrap();
        assert_eq!(loaded, record);
        assert!(chrono::DateTime::parse_from_rfc3339(&loaded.created).is_ok());
    }

    #[test]
    fn listing_is_sorted_and_skips_record() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("lib/libz.so.1"), b"zlib").unwrap();
        fs::write(root.join("bin/python3"), b"python").unwrap();
        fs::write(root.join(RECORD_FILE), b"{}").unwrap();

        let files = file_manifest(root).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["bin/python3", "lib/libz.so.1"]);
        assert_eq!(files[1].size, 4);
        assert_eq!(
            files[0].sha256,
            crate::fetch::testing::sha256(b"python")
        );
    }
}
