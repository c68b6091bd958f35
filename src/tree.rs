//! On-disk layout of the data directory and of each build tree.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::arch::{Architecture, Platform};
use crate::error::{IoContext, Result};

/// File the build record is written to, at the top of a tree.
pub const RECORD_FILE: &str = "portable-manifest.json";

/// Directories under the data root shared by every build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDirs {
    pub root: PathBuf,
    pub toolchain: PathBuf,
    pub build: PathBuf,
    pub sources: PathBuf,
    pub logs: PathBuf,
    pub downloads: PathBuf,
}

impl WorkDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            toolchain: root.join("toolchain"),
            build: root.join("build"),
            sources: root.join("src"),
            logs: root.join("logs"),
            downloads: root.join("download"),
            root,
        }
    }

    pub fn create(&self) -> Result<()> {
        for dir in [
            &self.toolchain,
            &self.build,
            &self.sources,
            &self.logs,
            &self.downloads,
        ] {
            fs::create_dir_all(dir).with_path(dir)?;
        }
        Ok(())
    }
}

/// The output directory of one build, named `<version>-<triplet>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTree {
    pub root: PathBuf,
    pub platform: Platform,
    pub arch: Architecture,
    pub version: String,
}

impl BuildTree {
    pub fn new(dirs: &WorkDirs, platform: Platform, arch: Architecture, version: &str) -> Self {
        let name = format!("{version}-{}", platform.triplet(arch));
        Self {
            root: dirs.build.join(name),
            platform,
            arch,
            version: version.to_string(),
        }
    }

    /// A tree rooted at an existing directory.
    pub fn at(root: &Path, platform: Platform, arch: Architecture, version: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            platform,
            arch,
            version: version.to_string(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}-{}", self.version, self.triplet())
    }

    pub fn triplet(&self) -> String {
        self.platform.triplet(self.arch)
    }

    /// `3.10.13` -> `3.10`.
    pub fn short_version(&self) -> String {
        self.version.split('.').take(2).collect::<Vec<_>>().join(".")
    }

    pub fn bin_dir(&self) -> PathBuf {
        match self.platform {
            Platform::Windows => self.root.join("Scripts"),
            _ => self.root.join("bin"),
        }
    }

    /// Directory shared libraries are installed into, relative to the root.
    pub fn lib_name(&self) -> &'static str {
        match self.platform {
            Platform::Windows => "DLLs",
            _ => "lib",
        }
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join(self.lib_name())
    }

    pub fn include_dir(&self) -> PathBuf {
        match self.platform {
            Platform::Windows => self.root.join("Include"),
            _ => self.root.join("include"),
        }
    }

    pub fn interpreter(&self) -> PathBuf {
        match self.platform {
            Platform::Windows => self.bin_dir().join("python.exe"),
            _ => self.bin_dir().join("python3"),
        }
    }

    pub fn stdlib_dir(&self) -> PathBuf {
        match self.platform {
            Platform::Windows => self.root.join("Lib"),
            _ => self
                .lib_dir()
                .join(format!("python{}", self.short_version())),
        }
    }

    pub fn site_packages(&self) -> PathBuf {
        self.stdlib_dir().join("site-packages")
    }

    pub fn record_path(&self) -> PathBuf {
        self.root.join(RECORD_FILE)
    }

    /// Per-step logs for this tree.
    pub fn logs(&self, dirs: &WorkDirs) -> PathBuf {
        dirs.logs.join(self.name())
    }

    /// Unpacked sources for this tree.
    pub fn sources(&self, dirs: &WorkDirs) -> PathBuf {
        dirs.sources.join(self.name())
    }

    /// Archive a packager would produce next to the tree.
    pub fn archive(&self) -> PathBuf {
        self.root.with_file_name(format!("{}.tar.xz", self.name()))
    }

    pub fn is_built(&self) -> bool {
        self.interpreter().exists()
    }

    /// Remove the tree, its unpacked sources and any previous archive.
    pub fn clean(&self, dirs: &WorkDirs) -> Result<()> {
        info!(tree = %self.root.display(), "cleaning");
        for dir in [self.root.clone(), self.sources(dirs), self.logs(dirs)] {
            if dir.exists() {
                fs::remove_dir_all(&dir).with_path(&dir)?;
            }
        }
        let archive = self.archive();
        if archive.exists() {
            fs::remove_file(&archive).with_path(&archive)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_platform() {
        let dirs = WorkDirs::new("/data");
        let linux = BuildTree::new(&dirs, Platform::Linux, Architecture::X86_64, "3.10.13");
        assert_eq!(linux.root, PathBuf::from("/data/build/3.10.13-x86_64-linux-gnu"));
        assert_eq!(
            linux.interpreter(),
            PathBuf::from("/data/build/3.10.13-x86_64-linux-gnu/bin/python3")
        );
        assert_eq!(
            linux.site_packages(),
            PathBuf::from("/data/build/3.10.13-x86_64-linux-gnu/lib/python3.10/site-packages")
        );
        assert_eq!(
            linux.archive(),
            PathBuf::from("/data/build/3.10.13-x86_64-linux-gnu.tar.xz")
        );
        assert_eq!(
            linux.logs(&dirs),
            PathBuf::from("/data/logs/3.10.13-x86_64-linux-gnu")
        );

        let win = BuildTree::new(&dirs, Platform::Windows, Architecture::Amd64, "3.11.4");
        assert_eq!(
            win.interpreter(),
            PathBuf::from("/data/build/3.11.4-amd64-win/Scripts/python.exe")
        );
        assert_eq!(
            win.site_packages(),
            PathBuf::from("/data/build/3.11.4-amd64-win/Lib/site-packages")
        );
    }

    #[test]
    fn clean_removes_tree_sources_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = WorkDirs::new(dir.path());
        dirs.create().unwrap();
        let tree = BuildTree::new(&dirs, Platform::Linux, Architecture::Aarch64, "3.11.7");
        fs::create_dir_all(tree.bin_dir()).unwrap();
        fs::write(tree.interpreter(), b"").unwrap();
        fs::create_dir_all(tree.sources(&dirs).join("zlib-1.2.13")).unwrap();
        fs::write(tree.archive(), b"").unwrap();
        assert!(tree.is_built());

        tree.clean(&dirs).unwrap();
        assert!(!tree.root.exists());
        assert!(!tree.sources(&dirs).exists());
        assert!(!tree.archive().exists());
        assert!(dirs.downloads.is_dir());
        tree.clean(&dirs).unwrap();
    }
}
