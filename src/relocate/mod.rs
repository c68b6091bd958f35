//! Relocation engine.
//!
//! Walks a finished tree and rewrites every native binary so its library
//! search paths are expressed relative to the binary itself, and every script
//! whose interpreter line names an in-tree interpreter so it locates that
//! interpreter relative to its own location.
//!
//! Each binary format implements [`Relocatable`]: `inspect` reads the search
//! paths and dependencies, `relocate` computes the rewritten image. Images are
//! rewritten in place, never grown; every file is replaced atomically.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info, warn};

use crate::error::{Error, IoContext, Result};
use crate::utils::{self, is_within, map_file, normalize, relative_path};

pub mod elf;
pub mod macho;
pub mod pe;
pub mod script;

pub use script::LauncherStyle;

/// Native binary formats the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinaryFormat {
    Elf,
    MachO,
    Pe,
}

/// Search path and dependency view of a native binary.
#[derive(Debug, Clone)]
pub struct Binary {
    pub path: PathBuf,
    pub format: BinaryFormat,
    pub search_paths: Vec<String>,
    pub dependencies: Vec<String>,
}

/// How a binary was changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteKind {
    /// Search path now points at the tree's library directory relative to the binary.
    Relative,
    /// Search path removed because nothing the binary loads lives in the tree.
    Stripped,
}

pub struct Rewrite {
    pub bytes: Vec<u8>,
    pub kind: RewriteKind,
}

/// Per-format capability shared by ELF, Mach-O and PE.
pub trait Relocatable: Sync {
    fn inspect(&self, path: &Path, data: &[u8]) -> Result<Binary>;

    /// The rewritten image, or `None` when the binary is already portable.
    fn relocate(&self, binary: &Binary, data: &[u8], placement: &Placement)
        -> Result<Option<Rewrite>>;
}

/// Where a file sits in the tree being made portable.
pub struct Placement<'a> {
    pub root: &'a Path,
    pub lib_dir: &'a Path,
    /// Directory containing the file being rewritten.
    pub dir: &'a Path,
    /// Absolute locations the tree was built at, which embedded paths may still name.
    pub build_prefixes: &'a [PathBuf],
    pub force_rpath: bool,
}

impl Placement<'_> {
    /// Map an absolute path to its location inside the tree, if it belongs to it.
    pub fn in_tree(&self, path: &Path) -> Option<PathBuf> {
        if !path.is_absolute() {
            return None;
        }
        if is_within(path, self.root) {
            return Some(normalize(path));
        }
        let path = normalize(path);
        self.build_prefixes.iter().find_map(|prefix| {
            path.strip_prefix(normalize(prefix))
                .ok()
                .map(|rel| self.root.join(rel))
        })
    }

    /// Path of the library directory relative to this file's directory.
    pub fn lib_dir_relative(&self) -> PathBuf {
        relative_path(self.dir, self.lib_dir)
    }
}

/// What to do with files that look like binaries but cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownFormatPolicy {
    #[default]
    Skip,
    Fail,
}

impl FromStr for UnknownFormatPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(UnknownFormatPolicy::Skip),
            "fail" => Ok(UnknownFormatPolicy::Fail),
            other => Err(format!("unknown policy `{other}` (expected skip or fail)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelocateOptions {
    /// Library directory, relative to the tree root.
    pub lib_dir: PathBuf,
    /// Turn `DT_RUNPATH` into `DT_RPATH` so the path also applies to indirect dependencies.
    pub force_rpath: bool,
    pub unknown_format: UnknownFormatPolicy,
    pub launcher: LauncherStyle,
    pub build_prefixes: Vec<PathBuf>,
    pub workers: usize,
}

impl Default for RelocateOptions {
    fn default() -> Self {
        Self {
            lib_dir: PathBuf::from("lib"),
            force_rpath: true,
            unknown_format: UnknownFormatPolicy::Skip,
            launcher: LauncherStyle::Linux,
            build_prefixes: Vec::new(),
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

/// Whether a single-file fix changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RelocationSummary {
    pub binaries: usize,
    pub rewritten: usize,
    pub stripped: usize,
    pub scripts: usize,
    pub scripts_rewritten: usize,
    pub skipped: Vec<SkippedFile>,
}

enum Kind {
    Elf,
    MachO,
    Pe,
    Script,
    Unsupported(&'static str),
    Other,
}

enum Outcome {
    Binary(Option<RewriteKind>),
    Script(Change),
    Ignored,
}

fn classify(data: &[u8]) -> Kind {
    use object::FileKind;

    match FileKind::parse(data) {
        Ok(FileKind::Elf32 | FileKind::Elf64) => Kind::Elf,
        Ok(FileKind::MachO32 | FileKind::MachO64) => Kind::MachO,
        Ok(FileKind::Pe32 | FileKind::Pe64) => Kind::Pe,
        Ok(FileKind::MachOFat32 | FileKind::MachOFat64) => {
            Kind::Unsupported("universal Mach-O binaries are not rewritten")
        }
        _ if data.starts_with(b"\x7fELF") => Kind::Unsupported("malformed ELF header"),
        _ if data.starts_with(b"#!") => Kind::Script,
        _ => Kind::Other,
    }
}

/// Rewrites a tree so it can be moved anywhere.
pub struct Relocator {
    root: PathBuf,
    lib_dir: PathBuf,
    options: RelocateOptions,
}

impl Relocator {
    pub fn new(root: &Path, mut options: RelocateOptions) -> Result<Self> {
        let canonical = root.canonicalize().with_path(root)?;
        if !canonical.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        // Embedded paths may use either spelling of the root.
        for prefix in [root.to_path_buf(), canonical.clone()] {
            if prefix.is_absolute() && !options.build_prefixes.contains(&prefix) {
                options.build_prefixes.push(prefix);
            }
        }
        let lib_dir = canonical.join(&options.lib_dir);
        Ok(Self {
            root: canonical,
            lib_dir,
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rewrite every binary and script below the root.
    ///
    /// Files are spread across scoped worker threads. The first fatal error
    /// stops the remaining workers and is returned.
    pub fn relocate_tree(&self) -> Result<RelocationSummary> {
        let files = utils::walk_files(&self.root)?;
        let workers = self.options.workers.clamp(1, files.len().max(1));
        let chunk = files.len().div_ceil(workers).max(1);
        let abort = AtomicBool::new(false);

        info!(root = %self.root.display(), files = files.len(), workers, "relocating tree");

        let results: Vec<Vec<(PathBuf, Result<Outcome>)>> = thread::scope(|scope| {
            let handles: Vec<_> = files
                .chunks(chunk)
                .map(|paths| {
                    let abort = &abort;
                    scope.spawn(move || {
                        let mut done = Vec::with_capacity(paths.len());
                        for path in paths {
                            if abort.load(Ordering::Relaxed) {
                                break;
                            }
                            let result = self.process(path);
                            if let Err(e) = &result {
                                if self.aborts(e) {
                                    abort.store(true, Ordering::Relaxed);
                                }
                            }
                            done.push((path.clone(), result));
                        }
                        done
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut summary = RelocationSummary::default();
        for (path, result) in results.into_iter().flatten() {
            match result {
                Ok(Outcome::Binary(kind)) => {
                    summary.binaries += 1;
                    match kind {
                        Some(RewriteKind::Relative) => summary.rewritten += 1,
                        Some(RewriteKind::Stripped) => summary.stripped += 1,
                        None => {}
                    }
                }
                Ok(Outcome::Script(change)) => {
                    summary.scripts += 1;
                    if change == Change::Changed {
                        summary.scripts_rewritten += 1;
                    }
                }
                Ok(Outcome::Ignored) => {}
                Err(e) if !self.aborts(&e) => {
                    warn!(path = %path.display(), "skipping: {e}");
                    summary.skipped.push(SkippedFile {
                        path,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            binaries = summary.binaries,
            rewritten = summary.rewritten,
            stripped = summary.stripped,
            scripts = summary.scripts_rewritten,
            skipped = summary.skipped.len(),
            "relocation complete"
        );
        Ok(summary)
    }

    /// Rewrite a single file inside the tree.
    pub fn fix(&self, path: &Path) -> Result<Change> {
        let path = path.canonicalize().with_path(path)?;
        if !is_within(&path, &self.root) {
            return Err(Error::Config(format!(
                "{} is outside {}",
                path.display(),
                self.root.display()
            )));
        }
        match self.process(&path)? {
            Outcome::Binary(Some(_)) | Outcome::Script(Change::Changed) => Ok(Change::Changed),
            _ => Ok(Change::Unchanged),
        }
    }

    fn aborts(&self, error: &Error) -> bool {
        error.is_fatal() || self.options.unknown_format == UnknownFormatPolicy::Fail
    }

    fn placement<'a>(&'a self, dir: &'a Path) -> Placement<'a> {
        Placement {
            root: &self.root,
            lib_dir: &self.lib_dir,
            dir,
            build_prefixes: &self.options.build_prefixes,
            force_rpath: self.options.force_rpath,
        }
    }

    fn process(&self, path: &Path) -> Result<Outcome> {
        let data = map_file(path)?;
        let dir = path.parent().unwrap_or(&self.root);
        let placement = self.placement(dir);

        let format: &dyn Relocatable = match classify(&data) {
            Kind::Elf => &elf::ElfFormat,
            Kind::MachO => &macho::MachOFormat,
            Kind::Pe => &pe::PeFormat,
            Kind::Script => {
                return match script::fix(&data, &placement, self.options.launcher) {
                    Some(bytes) => {
                        debug!(path = %path.display(), "rewrote interpreter line");
                        utils::write_atomic(path, &bytes)?;
                        Ok(Outcome::Script(Change::Changed))
                    }
                    None => Ok(Outcome::Script(Change::Unchanged)),
                };
            }
            Kind::Unsupported(reason) => {
                return Err(Error::UnsupportedFormat {
                    path: path.to_path_buf(),
                    reason: reason.to_string(),
                })
            }
            Kind::Other => return Ok(Outcome::Ignored),
        };

        let binary = format.inspect(path, &data)?;
        match format.relocate(&binary, &data, &placement)? {
            Some(rewrite) => {
                debug!(path = %path.display(), kind = ?rewrite.kind, "rewrote search path");
                utils::write_atomic(path, &rewrite.bytes)?;
                Ok(Outcome::Binary(Some(rewrite.kind)))
            }
            None => Ok(Outcome::Binary(None)),
        }
    }
}

/// Parse any supported binary for inspection. `Ok(None)` for non-binaries.
pub fn inspect(path: &Path, data: &[u8]) -> Result<Option<Binary>> {
    let format: &dyn Relocatable = match classify(data) {
        Kind::Elf => &elf::ElfFormat,
        Kind::MachO => &macho::MachOFormat,
        Kind::Pe => &pe::PeFormat,
        Kind::Unsupported(reason) => {
            return Err(Error::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: reason.to_string(),
            })
        }
        Kind::Script | Kind::Other => return Ok(None),
    };
    format.inspect(path, data).map(Some)
}
