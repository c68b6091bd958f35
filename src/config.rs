//! Command-line configuration.
//!
//! Every setting is parsed here with `clap`, including the `PORTABLE_*`
//! environment variables, and turned into explicit values for the core.

use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::arch::{ArchPair, Architecture, Platform};
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::pipeline::BuildRequest;
use crate::platform;
use crate::relocate::{RelocateOptions, UnknownFormatPolicy};
use crate::toolchain::ToolchainCatalog;
use crate::tree::{WorkDirs, RECORD_FILE};
use crate::verify::{VerifyOptions, DEFAULT_IMPORTS};

pub const DEFAULT_PYTHON: &str = "3.10.13";

/// Build self-contained interpreter trees that run from any location.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Data directory holding toolchains, sources, logs and trees
    #[arg(long, global = true, env = "PORTABLE_DATA")]
    pub data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build dependencies and the interpreter, then relocate and verify the tree
    Build(BuildArgs),
    /// Acquire cross-compilation toolchains without building anything else
    Toolchain {
        #[command(subcommand)]
        action: ToolchainAction,
    },
    /// Rewrite every binary and script of a tree to be location independent
    Relocate(RelocateArgs),
    /// Relocate individual files added to an already relocated tree
    Fix(FixArgs),
    /// Check a relocated tree from a throwaway copy
    Verify(VerifyArgs),
    /// Print every file of a tree with its SHA-256 as JSON
    Manifest {
        root: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum ToolchainAction {
    /// Download prebuilt toolchains
    Fetch(ToolchainArgs),
    /// Build toolchains from crosstool-ng configurations
    Build(ToolchainArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PlatformArgs {
    /// Target platform (linux, darwin, win32); defaults to the running one
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Target architectures, comma separated; defaults to the build machine's
    #[arg(long = "arch", env = "PORTABLE_ARCH", value_delimiter = ',')]
    pub arch: Vec<Architecture>,
}

impl PlatformArgs {
    pub fn platform(&self) -> Result<Platform> {
        self.platform.map_or_else(Platform::host, Ok)
    }

    /// The build machine's architecture and the validated target list.
    pub fn targets(&self, platform: Platform) -> Result<(Architecture, Vec<Architecture>)> {
        let host = Architecture::host(platform)?;
        let targets = if self.arch.is_empty() {
            vec![host]
        } else {
            self.arch.clone()
        };
        if let Some(bad) = targets.iter().find(|a| !platform.supports(**a)) {
            return Err(Error::Config(format!(
                "{platform} trees cannot target {bad}; supported: {}",
                platform
                    .architectures()
                    .iter()
                    .map(Architecture::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok((host, targets))
    }
}

#[derive(Args, Debug, Clone)]
pub struct CatalogArgs {
    /// JSON toolchain catalog merged over the discovered one
    #[arg(long)]
    pub toolchain_catalog: Option<PathBuf>,

    /// Directory of `<host>/<triplet>-ct-ng.config` files (default: <data>/toolchain-configs)
    #[arg(long)]
    pub toolchain_configs: Option<PathBuf>,
}

impl CatalogArgs {
    pub fn catalog(&self, platform: Platform, dirs: &WorkDirs) -> Result<ToolchainCatalog> {
        let configs = self
            .toolchain_configs
            .clone()
            .unwrap_or_else(|| dirs.root.join("toolchain-configs"));
        let mut catalog = ToolchainCatalog::discover(platform, &configs);
        if let Some(path) = &self.toolchain_catalog {
            catalog.extend(ToolchainCatalog::load(path)?);
        }
        Ok(catalog)
    }
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub target: PlatformArgs,

    #[command(flatten)]
    pub catalog: CatalogArgs,

    /// Interpreter version
    #[arg(long, env = "PORTABLE_PYTHON", default_value = DEFAULT_PYTHON)]
    pub python: String,

    /// Version of the native tree to build first when cross compiling
    #[arg(long, env = "PORTABLE_NATIVE_PYTHON_VERSION")]
    pub native_python_version: Option<String>,

    /// Remove the tree, its sources and logs before building
    #[arg(long, env = "PORTABLE_CLEAN", value_parser = FalseyValueParser::new())]
    pub clean: bool,

    /// Parallel jobs passed to make
    #[arg(short, long, env = "PORTABLE_JOBS")]
    pub jobs: Option<usize>,

    /// Only build these manifest entries, comma separated
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// JSON manifest replacing the built-in one
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Refuse manifest entries without a SHA-256 pin
    #[arg(long)]
    pub require_checksums: bool,

    /// Install pip into the finished tree
    #[arg(long)]
    pub ensurepip: bool,

    /// What to do with binaries that cannot be parsed (skip, fail)
    #[arg(long, default_value = "skip")]
    pub unknown_format: UnknownFormatPolicy,

    /// Skip the verification stage
    #[arg(long)]
    pub no_verify: bool,

    /// Search path inherited by build steps
    #[arg(long, env = "PATH", hide = true, default_value = "")]
    pub search_path: String,
}

impl BuildArgs {
    pub fn request(&self) -> Result<BuildRequest> {
        let platform = self.target.platform()?;
        let (host, targets) = self.target.targets(platform)?;
        let manifest = self.manifest.as_deref().map(Manifest::load).transpose()?;
        let mut request = BuildRequest::new(platform, host, &self.python);
        request.targets = targets;
        request.native_version = self.native_python_version.clone();
        request.only = self.only.clone();
        request.clean = self.clean;
        if let Some(jobs) = self.jobs {
            if jobs == 0 {
                return Err(Error::Config("--jobs must be at least 1".to_string()));
            }
            request.jobs = jobs;
        }
        request.manifest = manifest;
        request.require_checksums = self.require_checksums;
        request.ensurepip = self.ensurepip;
        request.unknown_format = self.unknown_format;
        request.verify = !self.no_verify;
        request.search_path = self.search_path.clone();
        Ok(request)
    }
}

#[derive(Args, Debug)]
pub struct ToolchainArgs {
    #[command(flatten)]
    pub target: PlatformArgs,

    #[command(flatten)]
    pub catalog: CatalogArgs,
}

impl ToolchainArgs {
    pub fn pairs(&self, platform: Platform) -> Result<Vec<ArchPair>> {
        let (host, targets) = self.target.targets(platform)?;
        Ok(targets.into_iter().map(|t| ArchPair::new(host, t)).collect())
    }
}

#[derive(Args, Debug)]
pub struct RelocateArgs {
    pub root: PathBuf,

    /// Platform whose launcher stub is used for scripts; defaults to the running one
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Library directory relative to the root
    #[arg(long, default_value = "lib")]
    pub lib_dir: PathBuf,

    /// Keep DT_RUNPATH entries instead of converting them to DT_RPATH
    #[arg(long)]
    pub keep_runpath: bool,

    /// Additional absolute prefixes the tree was built under
    #[arg(long = "build-prefix")]
    pub build_prefixes: Vec<PathBuf>,

    /// What to do with binaries that cannot be parsed (skip, fail)
    #[arg(long, default_value = "skip")]
    pub unknown_format: UnknownFormatPolicy,
}

impl RelocateArgs {
    pub fn options(&self) -> Result<RelocateOptions> {
        let platform = self.platform.map_or_else(Platform::host, Ok)?;
        Ok(RelocateOptions {
            lib_dir: self.lib_dir.clone(),
            force_rpath: !self.keep_runpath,
            unknown_format: self.unknown_format,
            launcher: platform::backend(platform).launcher(),
            build_prefixes: self.build_prefixes.clone(),
            ..Default::default()
        })
    }
}

#[derive(Args, Debug)]
pub struct FixArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Tree root; found by looking for the build record above each file when omitted
    #[arg(long)]
    pub root: Option<PathBuf>,

    #[arg(long)]
    pub platform: Option<Platform>,

    #[arg(long, default_value = "lib")]
    pub lib_dir: PathBuf,
}

impl FixArgs {
    /// The root of the tree holding `file`.
    pub fn root_for(&self, file: &Path) -> Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        find_root(file).ok_or_else(|| {
            Error::Config(format!(
                "no {RECORD_FILE} above {}; pass --root",
                file.display()
            ))
        })
    }

    pub fn options(&self) -> Result<RelocateOptions> {
        let platform = self.platform.map_or_else(Platform::host, Ok)?;
        Ok(RelocateOptions {
            lib_dir: self.lib_dir.clone(),
            launcher: platform::backend(platform).launcher(),
            ..Default::default()
        })
    }
}

/// The nearest ancestor of `file` holding a build record.
pub fn find_root(file: &Path) -> Option<PathBuf> {
    let file = file.canonicalize().ok()?;
    file.ancestors()
        .skip(1)
        .find(|dir| dir.join(RECORD_FILE).is_file())
        .map(Path::to_path_buf)
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    pub root: PathBuf,

    /// Interpreter to run from the copy, relative to the root
    #[arg(long)]
    pub interpreter: Option<PathBuf>,

    /// Modules the interpreter must import
    #[arg(long = "import", value_delimiter = ',')]
    pub imports: Vec<String>,

    /// Absolute prefixes that must not appear in the tree
    #[arg(long = "build-prefix")]
    pub build_prefixes: Vec<PathBuf>,
}

impl VerifyArgs {
    pub fn options(&self) -> VerifyOptions {
        let imports = if self.imports.is_empty() {
            DEFAULT_IMPORTS.iter().map(|m| m.to_string()).collect()
        } else {
            self.imports.clone()
        };
        VerifyOptions {
            interpreter: self.interpreter.clone(),
            imports,
            build_prefixes: self.build_prefixes.clone(),
        }
    }
}

impl Config {
    /// The data directory layout, rooted at `--data-dir`/`PORTABLE_DATA` or
    /// `~/.local/portable`.
    pub fn dirs(&self) -> Result<WorkDirs> {
        let root = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => {
                let home = std::env::var_os("HOME")
                    .or_else(|| std::env::var_os("USERPROFILE"))
                    .ok_or_else(|| {
                        Error::Config("no home directory; pass --data-dir".to_string())
                    })?;
                PathBuf::from(home).join(".local").join("portable")
            }
        };
        Ok(WorkDirs::new(root))
    }
}
