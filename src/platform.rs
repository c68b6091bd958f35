//! Platform backends.
//!
//! This module defines the `Backend` trait, which encapsulates everything
//! that differs between operating systems: the compiler environment handed to
//! every build step, the built-in dependency manifest, the launcher preamble
//! used for scripts, and how the interpreter itself is configured and built.

use std::collections::BTreeMap;
use std::path::Path;

use crate::arch::{ArchPair, Platform};
use crate::error::Result;
use crate::manifest::{Manifest, ManifestEntry, Patch, Recipe, Step};
use crate::process::StepCommand;
use crate::relocate::LauncherStyle;
use crate::toolchain::Toolchain;

pub mod darwin;
pub mod linux;
pub mod windows;

/// Inputs for the environment of a build step.
pub struct EnvContext<'a> {
    pub pair: ArchPair,
    pub toolchain: &'a Toolchain,
    pub prefix: &'a Path,
    /// Triplet of the machine running the build.
    pub build_triplet: &'a str,
    /// Triplet of the machine the tree will run on.
    pub host_triplet: &'a str,
    /// `PATH` of the invoking environment, searched after the tree's own
    /// tool directories.
    pub search_path: &'a str,
}

/// Inputs for building the interpreter from an unpacked source tree.
pub struct InterpreterContext<'a> {
    pub env: &'a EnvContext<'a>,
    pub source: &'a Path,
    pub jobs: usize,
    /// Interpreter on the build machine, required for cross builds.
    pub build_python: Option<&'a Path>,
}

pub trait Backend: Send + Sync {
    fn platform(&self) -> Platform;

    /// Environment variables for every dependency and interpreter step.
    fn build_env(&self, ctx: &EnvContext) -> BTreeMap<String, String>;

    /// `--build`/`--host` style arguments for autotools packages.
    fn cross_args(&self, ctx: &EnvContext) -> Vec<String>;

    /// Built-in dependency manifest for `version` of the interpreter.
    fn manifest(&self, version: &str) -> Manifest;

    fn launcher(&self) -> LauncherStyle;

    /// Commands that configure, compile and install the interpreter. Source
    /// edits that must happen first are applied by the caller.
    fn interpreter_steps(&self, ctx: &InterpreterContext, env: &BTreeMap<String, String>)
        -> Vec<StepCommand>;

    /// Arrange build outputs that `interpreter_steps` leave outside the
    /// prefix.
    fn install_layout(&self, _ctx: &InterpreterContext, _version: &str) -> Result<()> {
        Ok(())
    }

    /// Library files copied from the toolchain into the tree's `lib`.
    fn runtime_libraries(&self) -> &'static [&'static str] {
        &[]
    }
}

pub fn backend(platform: Platform) -> &'static dyn Backend {
    match platform {
        Platform::Linux => &linux::Linux,
        Platform::Darwin => &darwin::Darwin,
        Platform::Windows => &windows::Windows,
    }
}

pub(crate) const PYTHON_URL: &str =
    "https://www.python.org/ftp/python/{version}/Python-{version}.tar.xz";

/// An autotools dependency with no pinned checksum.
pub(crate) fn entry(name: &str, version: &str, url: &str) -> ManifestEntry {
    ManifestEntry {
        name: name.to_string(),
        version: version.to_string(),
        url: url.to_string(),
        fallback_url: None,
        sha256: None,
        patches: Vec::new(),
        recipe: Recipe::default(),
        env: BTreeMap::new(),
        after: Vec::new(),
    }
}

pub(crate) fn autotools(args: &[&str]) -> Recipe {
    Recipe::Autotools {
        args: args.iter().map(|a| a.to_string()).collect(),
        subdir: None,
        native_only: false,
    }
}

pub(crate) fn step(program: &str, args: &[&str]) -> Step {
    Step {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        env: BTreeMap::new(),
        cwd: None,
    }
}

pub(crate) fn substitute(file: &str, from: &str, to: &str) -> Patch {
    Patch::Substitute {
        file: file.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        optional: false,
    }
}

/// Extension modules the tree never builds.
pub(crate) fn disable_modules(modules: &[&str]) -> Patch {
    let mut text = String::from("*disabled*\n");
    for module in modules {
        text.push_str(module);
        text.push('\n');
    }
    Patch::Append {
        file: "Modules/Setup".to_string(),
        text,
    }
}

/// Prepend `dirs` to the inherited `search_path`.
pub(crate) fn path_with(dirs: &[&Path], search_path: &str) -> String {
    let mut parts: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
    if !search_path.is_empty() {
        parts.push(search_path.to_string());
    }
    parts.join(":")
}
