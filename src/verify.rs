//! Post-relocation verifier.
//!
//! Copies a relocated tree to a fresh temporary location and checks that it
//! still holds together there: every search path is relative to the binary
//! that carries it and lands inside the copy, every library the tree provides
//! is found through those paths, and no script still names the directory the
//! tree was built in. When the tree runs on this machine its interpreter is
//! started from the copy and made to import the native extension modules.

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, IoContext, Result};
use crate::process::{Runner, StepCommand};
use crate::relocate::{self, elf, macho, pe, script, Binary, BinaryFormat};
use crate::utils::{copy_tree, is_within, map_file, relative_path, walk_files};

/// Modules whose import exercises the native dependencies of a tree.
pub const DEFAULT_IMPORTS: &[&str] = &["ssl", "sqlite3", "zlib", "bz2", "lzma", "ctypes", "hashlib"];

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Interpreter to start from the copy, relative to the tree root.
    pub interpreter: Option<PathBuf>,
    pub imports: Vec<String>,
    /// Directories the tree was built in; scripts must not refer to them.
    pub build_prefixes: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Path relative to the tree root.
    pub path: PathBuf,
    pub problem: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub binary_count: usize,
    /// Binaries carrying at least one self-relative search path.
    pub rewritten_count: usize,
    pub script_count: usize,
    pub failures: Vec<Failure>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Err(Error::Verification)` listing every failure, if there are any.
    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            return Ok(self);
        }
        let lines: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.path.display(), f.problem))
            .collect();
        Err(Error::Verification(lines.join("; ")))
    }

    fn fail(&mut self, path: &Path, problem: String) {
        warn!(path = %path.display(), "{problem}");
        self.failures.push(Failure {
            path: path.to_path_buf(),
            problem,
        });
    }
}

pub struct Verifier {
    runner: Arc<dyn Runner>,
    options: VerifyOptions,
    log: PathBuf,
}

impl Verifier {
    pub fn new(runner: Arc<dyn Runner>, options: VerifyOptions, log: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            options,
            log: log.into(),
        }
    }

    /// Verify a moved copy of the tree at `root`. The copy is removed
    /// afterwards.
    pub fn verify(&self, root: &Path) -> Result<Report> {
        let root = root.canonicalize().with_path(root)?;
        let mut prefixes = self.options.build_prefixes.clone();
        prefixes.push(root.clone());

        let scratch = tempfile::Builder::new()
            .prefix("portable-verify-")
            .tempdir()
            .with_path(std::env::temp_dir())?;
        let name = root.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        let copy = scratch.path().join(name);
        copy_tree(&root, &copy)?;
        let copy = copy.canonicalize().with_path(&copy)?;
        info!(from = %root.display(), to = %copy.display(), "verifying moved tree");

        let files = walk_files(&copy)?;
        let provided: HashSet<String> = files
            .iter()
            .filter_map(|f| f.file_name()?.to_str().map(str::to_string))
            .collect();

        let mut report = Report::default();
        for file in &files {
            let rel = relative_path(&copy, file);
            let data = map_file(file)?;
            if data.starts_with(b"#!") {
                report.script_count += 1;
                check_script(&data, &prefixes, &rel, &mut report);
                continue;
            }
            match relocate::inspect(file, &data) {
                Ok(Some(binary)) => {
                    report.binary_count += 1;
                    check_binary(&binary, &copy, &provided, &rel, &mut report);
                }
                Ok(None) => {}
                Err(Error::UnsupportedFormat { reason, .. }) => {
                    debug!(path = %rel.display(), "not inspected: {reason}");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(interpreter) = &self.options.interpreter {
            self.run_interpreter(&copy, interpreter, &mut report)?;
        }
        info!(
            binaries = report.binary_count,
            relative = report.rewritten_count,
            failures = report.failures.len(),
            "verification complete"
        );
        Ok(report)
    }

    fn run_interpreter(&self, copy: &Path, interpreter: &Path, report: &mut Report) -> Result<()> {
        let python = copy.join(interpreter);
        if !python.exists() {
            report.fail(interpreter, "interpreter is missing".to_string());
            return Ok(());
        }
        let mut code = String::from("import os, sys");
        for module in &self.options.imports {
            code.push_str("; import ");
            code.push_str(module);
        }
        // The interpreter must locate itself in the copy, not the original.
        code.push_str(&format!(
            "; prefix = os.path.realpath(sys.prefix); assert prefix == {:?}, prefix; print(prefix)",
            copy.display().to_string()
        ));
        let command = StepCommand::new(python.display().to_string(), copy)
            .args(["-I", "-c"])
            .arg(code);
        let exit = self.runner.run(&command, &self.log)?;
        if !exit.success() {
            report.fail(
                interpreter,
                format!(
                    "interpreter exited with {} (log: {})",
                    exit.code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")),
                    self.log.display()
                ),
            );
        }
        Ok(())
    }
}

fn check_script(data: &[u8], prefixes: &[PathBuf], rel: &Path, report: &mut Report) {
    if script::is_relocated(data) {
        return;
    }
    let Some((shebang, _)) = script::parse(data) else {
        return;
    };
    let interpreter = Path::new(&shebang.interpreter);
    if prefixes.iter().any(|p| is_within(interpreter, p)) {
        report.fail(
            rel,
            format!("interpreter line names the build location {}", shebang.interpreter),
        );
    }
}

fn check_binary(
    binary: &Binary,
    copy: &Path,
    provided: &HashSet<String>,
    rel: &Path,
    report: &mut Report,
) {
    let dir = binary.path.parent().unwrap_or(copy);
    match binary.format {
        BinaryFormat::Elf => {
            let mut dirs = Vec::new();
            for entry in &binary.search_paths {
                match elf::expand_origin(entry, dir) {
                    Some(path) if is_within(&path, copy) => dirs.push(path),
                    Some(_) => report.fail(rel, format!("search path {entry} leaves the tree")),
                    None => report.fail(rel, format!("search path {entry} is absolute")),
                }
            }
            if !dirs.is_empty() {
                report.rewritten_count += 1;
            }
            for dep in &binary.dependencies {
                if elf::is_system_library(dep) || !provided.contains(dep) {
                    continue;
                }
                if !dirs.iter().any(|d| d.join(dep).exists()) {
                    report.fail(rel, format!("{dep} does not resolve through the search path"));
                }
            }
        }
        BinaryFormat::MachO => {
            let mut dirs = Vec::new();
            for entry in &binary.search_paths {
                match macho::expand_loader_path(entry, dir) {
                    Some(path) if is_within(&path, copy) => dirs.push(path),
                    Some(_) => report.fail(rel, format!("rpath {entry} leaves the tree")),
                    None => report.fail(rel, format!("rpath {entry} is absolute")),
                }
            }
            if !dirs.is_empty()
                || binary
                    .dependencies
                    .iter()
                    .any(|d| d.starts_with("@loader_path"))
            {
                report.rewritten_count += 1;
            }
            for dep in &binary.dependencies {
                let resolved = if let Some(path) = macho::expand_loader_path(dep, dir) {
                    path.exists()
                } else if let Some(name) = dep.strip_prefix("@rpath/") {
                    dirs.iter().any(|d| d.join(name).exists())
                } else {
                    // System libraries keep absolute install names.
                    let name = Path::new(dep).file_name().and_then(|n| n.to_str());
                    !name.is_some_and(|n| provided.contains(n))
                };
                if !resolved {
                    report.fail(rel, format!("{dep} does not resolve inside the tree"));
                }
            }
        }
        BinaryFormat::Pe => {
            for dep in &binary.dependencies {
                if pe::is_absolute_import(dep) {
                    report.fail(rel, format!("imports {dep} by absolute path"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, ElfSpec, SearchTag};
    use crate::process::testing::RecordingRunner;
    use crate::relocate::{RelocateOptions, Relocator};
    use std::fs;

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("lib/python3.10/lib-dynload")).unwrap();
        let rpath = root.join("lib").display().to_string();
        fs::write(
            root.join("lib/libssl.so.3"),
            fixtures::elf(&ElfSpec::new(&["libc.so.6"], None)),
        )
        .unwrap();
        fs::write(
            root.join("bin/python3"),
            fixtures::elf(&ElfSpec::new(
                &["libssl.so.3", "libc.so.6"],
                Some((SearchTag::Runpath, &rpath)),
            )),
        )
        .unwrap();
        fs::write(
            root.join("lib/python3.10/lib-dynload/_ssl.so"),
            fixtures::elf(&ElfSpec::new(&["libssl.so.3"], Some((SearchTag::Rpath, &rpath)))),
        )
        .unwrap();
        fs::write(
            root.join("bin/pip3"),
            format!("#!{}/bin/python3\nimport pip\n", root.display()),
        )
        .unwrap();
    }

    fn scratch_tree() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap().join("3.10.13-x86_64-linux-gnu");
        build_tree(&root);
        (dir, root)
    }

    fn verifier(runner: RecordingRunner, dir: &Path, interpreter: bool) -> Verifier {
        Verifier::new(
            Arc::new(runner),
            VerifyOptions {
                interpreter: interpreter.then(|| PathBuf::from("bin/python3")),
                imports: vec!["ssl".to_string()],
                build_prefixes: Vec::new(),
            },
            dir.join("verify.log"),
        )
    }

    #[test]
    fn relocated_tree_passes() {
        let (dir, root) = scratch_tree();
        Relocator::new(&root, RelocateOptions::default())
            .unwrap()
            .relocate_tree()
            .unwrap();

        let runner = RecordingRunner::default();
        let report = verifier(runner, dir.path(), true).verify(&root).unwrap();
        assert!(report.is_ok(), "{:?}", report.failures);
        assert_eq!(report.binary_count, 3);
        assert_eq!(report.rewritten_count, 2);
        assert_eq!(report.script_count, 1);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn interpreter_runs_from_the_copy() {
        let (dir, root) = scratch_tree();
        Relocator::new(&root, RelocateOptions::default())
            .unwrap()
            .relocate_tree()
            .unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let verifier = Verifier::new(
            runner.clone(),
            VerifyOptions {
                interpreter: Some(PathBuf::from("bin/python3")),
                imports: vec!["ssl".to_string(), "zlib".to_string()],
                build_prefixes: Vec::new(),
            },
            dir.path().join("verify.log"),
        );
        verifier.verify(&root).unwrap();

        let calls = runner.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].program.starts_with(&root.display().to_string()));
        assert!(calls[0].program.ends_with("3.10.13-x86_64-linux-gnu/bin/python3"));
        let code = &calls[0].args[2];
        assert!(code.starts_with("import os, sys; import ssl; import zlib; prefix = "));
        let copy = calls[0].cwd.display().to_string();
        assert!(code.contains(&format!("assert prefix == \"{copy}\"")));
    }

    #[test]
    fn unrelocated_tree_fails() {
        let (dir, root) = scratch_tree();
        let report = verifier(RecordingRunner::default(), dir.path(), false)
            .verify(&root)
            .unwrap();
        let problems: Vec<_> = report
            .failures
            .iter()
            .map(|f| (f.path.display().to_string(), f.problem.clone()))
            .collect();
        assert!(problems
            .iter()
            .any(|(p, m)| p == "bin/python3" && m.contains("is absolute")));
        assert!(problems
            .iter()
            .any(|(p, m)| p == "bin/python3" && m.contains("libssl.so.3 does not resolve")));
        assert!(problems
            .iter()
            .any(|(p, m)| p == "bin/pip3" && m.contains("build location")));
        assert!(matches!(report.into_result(), Err(Error::Verification(_))));
    }

    #[test]
    fn failing_interpreter_is_reported() {
        let (dir, root) = scratch_tree();
        Relocator::new(&root, RelocateOptions::default())
            .unwrap()
            .relocate_tree()
            .unwrap();
        let runner = RecordingRunner::failing_on("import ssl", 1);
        let report = verifier(runner, dir.path(), true).verify(&root).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].problem.contains("code 1"));
    }
}
