//! Dependency build sequencer.
//!
//! Builds the libraries of a manifest one after another into a tree's prefix.
//! Manifest order is build order; nothing is reordered. The first failing step
//! stops the run, since every later entry may link against the one that failed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, IoContext, Result};
use crate::fetch::{self, Download, Fetcher, RetryPolicy};
use crate::manifest::{Manifest, ManifestEntry, Patch, Recipe};
use crate::platform::{Backend, EnvContext};
use crate::process::{Runner, StepCommand};
use crate::utils::write_atomic;

/// Everything a dependency build needs to know about its tree.
pub struct BuildContext<'a> {
    pub backend: &'a dyn Backend,
    pub target: &'a EnvContext<'a>,
    /// Output of [`Backend::build_env`] for `target`.
    pub env: &'a BTreeMap<String, String>,
    /// Directory archives are unpacked into.
    pub sources: &'a Path,
    pub downloads: &'a Path,
    pub logs: &'a Path,
    pub jobs: usize,
}

impl BuildContext<'_> {
    pub fn log(&self, name: &str) -> PathBuf {
        self.logs.join(format!("{name}.log"))
    }

    pub fn placeholders(&self, source: &Path) -> Placeholders<'_> {
        let tc = self.target.toolchain;
        let mut values = BTreeMap::new();
        values.insert("prefix", self.target.prefix.display().to_string());
        values.insert("host", self.target.host_triplet.to_string());
        values.insert("build", self.target.build_triplet.to_string());
        values.insert("jobs", self.jobs.to_string());
        values.insert("toolchain", tc.root.display().to_string());
        values.insert(
            "sysroot",
            tc.sysroot
                .as_ref()
                .map(|s| s.display().to_string())
                .unwrap_or_default(),
        );
        values.insert("source", source.display().to_string());
        Placeholders {
            values,
            env: self.env,
        }
    }
}

/// Substitutes `{name}` and `{env.NAME}` in recipe text. Unknown names are
/// left untouched.
pub struct Placeholders<'a> {
    values: BTreeMap<&'static str, String>,
    env: &'a BTreeMap<String, String>,
}

impl Placeholders<'_> {
    fn lookup(&self, key: &str) -> Option<String> {
        match key.strip_prefix("env.") {
            Some(name) => Some(self.env.get(name).cloned().unwrap_or_default()),
            None => self.values.get(key).cloned(),
        }
    }

    pub fn expand(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let key = &after[..end];
            match self.lookup(key) {
                Some(value) => out.push_str(&value),
                None => {
                    out.push('{');
                    out.push_str(key);
                    out.push('}');
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn expand_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        env.iter()
            .map(|(k, v)| (k.clone(), self.expand(v)))
            .collect()
    }
}

/// What went into a tree, as recorded in its build record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltDependency {
    pub name: String,
    pub version: String,
    pub url: String,
    /// Digest of the archive that was built.
    pub sha256: String,
}

pub struct Sequencer {
    runner: Arc<dyn Runner>,
    fetcher: Arc<dyn Fetcher>,
    retry: RetryPolicy,
    require_checksums: bool,
}

impl Sequencer {
    pub fn new(runner: Arc<dyn Runner>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            runner,
            fetcher,
            retry: RetryPolicy::default(),
            require_checksums: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Refuse entries without a pinned checksum.
    pub fn require_checksums(mut self, require: bool) -> Self {
        self.require_checksums = require;
        self
    }

    pub fn runner(&self) -> &dyn Runner {
        self.runner.as_ref()
    }

    /// Build the selected dependencies of `manifest` in order.
    pub fn run(
        &self,
        manifest: &Manifest,
        only: &[String],
        ctx: &BuildContext,
    ) -> Result<Vec<BuiltDependency>> {
        let selected = manifest.select(only)?;
        let mut built = Vec::with_capacity(selected.len());
        for entry in selected {
            info!(name = %entry.name, version = %entry.version, "building dependency");
            built.push(self.build(entry, ctx)?);
        }
        Ok(built)
    }

    /// Fetch, unpack, patch and build a single entry.
    pub fn build(&self, entry: &ManifestEntry, ctx: &BuildContext) -> Result<BuiltDependency> {
        let log = ctx.log(&entry.name);
        let (source, built) = self.prepare(entry, ctx)?;
        apply_patches(self.runner(), &entry.name, &entry.patches, &source, &log)?;
        for command in commands(entry, &source, ctx) {
            self.step(&entry.name, &command, &log)?;
        }
        Ok(built)
    }

    /// Fetch and unpack `entry` into a fresh source directory.
    pub fn prepare(
        &self,
        entry: &ManifestEntry,
        ctx: &BuildContext,
    ) -> Result<(PathBuf, BuiltDependency)> {
        if entry.sha256.is_none() && self.require_checksums {
            return Err(Error::Manifest(format!(
                "{} {} has no pinned checksum",
                entry.name, entry.version
            )));
        }
        let urls = entry.urls();
        let item = Download {
            name: &entry.name,
            urls: urls.clone(),
            sha256: entry.sha256.as_deref(),
        };
        let archive = fetch::fetch_verified(self.fetcher.as_ref(), self.retry, &item, ctx.downloads)?;
        let name = fetch::archive_name(&urls[0]);
        let source = ctx.sources.join(fetch::source_dir_name(name));
        if source.exists() {
            fs::remove_dir_all(&source).with_path(&source)?;
        }

        let log = ctx.log(&entry.name);
        fetch::extract(self.runner(), &archive, ctx.sources, &log).map_err(|e| match e {
            Error::BuildStepFailed { exit_code, log, .. } => Error::BuildStepFailed {
                dependency: entry.name.clone(),
                exit_code,
                log,
            },
            other => other,
        })?;
        if !source.is_dir() {
            return Err(Error::MissingArtifact(source));
        }
        let built = BuiltDependency {
            name: entry.name.clone(),
            version: entry.version.clone(),
            url: urls[0].clone(),
            sha256: fetch::sha256_file(&archive)?,
        };
        Ok((source, built))
    }

    /// Run one command, turning a non-zero exit into [`Error::BuildStepFailed`].
    pub fn step(&self, dependency: &str, command: &StepCommand, log: &Path) -> Result<()> {
        let exit = self.runner.run(command, log)?;
        if exit.success() {
            return Ok(());
        }
        warn!(%dependency, code = ?exit.code, log = %log.display(), "step failed: {command}");
        Err(Error::BuildStepFailed {
            dependency: dependency.to_string(),
            exit_code: exit.code,
            log: log.to_path_buf(),
        })
    }
}

/// Commands that configure, compile and install `entry` from `source`.
pub fn commands(entry: &ManifestEntry, source: &Path, ctx: &BuildContext) -> Vec<StepCommand> {
    let vars = ctx.placeholders(source);
    let mut env = ctx.env.clone();
    env.extend(vars.expand_env(&entry.env));

    match &entry.recipe {
        Recipe::Autotools {
            args,
            subdir,
            native_only,
        } => {
            let cwd = match subdir {
                Some(dir) => source.join(dir),
                None => source.to_path_buf(),
            };
            let mut configure = StepCommand::new("./configure", &cwd)
                .arg(format!("--prefix={}", ctx.target.prefix.display()));
            if !native_only {
                configure = configure.args(ctx.backend.cross_args(ctx.target));
            }
            configure = configure
                .args(args.iter().map(|a| vars.expand(a)))
                .envs(&env);
            vec![
                configure,
                StepCommand::new("make", &cwd)
                    .arg(format!("-j{}", ctx.jobs))
                    .envs(&env),
                StepCommand::new("make", &cwd).arg("install").envs(&env),
            ]
        }
        Recipe::Steps { steps } => steps
            .iter()
            .map(|step| {
                let cwd = match &step.cwd {
                    Some(dir) => source.join(dir),
                    None => source.to_path_buf(),
                };
                StepCommand::new(vars.expand(&step.program), cwd)
                    .args(step.args.iter().map(|a| vars.expand(a)))
                    .envs(&env)
                    .envs(&vars.expand_env(&step.env))
            })
            .collect(),
    }
}

/// Apply `patches` to the unpacked tree at `source`.
pub fn apply_patches(
    runner: &dyn Runner,
    name: &str,
    patches: &[Patch],
    source: &Path,
    log: &Path,
) -> Result<()> {
    for (index, patch) in patches.iter().enumerate() {
        match patch {
            Patch::Substitute {
                file,
                from,
                to,
                optional,
            } => {
                let path = source.join(file);
                if !path.exists() {
                    if *optional {
                        debug!(%name, file, "optional patch target absent");
                        continue;
                    }
                    return Err(Error::MissingArtifact(path));
                }
                let text = fs::read_to_string(&path).with_path(&path)?;
                if !text.contains(from.as_str()) {
                    debug!(%name, file, "substitution matched nothing");
                    continue;
                }
                write_atomic(&path, text.replace(from.as_str(), to).as_bytes())?;
            }
            Patch::Append { file, text } => {
                let path = source.join(file);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).with_path(parent)?;
                }
                let mut out = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_path(&path)?;
                out.write_all(text.as_bytes()).with_path(&path)?;
            }
            Patch::Unified { diff } => {
                let path = source.join(format!(".portable-{index}.patch"));
                fs::write(&path, diff).with_path(&path)?;
                let command = StepCommand::new("patch", source)
                    .args(["-p0", "-i"])
                    .arg(path.display().to_string());
                let exit = runner.run(&command, log)?;
                if !exit.success() {
                    return Err(Error::BuildStepFailed {
                        dependency: name.to_string(),
                        exit_code: exit.code,
                        log: log.to_path_buf(),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::arch::{ArchPair, Architecture};
    use crate::fetch::testing::StaticFetcher;
    use crate::process::testing::RecordingRunner;
    use crate::toolchain::Toolchain;

    /// Scratch directories and a fake toolchain for sequencer tests.
    pub struct Scratch {
        pub dir: tempfile::TempDir,
        pub toolchain: Toolchain,
        pub prefix: PathBuf,
        pub env: BTreeMap<String, String>,
    }

    impl Scratch {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("toolchain");
            let toolchain = Toolchain {
                pair: ArchPair::native(Architecture::X86_64),
                triplet: "x86_64-linux-gnu".to_string(),
                version: "1".to_string(),
                compiler: root.join("bin/x86_64-linux-gnu-gcc"),
                sysroot: Some(root.join("x86_64-linux-gnu/sysroot")),
                root,
            };
            let mut env = BTreeMap::new();
            env.insert("CFLAGS".to_string(), "-O2".to_string());
            let prefix = dir.path().join("prefix");
            Self {
                dir,
                toolchain,
                prefix,
                env,
            }
        }

        pub fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        pub fn target(&self) -> EnvContext<'_> {
            EnvContext {
                pair: self.toolchain.pair,
                toolchain: &self.toolchain,
                prefix: &self.prefix,
                build_triplet: "x86_64-linux-gnu",
                host_triplet: "x86_64-linux-gnu",
                search_path: "/usr/bin:/bin",
            }
        }
    }

    /// Serves an archive body for every entry.
    pub fn serving(entries: &[&ManifestEntry]) -> StaticFetcher {
        let mut fetcher = StaticFetcher::default();
        for entry in entries {
            fetcher
                .bodies
                .insert(entry.urls()[0].clone(), entry.name.as_bytes().to_vec());
        }
        fetcher
    }

    /// Pretends to be `tar` by creating the source directory an archive
    /// would unpack to.
    pub fn unpacking(mut runner: RecordingRunner) -> RecordingRunner {
        let inner = runner.hook.take();
        runner.hook = Some(Box::new(move |cmd: &StepCommand| {
            if cmd.program == "tar" {
                let archive = PathBuf::from(&cmd.args[1]);
                let name = archive
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                let dir = PathBuf::from(&cmd.args[3]).join(fetch::source_dir_name(name));
                fs::create_dir_all(&dir)?;
                fs::write(dir.join("configure"), "#!/bin/sh\n")?;
            }
            match &inner {
                Some(hook) => hook(cmd),
                None => Ok(()),
            }
        }));
        runner
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::fetch::testing::{no_wait, sha256};
    use crate::manifest::Step;
    use crate::platform::linux::Linux;
    use crate::platform::{autotools, entry};
    use crate::process::testing::RecordingRunner;

    fn manifest(deps: Vec<ManifestEntry>) -> Manifest {
        Manifest {
            dependencies: deps,
            interpreter: entry("python", "3.10.13", "https://example.org/Python-{version}.tar.xz"),
        }
    }

    fn dep(name: &str) -> ManifestEntry {
        entry(name, "1.0", &format!("https://example.org/{name}-{{version}}.tar.gz"))
    }

    fn context<'a>(
        scratch: &'a Scratch,
        target: &'a EnvContext<'a>,
        dirs: &'a (PathBuf, PathBuf, PathBuf),
    ) -> BuildContext<'a> {
        BuildContext {
            backend: &Linux,
            target,
            env: &scratch.env,
            sources: &dirs.0,
            downloads: &dirs.1,
            logs: &dirs.2,
            jobs: 4,
        }
    }

    fn dirs(scratch: &Scratch) -> (PathBuf, PathBuf, PathBuf) {
        (scratch.path("src"), scratch.path("download"), scratch.path("logs"))
    }

    #[test]
    fn builds_in_manifest_order() {
        let scratch = Scratch::new();
        let target = scratch.target();
        let dirs = dirs(&scratch);
        let ctx = context(&scratch, &target, &dirs);

        let mut zlib = dep("zlib");
        zlib.recipe = autotools(&["--shared"]);
        let mut openssl = dep("openssl");
        openssl.recipe = Recipe::Steps {
            steps: vec![Step {
                program: "./Configure".to_string(),
                args: vec!["linux-{env.ARCH}".to_string(), "--prefix={prefix}".to_string()],
                env: BTreeMap::new(),
                cwd: None,
            }],
        };
        let m = manifest(vec![zlib, openssl]);
        let fetcher = Arc::new(serving(&m.dependencies.iter().collect::<Vec<_>>()));
        let runner = Arc::new(unpacking(RecordingRunner::default()));
        let seq = Sequencer::new(runner.clone(), fetcher).with_retry(no_wait());

        let built = seq.run(&m, &[], &ctx).unwrap();
        assert_eq!(built.len(), 2);
        assert_eq!(built[0].sha256, sha256(b"zlib"));

        let prefix = target.prefix.display();
        let rendered = runner.rendered();
        let steps: Vec<_> = rendered.iter().filter(|c| !c.starts_with("tar ")).collect();
        assert_eq!(
            steps,
            vec![
                &format!("./configure --prefix={prefix} --build=x86_64-linux-gnu --host=x86_64-linux-gnu --shared"),
                &"make -j4".to_string(),
                &"make install".to_string(),
                &format!("./Configure linux- --prefix={prefix}"),
            ]
        );
        let log = fs::read_to_string(dirs.2.join("zlib.log")).unwrap();
        assert!(log.contains("$ make install"));
        assert!(dirs.2.join("openssl.log").exists());
    }

    #[test]
    fn first_failure_stops_the_run() {
        let scratch = Scratch::new();
        let target = scratch.target();
        let dirs = dirs(&scratch);
        let ctx = context(&scratch, &target, &dirs);

        let mut broken = dep("broken");
        broken.recipe = Recipe::Steps {
            steps: vec![Step {
                program: "./build-broken".to_string(),
                args: Vec::new(),
                env: BTreeMap::new(),
                cwd: None,
            }],
        };
        let m = manifest(vec![dep("xz"), broken, dep("sqlite")]);
        let fetcher = Arc::new(serving(&m.dependencies.iter().collect::<Vec<_>>()));
        let runner = Arc::new(unpacking(RecordingRunner::failing_on("./build-broken", 2)));
        let seq = Sequencer::new(runner.clone(), fetcher.clone()).with_retry(no_wait());

        match seq.run(&m, &[], &ctx) {
            Err(Error::BuildStepFailed {
                dependency,
                exit_code,
                log,
            }) => {
                assert_eq!(dependency, "broken");
                assert_eq!(exit_code, Some(2));
                assert_eq!(log, dirs.2.join("broken.log"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let requests = fetcher.requests.lock().unwrap().clone();
        assert!(!requests.iter().any(|u| u.contains("sqlite")));
        assert!(!runner.rendered().iter().any(|c| c.contains("sqlite")));
    }

    #[test]
    fn selection_skips_unnamed_entries() {
        let scratch = Scratch::new();
        let target = scratch.target();
        let dirs = dirs(&scratch);
        let ctx = context(&scratch, &target, &dirs);
        let m = manifest(vec![dep("xz"), dep("uuid")]);
        let fetcher = Arc::new(serving(&m.dependencies.iter().collect::<Vec<_>>()));
        let runner = Arc::new(unpacking(RecordingRunner::default()));
        let seq = Sequencer::new(runner, fetcher.clone()).with_retry(no_wait());

        let built = seq.run(&m, &["uuid".to_string()], &ctx).unwrap();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].name, "uuid");
        assert_eq!(fetcher.fetches(), 1);
    }

    #[test]
    fn checksum_failures_build_nothing() {
        let scratch = Scratch::new();
        let target = scratch.target();
        let dirs = dirs(&scratch);
        let ctx = context(&scratch, &target, &dirs);

        let mut xz = dep("xz");
        xz.sha256 = Some(sha256(b"the real xz"));
        let m = manifest(vec![xz]);
        let fetcher = Arc::new(serving(&m.dependencies.iter().collect::<Vec<_>>()));
        let runner = Arc::new(unpacking(RecordingRunner::default()));
        let seq = Sequencer::new(runner.clone(), fetcher).with_retry(no_wait());
        assert!(matches!(
            seq.run(&m, &[], &ctx),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert!(runner.rendered().is_empty());

        let unpinned = manifest(vec![dep("uuid")]);
        let strict = Sequencer::new(
            runner.clone(),
            Arc::new(serving(&unpinned.dependencies.iter().collect::<Vec<_>>())),
        )
        .require_checksums(true);
        assert!(matches!(
            strict.run(&unpinned, &[], &ctx),
            Err(Error::Manifest(_))
        ));
    }

    #[test]
    fn patches_edit_the_source_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path();
        fs::write(source.join("configure"), "ac_cv_buggy_getaddrinfo=yes\n").unwrap();
        fs::create_dir_all(source.join("Modules")).unwrap();
        fs::write(source.join("Modules/Setup"), "# setup\n").unwrap();
        let patches = vec![
            Patch::Substitute {
                file: "configure".to_string(),
                from: "=yes".to_string(),
                to: "=no".to_string(),
                optional: false,
            },
            Patch::Substitute {
                file: "setup.py".to_string(),
                from: "x".to_string(),
                to: "y".to_string(),
                optional: true,
            },
            Patch::Append {
                file: "Modules/Setup".to_string(),
                text: "*disabled*\nnis\n".to_string(),
            },
            Patch::Unified {
                diff: "--- a\n+++ b\n".to_string(),
            },
        ];
        let runner = RecordingRunner::default();
        let log = dir.path().join("python.log");
        apply_patches(&runner, "python", &patches, source, &log).unwrap();

        assert_eq!(
            fs::read_to_string(source.join("configure")).unwrap(),
            "ac_cv_buggy_getaddrinfo=no\n"
        );
        assert_eq!(
            fs::read_to_string(source.join("Modules/Setup")).unwrap(),
            "# setup\n*disabled*\nnis\n"
        );
        assert!(!source.join("setup.py").exists());
        let calls = runner.rendered();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("patch -p0 -i "));

        let required = [Patch::Substitute {
            file: "setup.py".to_string(),
            from: "x".to_string(),
            to: "y".to_string(),
            optional: false,
        }];
        assert!(matches!(
            apply_patches(&runner, "python", &required, source, &log),
            Err(Error::MissingArtifact(_))
        ));
    }

    #[test]
    fn placeholders_expand() {
        let scratch = Scratch::new();
        let target = scratch.target();
        let dirs = dirs(&scratch);
        let ctx = context(&scratch, &target, &dirs);
        let vars = ctx.placeholders(Path::new("/src/zlib"));
        assert_eq!(vars.expand("-j{jobs}"), "-j4");
        assert_eq!(vars.expand("{source}/x {env.CFLAGS}"), "/src/zlib/x -O2");
        assert_eq!(vars.expand("${HOME} {unknown}"), "${HOME} {unknown}");
        assert_eq!(vars.expand("{env.MISSING}|"), "|");
        assert_eq!(vars.expand("tail {"), "tail {");
    }
}
