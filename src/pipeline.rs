//! Top-level build orchestration.
//!
//! A build request names a platform, an interpreter version and one or more
//! target architectures. Each target becomes one tree built by the same fixed
//! sequence of stages: toolchain, dependencies, interpreter, relocation,
//! verification and the build record. Targets run on their own threads;
//! within a tree every stage runs in order and the first failure ends it.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

use crate::arch::{ArchPair, Architecture, Platform};
use crate::deps::{BuildContext, Sequencer};
use crate::error::{Error, IoContext};
use crate::fetch::{Fetcher, RetryPolicy};
use crate::interpreter::{InterpreterBuilder, InterpreterOptions};
use crate::manifest::Manifest;
use crate::platform::{self, EnvContext};
use crate::process::Runner;
use crate::record::BuildRecord;
use crate::relocate::{RelocateOptions, RelocationSummary, Relocator, UnknownFormatPolicy};
use crate::toolchain::{ToolchainCatalog, ToolchainManager};
use crate::tree::{BuildTree, WorkDirs};
use crate::utils::{relative_path, tail};
use crate::verify::{Report, Verifier, VerifyOptions, DEFAULT_IMPORTS};

/// Bytes of a failed step's log included in the failure report.
pub const LOG_TAIL: u64 = 4096;

/// Everything the core needs to build trees. Built from the command line.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub platform: Platform,
    /// Architecture of the machine running the build.
    pub host: Architecture,
    pub targets: Vec<Architecture>,
    pub version: String,
    /// Version of the native tree to build first for cross builds that lack one.
    pub native_version: Option<String>,
    /// Restrict the build to these manifest entries.
    pub only: Vec<String>,
    pub clean: bool,
    pub jobs: usize,
    /// Replaces the platform's built-in manifest.
    pub manifest: Option<Manifest>,
    pub require_checksums: bool,
    pub ensurepip: bool,
    pub unknown_format: UnknownFormatPolicy,
    pub verify: bool,
    /// `PATH` handed to build steps after the toolchain and tree directories.
    pub search_path: String,
}

impl BuildRequest {
    pub fn new(platform: Platform, host: Architecture, version: &str) -> Self {
        Self {
            platform,
            host,
            targets: vec![host],
            version: version.to_string(),
            native_version: None,
            only: Vec::new(),
            clean: false,
            jobs: thread::available_parallelism().map_or(1, |n| n.get()),
            manifest: None,
            require_checksums: false,
            ensurepip: false,
            unknown_format: UnknownFormatPolicy::Skip,
            verify: true,
            search_path: String::new(),
        }
    }

    fn manifest(&self, version: &str) -> Result<Manifest, Error> {
        let manifest = match &self.manifest {
            Some(m) => {
                let mut m = m.clone();
                m.interpreter = m.interpreter.at_version(version);
                m
            }
            None => platform::backend(self.platform).manifest(version),
        };
        manifest.validate()?;
        Ok(manifest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Toolchain,
    Dependencies,
    Interpreter,
    Relocate,
    Verify,
    Record,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Prepare => "prepare",
            Stage::Toolchain => "toolchain",
            Stage::Dependencies => "dependencies",
            Stage::Interpreter => "interpreter",
            Stage::Relocate => "relocate",
            Stage::Verify => "verify",
            Stage::Record => "record",
        })
    }
}

/// A failed tree: the stage, the underlying error and the end of its log.
#[derive(Debug, thiserror::Error)]
#[error("{tree}: {stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    pub tree: String,
    #[source]
    pub source: Error,
    pub log: Option<PathBuf>,
    /// Last bytes of `log`.
    pub tail: String,
}

impl StageError {
    fn new(stage: Stage, tree: &BuildTree, source: Error) -> Self {
        let log = source.log_path().map(PathBuf::from);
        let tail = log.as_deref().map(|l| tail(l, LOG_TAIL)).unwrap_or_default();
        Self {
            stage,
            tree: tree.name(),
            source,
            log,
            tail,
        }
    }
}

/// Wrap an error from `stage` of `tree`, logging it on the way.
fn at(stage: Stage, tree: &BuildTree) -> impl FnOnce(Error) -> StageError + '_ {
    move |e| {
        let err = StageError::new(stage, tree, e);
        error!(tree = %err.tree, %stage, log = ?err.log, "{}", err.source);
        err
    }
}

/// A finished tree.
#[derive(Debug)]
pub struct TreeOutcome {
    pub tree: BuildTree,
    pub record: BuildRecord,
    pub relocation: Option<RelocationSummary>,
    pub verification: Option<Report>,
}

pub struct Pipeline {
    dirs: WorkDirs,
    runner: Arc<dyn Runner>,
    fetcher: Arc<dyn Fetcher>,
    toolchains: ToolchainManager,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        dirs: WorkDirs,
        platform: Platform,
        catalog: ToolchainCatalog,
        runner: Arc<dyn Runner>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let toolchains = ToolchainManager::new(
            &dirs.toolchain,
            platform,
            catalog,
            fetcher.clone(),
            runner.clone(),
            &dirs.logs,
        );
        Self {
            dirs,
            runner,
            fetcher,
            toolchains,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.toolchains = self.toolchains.with_retry(retry);
        self
    }

    pub fn toolchains(&self) -> &ToolchainManager {
        &self.toolchains
    }

    /// Build every target of `request`, in parallel. A native tree needed
    /// for bootstrapping cross builds is built first.
    pub fn build(&self, request: &BuildRequest) -> Vec<Result<TreeOutcome, StageError>> {
        let mut results = Vec::new();
        let mut targets = request.targets.clone();
        targets.dedup();

        if let Some(version) = self.bootstrap_version(request, &targets) {
            info!(%version, arch = %request.host, "building native tree for bootstrapping");
            let native = self.build_tree(request, ArchPair::native(request.host), &version);
            let failed = native.is_err();
            results.push(native);
            if failed {
                return results;
            }
            if version == request.version {
                targets.retain(|&t| t != request.host);
            }
        }

        let built: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|&target| {
                    let pair = ArchPair::new(request.host, target);
                    scope.spawn(move || self.build_tree(request, pair, &request.version))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });
        results.extend(built);
        results
    }

    /// Version of a native tree that must be built before the cross targets.
    fn bootstrap_version(&self, request: &BuildRequest, targets: &[Architecture]) -> Option<String> {
        if !targets.iter().any(|&t| t != request.host) {
            return None;
        }
        let version = request
            .native_version
            .clone()
            .unwrap_or_else(|| request.version.clone());
        let native = BuildTree::new(&self.dirs, request.platform, request.host, &version);
        if native.is_built() && !(request.clean && version == request.version) {
            return None;
        }
        (request.native_version.is_some() || targets.contains(&request.host)).then_some(version)
    }

    /// Build one tree for `pair`.
    pub fn build_tree(
        &self,
        request: &BuildRequest,
        pair: ArchPair,
        version: &str,
    ) -> Result<TreeOutcome, StageError> {
        let tree = BuildTree::new(&self.dirs, request.platform, pair.target, version);
        info!(tree = %tree.name(), %pair, "building tree");

        let manifest = request.manifest(version).map_err(at(Stage::Prepare, &tree))?;
        if request.clean {
            tree.clean(&self.dirs).map_err(at(Stage::Prepare, &tree))?;
        }
        let logs = tree.logs(&self.dirs);
        let sources = tree.sources(&self.dirs);
        for dir in [&tree.root, &logs, &sources, &self.dirs.downloads] {
            fs::create_dir_all(dir)
                .with_path(dir)
                .map_err(at(Stage::Prepare, &tree))?;
        }

        let toolchain = self.toolchains.acquire(pair).map_err(at(Stage::Toolchain, &tree))?;
        let backend = platform::backend(request.platform);
        let build_triplet = request.platform.triplet(pair.host);
        let host_triplet = request.platform.triplet(pair.target);
        let target = EnvContext {
            pair,
            toolchain: &toolchain,
            prefix: &tree.root,
            build_triplet: &build_triplet,
            host_triplet: &host_triplet,
            search_path: &request.search_path,
        };
        let env = backend.build_env(&target);
        let ctx = BuildContext {
            backend,
            target: &target,
            env: &env,
            sources: &sources,
            downloads: &self.dirs.downloads,
            logs: &logs,
            jobs: request.jobs.max(1),
        };

        let sequencer = Sequencer::new(self.runner.clone(), self.fetcher.clone())
            .with_retry(self.retry)
            .require_checksums(request.require_checksums);
        let dependencies = sequencer
            .run(&manifest, &request.only, &ctx)
            .map_err(at(Stage::Dependencies, &tree))?;

        if !manifest.builds_interpreter(&request.only) {
            let record = BuildRecord::new(&tree, pair, dependencies, None);
            return Ok(TreeOutcome {
                tree,
                record,
                relocation: None,
                verification: None,
            });
        }

        let native = pair.is_cross().then(|| {
            let native_version = request.native_version.as_deref().unwrap_or(version);
            BuildTree::new(&self.dirs, request.platform, pair.host, native_version).interpreter()
        });
        let interpreter = InterpreterBuilder::new(
            &sequencer,
            InterpreterOptions {
                ensurepip: request.ensurepip,
            },
        )
        .build(&manifest, &tree, &ctx, native.as_deref())
        .map_err(at(Stage::Interpreter, &tree))?;

        let relocation = Relocator::new(
            &tree.root,
            RelocateOptions {
                lib_dir: PathBuf::from(tree.lib_name()),
                unknown_format: request.unknown_format,
                launcher: backend.launcher(),
                build_prefixes: vec![tree.root.clone()],
                ..Default::default()
            },
        )
        .and_then(|r| r.relocate_tree())
        .map_err(at(Stage::Relocate, &tree))?;

        let verification = if request.verify {
            let runs_here = !pair.is_cross()
                && Platform::host().is_ok_and(|p| p == request.platform)
                && pair.target == request.host;
            let options = VerifyOptions {
                interpreter: runs_here.then(|| relative_path(&tree.root, &tree.interpreter())),
                imports: DEFAULT_IMPORTS.iter().map(|m| m.to_string()).collect(),
                build_prefixes: vec![tree.root.clone()],
            };
            let report = Verifier::new(self.runner.clone(), options, logs.join("verify.log"))
                .verify(&tree.root)
                .and_then(|r| r.into_result())
                .map_err(at(Stage::Verify, &tree))?;
            Some(report)
        } else {
            None
        };

        let record = BuildRecord::new(&tree, pair, dependencies, Some(interpreter));
        record.write(&tree).map_err(at(Stage::Record, &tree))?;
        info!(tree = %tree.root.display(), "tree complete");
        Ok(TreeOutcome {
            tree,
            record,
            relocation: Some(relocation),
            verification,
        })
    }
}
