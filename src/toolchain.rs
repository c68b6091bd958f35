//! Toolchain manager.
//!
//! Provides a compiler toolchain for a (host, target) pair. Toolchains live in
//! a per-pair cache directory marked with the version that produced it; a
//! valid cache is returned as-is. Otherwise the toolchain is unpacked from a
//! checksum-pinned prebuilt archive or built from a crosstool-ng recipe into a
//! staging directory and promoted by rename, so an interrupted attempt never
//! leaves a directory that looks complete. Concurrent callers for the same pair
//! serialize on an exclusive lock file next to the cache directory.

use rustix::fs::{flock, FlockOperation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::arch::{ArchPair, Platform};
use crate::error::{Error, IoContext, Result};
use crate::fetch::{self, Download, Fetcher, RetryPolicy};
use crate::process::{Runner, StepCommand};

/// Name of the marker file recording which version populated a cache directory.
pub const VERSION_MARKER: &str = ".toolchain-version";

/// A usable compiler toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    pub pair: ArchPair,
    pub triplet: String,
    pub version: String,
    pub root: PathBuf,
    pub compiler: PathBuf,
    pub sysroot: Option<PathBuf>,
}

/// Where a toolchain for a pair comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ToolchainSource {
    /// An archive containing `<triplet>/bin/<triplet>-gcc`.
    Prebuilt {
        version: String,
        urls: Vec<String>,
        sha256: String,
    },
    /// A crosstool-ng configuration built with `ct-ng`.
    Recipe {
        version: String,
        config: PathBuf,
        #[serde(default = "default_ct_ng")]
        ct_ng: String,
    },
    /// A compiler already installed on the host.
    System { version: String, compiler: PathBuf },
}

fn default_ct_ng() -> String {
    "ct-ng".to_string()
}

impl ToolchainSource {
    pub fn version(&self) -> &str {
        match self {
            ToolchainSource::Prebuilt { version, .. }
            | ToolchainSource::Recipe { version, .. }
            | ToolchainSource::System { version, .. } => version,
        }
    }
}

/// Toolchain sources keyed by pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolchainCatalog {
    #[serde(flatten)]
    entries: BTreeMap<String, ToolchainSource>,
}

impl ToolchainCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_path(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Recipes found under `config_dir/<host>/<triplet>-ct-ng.config` on Linux,
    /// the system compiler elsewhere.
    pub fn discover(platform: Platform, config_dir: &Path) -> Self {
        let mut catalog = Self::default();
        for &host in platform.architectures() {
            for &target in platform.architectures() {
                let pair = ArchPair::new(host, target);
                let source = match platform {
                    Platform::Linux => {
                        let config = config_dir
                            .join(host.as_str())
                            .join(format!("{}-ct-ng.config", platform.triplet(target)));
                        if !config.exists() {
                            continue;
                        }
                        ToolchainSource::Recipe {
                            version: "crosstool-ng".to_string(),
                            config,
                            ct_ng: default_ct_ng(),
                        }
                    }
                    Platform::Darwin => ToolchainSource::System {
                        version: "system".to_string(),
                        compiler: PathBuf::from("/usr/bin/clang"),
                    },
                    Platform::Windows => ToolchainSource::System {
                        version: "system".to_string(),
                        compiler: PathBuf::from("cl.exe"),
                    },
                };
                catalog.insert(pair, source);
            }
        }
        catalog
    }

    pub fn insert(&mut self, pair: ArchPair, source: ToolchainSource) {
        self.entries.insert(pair.cache_key(), source);
    }

    /// Merge `other` over this catalog.
    pub fn extend(&mut self, other: ToolchainCatalog) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, pair: ArchPair) -> Option<&ToolchainSource> {
        self.entries.get(&pair.cache_key())
    }
}

/// Exclusive advisory lock held for the lifetime of the value.
pub struct CacheLock {
    file: File,
}

impl CacheLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_path(path)?;
        flock(&file, FlockOperation::LockExclusive)
            .map_err(std::io::Error::from)
            .with_path(path)?;
        Ok(Self { file })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = flock(&self.file, FlockOperation::Unlock);
    }
}

pub struct ToolchainManager {
    cache_root: PathBuf,
    platform: Platform,
    catalog: ToolchainCatalog,
    fetcher: Arc<dyn Fetcher>,
    runner: Arc<dyn Runner>,
    retry: RetryPolicy,
    logs: PathBuf,
}

impl ToolchainManager {
    pub fn new(
        cache_root: impl Into<PathBuf>,
        platform: Platform,
        catalog: ToolchainCatalog,
        fetcher: Arc<dyn Fetcher>,
        runner: Arc<dyn Runner>,
        logs: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache_root: cache_root.into(),
            platform,
            catalog,
            fetcher,
            runner,
            retry: RetryPolicy::default(),
            logs: logs.into(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache_dir(&self, pair: ArchPair) -> PathBuf {
        self.cache_root.join(pair.cache_key())
    }

    /// Return the toolchain for `pair`, fetching or building it if the cache
    /// does not already hold a complete one.
    pub fn acquire(&self, pair: ArchPair) -> Result<Toolchain> {
        fs::create_dir_all(&self.cache_root).with_path(&self.cache_root)?;
        let _lock = CacheLock::acquire(
            &self
                .cache_root
                .join(format!("{}.lock", pair.cache_key())),
        )?;

        let source = self.catalog.get(pair);
        if let Some(toolchain) = self.cached(pair, source)? {
            debug!(%pair, root = %toolchain.root.display(), "toolchain cached");
            return Ok(toolchain);
        }
        let source = source.ok_or(Error::ToolchainUnavailable { pair })?;

        let dir = self.cache_dir(pair);
        if dir.exists() {
            info!(%pair, "discarding stale toolchain cache");
            fs::remove_dir_all(&dir).with_path(&dir)?;
        }
        match source {
            ToolchainSource::Prebuilt { urls, sha256, .. } => {
                self.fetch_prebuilt(pair, urls, sha256)?
            }
            ToolchainSource::Recipe { config, ct_ng, .. } => {
                self.build_from_recipe(pair, config, ct_ng)?
            }
            ToolchainSource::System { .. } => {
                fs::create_dir_all(&dir).with_path(&dir)?;
            }
        }

        let marker = dir.join(VERSION_MARKER);
        fs::write(&marker, format!("{}\n", source.version())).with_path(&marker)?;
        let toolchain = self.layout(pair, source.version().to_string(), Some(source));
        if !toolchain.compiler.exists() && !matches!(source, ToolchainSource::System { .. }) {
            return Err(Error::MissingArtifact(toolchain.compiler));
        }
        info!(%pair, compiler = %toolchain.compiler.display(), "toolchain ready");
        Ok(toolchain)
    }

    /// The cached toolchain for `pair` if it is complete and, when `source`
    /// is known, was produced by the same version.
    fn cached(&self, pair: ArchPair, source: Option<&ToolchainSource>) -> Result<Option<Toolchain>> {
        let marker = self.cache_dir(pair).join(VERSION_MARKER);
        let Ok(recorded) = fs::read_to_string(&marker) else {
            return Ok(None);
        };
        let recorded = recorded.trim();
        if source.is_some_and(|s| s.version() != recorded) {
            return Ok(None);
        }
        let toolchain = self.layout(pair, recorded.to_string(), source);
        let usable = matches!(source, Some(ToolchainSource::System { .. }))
            || toolchain.compiler.exists();
        Ok(usable.then_some(toolchain))
    }

    fn layout(&self, pair: ArchPair, version: String, source: Option<&ToolchainSource>) -> Toolchain {
        let root = self.cache_dir(pair);
        let triplet = self.platform.triplet(pair.target);
        let (compiler, sysroot) = match source {
            Some(ToolchainSource::System { compiler, .. }) => (compiler.clone(), None),
            _ => (
                root.join("bin").join(format!("{triplet}-gcc")),
                Some(root.join(&triplet).join("sysroot")),
            ),
        };
        Toolchain {
            pair,
            triplet,
            version,
            root,
            compiler,
            sysroot,
        }
    }

    fn staging(&self, pair: ArchPair) -> Result<PathBuf> {
        let staging = self
            .cache_root
            .join(format!(".{}.partial", pair.cache_key()));
        if staging.exists() {
            fs::remove_dir_all(&staging).with_path(&staging)?;
        }
        fs::create_dir_all(&staging).with_path(&staging)?;
        Ok(staging)
    }

    /// Move a finished toolchain from `staging` into the cache. Archives and
    /// crosstool-ng both nest the toolchain under a `<triplet>` directory.
    fn promote(&self, pair: ArchPair, staging: &Path) -> Result<()> {
        let dir = self.cache_dir(pair);
        let nested = staging.join(self.platform.triplet(pair.target));
        if nested.join("bin").is_dir() {
            fs::rename(&nested, &dir).with_path(&dir)?;
            fs::remove_dir_all(staging).with_path(staging)?;
        } else {
            fs::rename(staging, &dir).with_path(&dir)?;
        }
        Ok(())
    }

    fn log(&self, pair: ArchPair) -> PathBuf {
        self.logs.join(format!("toolchain-{}.log", pair.cache_key()))
    }

    fn fetch_prebuilt(&self, pair: ArchPair, urls: &[String], sha256: &str) -> Result<()> {
        let name = format!("toolchain {}", pair.cache_key());
        let item = Download {
            name: &name,
            urls: urls.to_vec(),
            sha256: Some(sha256),
        };
        let archive = fetch::fetch_verified(
            self.fetcher.as_ref(),
            self.retry,
            &item,
            &self.cache_root.join("downloads"),
        )?;
        let staging = self.staging(pair)?;
        let log = self.log(pair);
        fetch::extract(self.runner.as_ref(), &archive, &staging, &log).map_err(|e| match e {
            Error::BuildStepFailed { log, .. } => Error::ToolchainBuildFailed {
                stage: "extract".to_string(),
                log,
            },
            other => other,
        })?;
        self.promote(pair, &staging)
    }

    fn build_from_recipe(&self, pair: ArchPair, config: &Path, ct_ng: &str) -> Result<()> {
        let work = self
            .cache_root
            .join(format!(".{}.build", pair.cache_key()));
        if work.exists() {
            fs::remove_dir_all(&work).with_path(&work)?;
        }
        fs::create_dir_all(&work).with_path(&work)?;
        let staging = self.staging(pair)?;
        let log = self.log(pair);

        let dot_config = work.join(".config");
        fs::copy(config, &dot_config).map_err(|_| Error::ToolchainBuildFailed {
            stage: "configure".to_string(),
            log: log.clone(),
        })?;

        let mut env = BTreeMap::new();
        env.insert("CT_PREFIX".to_string(), staging.display().to_string());
        env.insert("CT_ALLOW_BUILD_AS_ROOT".to_string(), "y".to_string());
        env.insert("CT_ALLOW_BUILD_AS_ROOT_SURE".to_string(), "y".to_string());

        for stage in ["source", "build"] {
            info!(%pair, stage, "building toolchain");
            let command = StepCommand::new(ct_ng, &work).arg(stage).envs(&env);
            let exit = self.runner.run(&command, &log)?;
            if !exit.success() {
                return Err(Error::ToolchainBuildFailed {
                    stage: stage.to_string(),
                    log,
                });
            }
        }
        self.promote(pair, &staging)?;
        fs::remove_dir_all(&work).with_path(&work)?;
        Ok(())
    }
}
