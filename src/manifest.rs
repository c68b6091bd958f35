//! Dependency manifests.
//!
//! A manifest is an ordered list of third-party libraries to build into a tree,
//! followed by the interpreter source itself. Order is build order: an entry
//! may only declare `after` dependencies that appear earlier in the list.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::{Error, IoContext, Result};

/// A textual change applied to an unpacked source tree before it is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Patch {
    /// Replace every occurrence of `from` with `to` in `file`. An optional
    /// substitution is skipped when the file does not exist.
    Substitute {
        file: String,
        from: String,
        to: String,
        #[serde(default)]
        optional: bool,
    },
    /// Append `text` to `file`, creating it if needed.
    Append { file: String, text: String },
    /// A unified diff applied with `patch -p0` from the source root.
    Unified { diff: String },
}

/// A single command in a custom recipe. Arguments and environment values may
/// use the placeholders `{prefix}`, `{host}`, `{build}`, `{jobs}`,
/// `{toolchain}`, `{sysroot}`, `{source}` and `{env.NAME}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory relative to the source directory.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// How a dependency is configured, compiled and installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipe {
    /// `configure --prefix={prefix} [--build --host] <args>`, `make`, `make install`.
    Autotools {
        #[serde(default)]
        args: Vec<String>,
        /// Directory holding `configure`, relative to the source directory.
        #[serde(default)]
        subdir: Option<String>,
        /// Skip the `--build`/`--host` pair for packages that reject it.
        #[serde(default)]
        native_only: bool,
    },
    /// An explicit command sequence.
    Steps { steps: Vec<Step> },
}

impl Default for Recipe {
    fn default() -> Self {
        Recipe::Autotools {
            args: Vec::new(),
            subdir: None,
            native_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub version: String,
    /// Source URL; `{version}` is substituted.
    pub url: String,
    #[serde(default)]
    pub fallback_url: Option<String>,
    /// Hex SHA-256 of the archive.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub recipe: Recipe,
    /// Extra environment for every step of this entry.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Entries that must be built first.
    #[serde(default)]
    pub after: Vec<String>,
}

impl ManifestEntry {
    pub fn urls(&self) -> Vec<String> {
        std::iter::once(&self.url)
            .chain(self.fallback_url.as_ref())
            .map(|u| u.replace("{version}", &self.version))
            .collect()
    }

    /// The same entry at another version. The checksum is dropped because it
    /// pinned the old archive.
    pub fn at_version(&self, version: &str) -> Self {
        if version == self.version {
            return self.clone();
        }
        Self {
            version: version.to_string(),
            sha256: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub dependencies: Vec<ManifestEntry>,
    pub interpreter: ManifestEntry,
}

impl Manifest {
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Manifest =
            serde_json::from_str(text).map_err(|e| Error::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_path(path)?;
        Self::from_json(&text)
            .map_err(|e| Error::Manifest(format!("{}: {e}", path.display())))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Manifest(e.to_string()))
    }

    /// Names are unique and every `after` names an earlier entry.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.dependencies {
            for dep in &entry.after {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::Manifest(format!(
                        "{} must come after {dep}, which is not listed before it",
                        entry.name
                    )));
                }
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(Error::Manifest(format!("{} is listed twice", entry.name)));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.dependencies.iter().find(|e| e.name == name)
    }

    /// Dependencies to build, in manifest order. An empty `only` selects all.
    pub fn select(&self, only: &[String]) -> Result<Vec<&ManifestEntry>> {
        if let Some(unknown) = only
            .iter()
            .find(|n| self.get(n).is_none() && **n != self.interpreter.name)
        {
            return Err(Error::Manifest(format!("no dependency named {unknown}")));
        }
        Ok(self
            .dependencies
            .iter()
            .filter(|e| only.is_empty() || only.contains(&e.name))
            .collect())
    }

    /// Whether the interpreter itself is part of the selection.
    pub fn builds_interpreter(&self, only: &[String]) -> bool {
        only.is_empty() || only.contains(&self.interpreter.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, after: &[&str]) -> ManifestEntry {
        ManifestEntry {
            name: name.to_string(),
            version: "1.0".to_string(),
            url: format!("https://example.org/{name}-{{version}}.tar.gz"),
            fallback_url: None,
            sha256: None,
            patches: Vec::new(),
            recipe: Recipe::default(),
            env: BTreeMap::new(),
            after: after.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn manifest(deps: Vec<ManifestEntry>) -> Manifest {
        Manifest {
            dependencies: deps,
            interpreter: entry("python", &[]),
        }
    }

    #[test]
    fn urls_substitute_version() {
        let mut e = entry("zlib", &[]);
        e.fallback_url = Some("https://mirror.example/zlib-{version}.tar.gz".into());
        assert_eq!(
            e.urls(),
            vec![
                "https://example.org/zlib-1.0.tar.gz",
                "https://mirror.example/zlib-1.0.tar.gz"
            ]
        );
    }

    #[test]
    fn order_must_respect_after() {
        let ok = manifest(vec![entry("openssl", &[]), entry("krb5", &["openssl"])]);
        assert!(ok.validate().is_ok());

        let bad = manifest(vec![entry("krb5", &["openssl"]), entry("openssl", &[])]);
        assert!(matches!(bad.validate(), Err(Error::Manifest(_))));

        let dup = manifest(vec![entry("zlib", &[]), entry("zlib", &[])]);
        assert!(dup.validate().is_err());
    }

    #[test]
    fn select_keeps_manifest_order() {
        let m = manifest(vec![entry("a", &[]), entry("b", &[]), entry("c", &[])]);
        let names: Vec<_> = m
            .select(&["c".into(), "a".into()])
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(m.select(&["nope".into()]).is_err());
        assert!(!m.builds_interpreter(&["a".into()]));
        assert!(m.builds_interpreter(&[]));
    }

    #[test]
    fn json_defaults_and_patch_kinds() {
        let text = r##"{
            "dependencies": [{
                "name": "sqlite",
                "version": "3.45.0",
                "url": "https://example.org/sqlite-{version}.tar.gz",
                "patches": [{"kind": "append", "file": "Makefile.in", "text": "# x"}],
                "recipe": {"kind": "autotools", "args": ["--enable-shared"]}
            }],
            "interpreter": {"name": "python", "version": "3.10.13", "url": "https://example.org/Python-{version}.tar.xz"}
        }"##;
        let m = Manifest::from_json(text).unwrap();
        assert_eq!(m.dependencies[0].patches.len(), 1);
        assert!(m.interpreter.after.is_empty());
        assert_eq!(m.interpreter.recipe, Recipe::default());
        let again = Manifest::from_json(&m.to_json().unwrap()).unwrap();
        assert_eq!(again, m);
    }

    #[test]
    fn version_override_drops_pin() {
        let mut e = entry("python", &[]);
        e.sha256 = Some("ab".repeat(32));
        assert_eq!(e.at_version("1.0").sha256, e.sha256);
        assert_eq!(e.at_version("3.11.7").sha256, None);
    }
}
