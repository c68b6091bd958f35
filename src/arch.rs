//! Platform and architecture model.
//!
//! This module names the operating systems and CPU architectures a tree can be
//! built for, and derives the target triplets and tree directory names from them.
//! The per-platform build behavior lives in `platform`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A CPU architecture as spelled by the platform that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "amd64")]
    Amd64,
    #[serde(rename = "x86")]
    X86,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Aarch64 => "aarch64",
            Architecture::Arm64 => "arm64",
            Architecture::Amd64 => "amd64",
            Architecture::X86 => "x86",
        }
    }

    /// The architecture of the running machine, spelled the way `platform` spells it.
    pub fn host(platform: Platform) -> Result<Self> {
        let arch = match (std::env::consts::ARCH, platform) {
            ("x86_64", Platform::Windows) => Architecture::Amd64,
            ("x86_64", _) => Architecture::X86_64,
            ("aarch64", Platform::Darwin) => Architecture::Arm64,
            ("aarch64", _) => Architecture::Aarch64,
            ("x86", Platform::Windows) => Architecture::X86,
            (other, _) => {
                return Err(Error::Config(format!(
                    "unsupported host architecture {other}"
                )))
            }
        };
        Ok(arch)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Architecture::X86_64),
            "aarch64" => Ok(Architecture::Aarch64),
            "arm64" => Ok(Architecture::Arm64),
            "amd64" => Ok(Architecture::Amd64),
            "x86" => Ok(Architecture::X86),
            other => Err(format!("unknown architecture `{other}`")),
        }
    }
}

/// Operating system family a tree targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
    #[serde(rename = "win32")]
    Windows,
}

impl Platform {
    pub fn host() -> Result<Self> {
        match std::env::consts::OS {
            "linux" => Ok(Platform::Linux),
            "macos" => Ok(Platform::Darwin),
            "windows" => Ok(Platform::Windows),
            other => Err(Error::Config(format!("unsupported host platform {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
            Platform::Windows => "win32",
        }
    }

    /// Architectures a tree can be built for on this platform.
    pub fn architectures(&self) -> &'static [Architecture] {
        match self {
            Platform::Linux => &[Architecture::X86_64, Architecture::Aarch64],
            Platform::Darwin => &[Architecture::X86_64, Architecture::Arm64],
            Platform::Windows => &[Architecture::Amd64, Architecture::X86],
        }
    }

    pub fn supports(&self, arch: Architecture) -> bool {
        self.architectures().contains(&arch)
    }

    fn triplet_suffix(&self) -> &'static str {
        match self {
            Platform::Linux => "linux-gnu",
            Platform::Darwin => "macos",
            Platform::Windows => "win",
        }
    }

    /// `<arch>-<os>` triplet for `arch` on this platform.
    pub fn triplet(&self, arch: Architecture) -> String {
        format!("{}-{}", arch, self.triplet_suffix())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Platform::Linux),
            "darwin" | "macos" => Ok(Platform::Darwin),
            "win32" | "windows" => Ok(Platform::Windows),
            other => Err(format!("unknown platform `{other}`")),
        }
    }
}

/// The machine doing the build and the machine the tree will run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchPair {
    pub host: Architecture,
    pub target: Architecture,
}

impl ArchPair {
    pub fn new(host: Architecture, target: Architecture) -> Self {
        Self { host, target }
    }

    pub fn native(arch: Architecture) -> Self {
        Self::new(arch, arch)
    }

    pub fn is_cross(&self) -> bool {
        self.host != self.target
    }

    /// Directory name of this pair in the toolchain cache.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.host, self.target)
    }
}

impl fmt::Display for ArchPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.host, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triplets_follow_platform_spelling() {
        assert_eq!(Platform::Linux.triplet(Architecture::Aarch64), "aarch64-linux-gnu");
        assert_eq!(Platform::Darwin.triplet(Architecture::Arm64), "arm64-macos");
        assert_eq!(Platform::Windows.triplet(Architecture::Amd64), "amd64-win");
    }

    #[test]
    fn platform_architecture_support() {
        assert!(Platform::Linux.supports(Architecture::X86_64));
        assert!(!Platform::Linux.supports(Architecture::Arm64));
        assert!(!Platform::Darwin.supports(Architecture::Aarch64));
        assert!(Platform::Windows.supports(Architecture::X86));
    }

    #[test]
    fn pair_cache_key_and_cross_detection() {
        let pair = ArchPair::new(Architecture::X86_64, Architecture::Aarch64);
        assert!(pair.is_cross());
        assert_eq!(pair.cache_key(), "x86_64-aarch64");
        assert!(!ArchPair::native(Architecture::X86_64).is_cross());
    }

    #[test]
    fn parse_round_trips_names() {
        for arch in ["x86_64", "aarch64", "arm64", "amd64", "x86"] {
            assert_eq!(arch.parse::<Architecture>().unwrap().as_str(), arch);
        }
        assert!("riscv".parse::<Architecture>().is_err());
        assert_eq!("macos".parse::<Platform>().unwrap(), Platform::Darwin);
    }
}
