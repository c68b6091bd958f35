//! Error taxonomy.
//!
//! Every failure the build pipeline and the relocation engine can report is a
//! variant of [`Error`]. Build-step and toolchain errors carry the log file that
//! holds the captured process output; relocation overflow carries the offending
//! file together with the required and available space.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::arch::ArchPair;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no prebuilt toolchain or build recipe for {pair}")]
    ToolchainUnavailable { pair: ArchPair },

    #[error("toolchain build failed during `{stage}` (log: {})", log.display())]
    ToolchainBuildFailed { stage: String, log: PathBuf },

    #[error("checksum mismatch for {}: expected {expected}, found {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("cross build of {version} for {pair} needs a native build at {}", native.display())]
    NativeBuildRequired {
        version: String,
        pair: ArchPair,
        native: PathBuf,
    },

    #[error("build step `{dependency}` failed with exit code {} (log: {})", exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()), log.display())]
    BuildStepFailed {
        dependency: String,
        exit_code: Option<i32>,
        log: PathBuf,
    },

    #[error("unsupported binary format in {}: {reason}", path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("search path for {} needs {required} bytes but the existing slot holds {available}", path.display())]
    RelocationOverflow {
        path: PathBuf,
        required: usize,
        available: usize,
    },

    #[error("failed to fetch {name}; tried {}", urls.join(", "))]
    FetchFailed { name: String, urls: Vec<String> },

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("expected build output is missing: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Only unsupported formats are tolerated; everything else aborts the tree.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::UnsupportedFormat { .. })
    }

    /// The log holding the captured output of the failed step, if any.
    pub fn log_path(&self) -> Option<&Path> {
        match self {
            Error::ToolchainBuildFailed { log, .. } | Error::BuildStepFailed { log, .. } => {
                Some(log)
            }
            _ => None,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Attach the path that an I/O operation was working on.
pub(crate) trait IoContext<T> {
    fn with_path(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| Error::io(path.as_ref(), source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_is_the_only_non_fatal_error() {
        let skip = Error::UnsupportedFormat {
            path: PathBuf::from("/t/fixture.bin"),
            reason: "truncated header".into(),
        };
        let overflow = Error::RelocationOverflow {
            path: PathBuf::from("/t/lib/libx.so"),
            required: 20,
            available: 8,
        };
        assert!(!skip.is_fatal());
        assert!(overflow.is_fatal());
    }

    #[test]
    fn overflow_message_names_file_and_sizes() {
        let err = Error::RelocationOverflow {
            path: PathBuf::from("/t/lib/libx.so"),
            required: 20,
            available: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains("/t/lib/libx.so"));
        assert!(msg.contains("20"));
        assert!(msg.contains('8'));
    }

    #[test]
    fn build_step_failure_exposes_log() {
        let err = Error::BuildStepFailed {
            dependency: "zlib".into(),
            exit_code: Some(2),
            log: PathBuf::from("/logs/zlib.log"),
        };
        assert_eq!(err.log_path(), Some(Path::new("/logs/zlib.log")));
        assert!(err.to_string().contains("exit code 2"));
    }
}
