//! Source and toolchain archive retrieval.
//!
//! Downloads go through a [`Fetcher`] so tests can serve files locally. Each
//! candidate URL (primary, then mirrors) is retried a bounded number of times
//! before moving on. Archives are verified against a SHA-256 checksum before
//! they are used; a cached archive that still verifies is not downloaded again.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, IoContext, Result};
use crate::process::{Runner, StepCommand};

/// Retrieves a single URL into a local file.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> std::io::Result<()>;
}

/// Fetches with the system `curl`.
#[derive(Debug, Clone)]
pub struct CurlFetcher {
    pub timeout: Duration,
}

impl Default for CurlFetcher {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
        }
    }
}

impl Fetcher for CurlFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> std::io::Result<()> {
        let output = Command::new("curl")
            .args(["--fail", "--location", "--silent", "--show-error"])
            .arg("--max-time")
            .arg(self.timeout.as_secs().to_string())
            .arg("--output")
            .arg(dest)
            .arg(url)
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// How often each URL is attempted and how long to wait between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(10),
        }
    }
}

/// Something to download: a name for messages, candidate URLs, and an optional pin.
#[derive(Debug, Clone)]
pub struct Download<'a> {
    pub name: &'a str,
    pub urls: Vec<String>,
    pub sha256: Option<&'a str>,
}

/// File name component of a URL.
pub fn archive_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

/// Directory name an archive conventionally unpacks to.
pub fn source_dir_name(archive: &str) -> &str {
    for suffix in [".tar.gz", ".tar.xz", ".tar.bz2", ".tgz", ".tar", ".zip"] {
        if let Some(stem) = archive.strip_suffix(suffix) {
            return stem;
        }
    }
    archive
}

/// Hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_path(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).with_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn validate_sha256(expected: &str) -> Result<()> {
    if expected.len() == 64 && expected.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(Error::Manifest(format!(
            "`{expected}` is not a SHA-256 digest"
        )))
    }
}

/// Verify `path` against `expected`.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    validate_sha256(expected)?;
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

/// Fetch `urls` in order into `dest`, retrying each per `policy`.
pub fn download(
    fetcher: &dyn Fetcher,
    policy: RetryPolicy,
    name: &str,
    urls: &[String],
    dest: &Path,
) -> Result<()> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_path(parent)?;
    for url in urls {
        for attempt in 1..=policy.attempts.max(1) {
            debug!(%url, attempt, "fetching {name}");
            // Concurrent builds may fetch the same archive into `parent`.
            let partial = tempfile::Builder::new()
                .prefix(".fetch-")
                .tempfile_in(parent)
                .with_path(parent)?;
            match fetcher.fetch(url, partial.path()) {
                Ok(()) => {
                    partial.persist(dest).map_err(|e| e.error).with_path(dest)?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(%url, attempt, "fetch of {name} failed: {e}");
                    if attempt < policy.attempts {
                        thread::sleep(policy.backoff * attempt);
                    }
                }
            }
        }
    }
    Err(Error::FetchFailed {
        name: name.to_string(),
        urls: urls.to_vec(),
    })
}

/// Ensure a verified copy of `item` exists in `dir` and return its path.
///
/// An existing archive that matches the pin is reused. One that does not is
/// discarded and fetched again; a fresh download that fails verification is
/// deleted and reported as [`Error::ChecksumMismatch`].
pub fn fetch_verified(
    fetcher: &dyn Fetcher,
    policy: RetryPolicy,
    item: &Download,
    dir: &Path,
) -> Result<PathBuf> {
    let first = item
        .urls
        .first()
        .ok_or_else(|| Error::Manifest(format!("{} has no source URL", item.name)))?;
    if let Some(expected) = item.sha256 {
        validate_sha256(expected)?;
    }
    let dest = dir.join(archive_name(first));

    if dest.exists() {
        match item.sha256 {
            Some(expected) => match verify_checksum(&dest, expected) {
                Ok(()) => {
                    debug!(archive = %dest.display(), "using cached {}", item.name);
                    return Ok(dest);
                }
                Err(Error::ChecksumMismatch { .. }) => {
                    warn!(archive = %dest.display(), "cached {} is corrupt, fetching again", item.name);
                    fs::remove_file(&dest).with_path(&dest)?;
                }
                Err(e) => return Err(e),
            },
            None => return Ok(dest),
        }
    }

    info!(name = item.name, "downloading {}", first);
    download(fetcher, policy, item.name, &item.urls, &dest)?;
    match item.sha256 {
        Some(expected) => {
            if let Err(e) = verify_checksum(&dest, expected) {
                let _ = fs::remove_file(&dest);
                return Err(e);
            }
        }
        None => warn!(name = item.name, "no checksum pinned; archive was not verified"),
    }
    Ok(dest)
}

/// Unpack `archive` into `into` with the system `tar`, logging to `log`.
pub fn extract(runner: &dyn Runner, archive: &Path, into: &Path, log: &Path) -> Result<()> {
    fs::create_dir_all(into).with_path(into)?;
    let command = StepCommand::new("tar", into)
        .arg("-xf")
        .arg(archive.display().to_string())
        .arg("-C")
        .arg(into.display().to_string());
    let exit = runner.run(&command, log)?;
    if exit.success() {
        Ok(())
    } else {
        Err(Error::BuildStepFailed {
            dependency: format!("extract {}", archive_name(&archive.display().to_string())),
            exit_code: exit.code,
            log: log.to_path_buf(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves fixed bodies per URL; unknown URLs fail.
    #[derive(Default)]
    pub struct StaticFetcher {
        pub bodies: HashMap<String, Vec<u8>>,
        pub requests: Mutex<Vec<String>>,
        pub count: AtomicUsize,
    }

    impl StaticFetcher {
        pub fn serving(url: &str, body: &[u8]) -> Self {
            let mut fetcher = Self::default();
            fetcher.bodies.insert(url.to_string(), body.to_vec());
            fetcher
        }

        pub fn fetches(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for StaticFetcher {
        fn fetch(&self, url: &str, dest: &Path) -> std::io::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(url.to_string());
            match self.bodies.get(url) {
                Some(body) => fs::write(dest, body),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "404 Not Found",
                )),
            }
        }
    }

    pub fn sha256(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    pub fn no_wait() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        }
    }
}
