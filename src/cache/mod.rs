//! Matcher store
//!
//! Persists one record per failure fingerprint under the matchers directory, so a fix
//! that worked once can be recognised and audited later. Records are written only after
//! a remediation succeeded.
//!
//! # Error Handling
//!
//! Saving is best-effort from the pipeline's point of view: a [`CacheError`] is reported
//! as a warning and never changes the run's exit status.

use crate::diagnosis::{Diagnosis, RemedialAction};
use crate::failure::FailureLog;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Bytes of the SHA-256 digest kept in a record's filename.
pub const FINGERPRINT_BYTES: usize = 4;
const MAX_FINGERPRINT_BYTES: usize = 32;
const RECORD_PREFIX: &str = "fix_";
const LOCK_FILE: &str = ".lock";
const CACHE_LOCK_TIMEOUT_SECS: u64 = 5;
const CACHE_LOCK_RETRY_MS: u64 = 50;

/// Hex-encoded prefix of the SHA-256 of the log's raw bytes.
pub fn fingerprint(log: &FailureLog, bytes: usize) -> String {
    let digest = Sha256::digest(log.as_bytes());
    let bytes = bytes.clamp(1, MAX_FINGERPRINT_BYTES);
    hex::encode(&digest[..bytes])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub name: String,
    pub manager: String,
}

/// On-disk form of a diagnosis that fixed a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub matcher: String,
    pub test_ok: Vec<String>,
    pub test_fail: Vec<String>,
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
    #[serde(default)]
    pub install_commands: Vec<String>,
}

impl From<&Diagnosis> for CacheRecord {
    fn from(diagnosis: &Diagnosis) -> Self {
        let mut packages = Vec::new();
        let mut install_commands = Vec::new();
        for remedy in &diagnosis.remedies {
            match remedy {
                RemedialAction::Package { manager, name } => packages.push(PackageEntry {
                    name: name.clone(),
                    manager: manager.clone(),
                }),
                RemedialAction::Shell { command } => install_commands.push(command.clone()),
            }
        }
        Self {
            matcher: diagnosis.matcher.clone(),
            test_ok: diagnosis.positive_examples.clone(),
            test_fail: diagnosis.negative_examples.clone(),
            packages,
            install_commands,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to create matchers directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to lock matchers directory {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for matchers lock ({}s)", .0)]
    LockTimeout(u64),
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid matcher record {}: {source}", .path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Directory of `fix_<fingerprint>.json` records.
#[derive(Debug, Clone)]
pub struct MatcherStore {
    dir: PathBuf,
    fingerprint_bytes: usize,
}

struct StoreLock {
    file: fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl MatcherStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fingerprint_bytes: FINGERPRINT_BYTES,
        }
    }

    /// Longer prefixes make filename collisions rarer. Clamped to `1..=32`.
    pub fn with_fingerprint_bytes(mut self, bytes: usize) -> Self {
        self.fingerprint_bytes = bytes.clamp(1, MAX_FINGERPRINT_BYTES);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, log: &FailureLog) -> PathBuf {
        self.dir.join(format!(
            "{}{}.json",
            RECORD_PREFIX,
            fingerprint(log, self.fingerprint_bytes)
        ))
    }

    /// Write the record for `log`, replacing any earlier one with the same fingerprint.
    pub fn save(&self, log: &FailureLog, diagnosis: &Diagnosis) -> Result<PathBuf, CacheError> {
        fs::create_dir_all(&self.dir).map_err(|source| CacheError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.record_path(log);
        let record = CacheRecord::from(diagnosis);
        let content = serde_json::to_string_pretty(&record).map_err(|e| CacheError::Write {
            path: path.clone(),
            source: io::Error::new(ErrorKind::InvalidData, e),
        })?;

        let _lock = self.lock()?;
        write_atomic(&path, &content).map_err(|source| CacheError::Write {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "Matcher saved");
        Ok(path)
    }

    /// Read a record back.
    pub fn load(&self, path: &Path) -> Result<CacheRecord, CacheError> {
        let content = fs::read_to_string(path).map_err(|source| CacheError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| CacheError::Format {
            path: path.to_path_buf(),
            source,
        })
    }

    fn lock(&self) -> Result<StoreLock, CacheError> {
        let lock_path = self.dir.join(LOCK_FILE);
        let lock_error = |source| CacheError::Lock {
            path: lock_path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(lock_error)?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(lock_error(err));
                    }
                    if start.elapsed() >= Duration::from_secs(CACHE_LOCK_TIMEOUT_SECS) {
                        return Err(CacheError::LockTimeout(CACHE_LOCK_TIMEOUT_SECS));
                    }
                    debug!("matchers directory locked by another process; waiting");
                    std::thread::sleep(Duration::from_millis(CACHE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }
}

/// Write to a sibling temp file, then rename over `path`.
fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
