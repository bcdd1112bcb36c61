use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

const ACQUIRE_ATTEMPTS: usize = 3;

/// Contents of the lease file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub holder: String,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseInfo {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// File-backed mutual exclusion with an expiry, so a deploy that died without releasing
/// does not block every later deploy.
#[derive(Debug, Clone)]
pub struct DeployLease {
    path: PathBuf,
    duration: Duration,
}

#[derive(Debug)]
pub enum LeaseAttempt {
    Acquired(LeaseGuard),
    Held(LeaseInfo),
}

impl DeployLease {
    pub fn new(path: impl Into<PathBuf>, duration: Duration) -> Self {
        Self {
            path: path.into(),
            duration,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the lease unless a live holder already has it. Expired or unreadable lease
    /// files are replaced.
    ///
    /// # Errors
    /// Returns an error if the lease directory or file cannot be written.
    pub fn try_acquire(&self, branch: &str, commit_sha: Option<&str>) -> Result<LeaseAttempt> {
        if let Some(parent_dir) = self.path.parent() {
            if !parent_dir.as_os_str().is_empty() {
                fs::create_dir_all(parent_dir).with_context(|| {
                    format!("failed to create lease dir {}", parent_dir.display())
                })?;
            }
        }

        let now = Utc::now();
        let lease_duration =
            chrono::Duration::from_std(self.duration).context("lease duration out of range")?;
        let info = LeaseInfo {
            holder: Uuid::new_v4().to_string(),
            branch: branch.to_string(),
            commit_sha: commit_sha.map(ToString::to_string),
            acquired_at: now,
            expires_at: now + lease_duration,
        };

        for _ in 0..ACQUIRE_ATTEMPTS {
            if self.create_exclusive(&info)? {
                debug!(holder = %info.holder, path = %self.path.display(), "deploy lease acquired");
                return Ok(LeaseAttempt::Acquired(LeaseGuard {
                    path: self.path.clone(),
                    holder: info.holder.clone(),
                    released: false,
                }));
            }

            match self.current() {
                Ok(Some(existing)) if !existing.is_expired(Utc::now()) => {
                    return Ok(LeaseAttempt::Held(existing));
                }
                Ok(Some(existing)) => {
                    warn!(
                        holder = %existing.holder,
                        branch = %existing.branch,
                        expired_at = %existing.expires_at,
                        "taking over expired deploy lease"
                    );
                    self.remove_if_holder(Some(&existing.holder))?;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "replacing unreadable deploy lease");
                    self.remove_if_holder(None)?;
                }
            }
        }

        bail!(
            "could not acquire deploy lease at {} after {ACQUIRE_ATTEMPTS} attempts",
            self.path.display()
        )
    }

    /// Current lease contents, if a lease file exists.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn current(&self) -> Result<Option<LeaseInfo>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read lease {}", self.path.display()))
            }
        };

        let info = serde_json::from_slice::<LeaseInfo>(&raw)
            .with_context(|| format!("lease file is malformed: {}", self.path.display()))?;
        Ok(Some(info))
    }

    // The lease file appears with its full contents or not at all: it is written to a
    // private temp file first and then hard-linked into place, which fails if the target
    // already exists.
    fn create_exclusive(&self, info: &LeaseInfo) -> Result<bool> {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "deploy.lease".to_string());
        let temp_path = self
            .path
            .with_file_name(format!(".{file_name}.{}", info.holder));

        let contents = serde_json::to_vec(info).context("failed to serialize lease")?;
        {
            let mut temp_file = fs::File::create(&temp_path)
                .with_context(|| format!("failed to write lease {}", temp_path.display()))?;
            temp_file.write_all(&contents)?;
            temp_file.sync_all()?;
        }

        let linked = fs::hard_link(&temp_path, &self.path);
        let _ = fs::remove_file(&temp_path);

        match linked {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(error) => Err(error)
                .with_context(|| format!("failed to create lease {}", self.path.display())),
        }
    }

    fn remove_if_holder(&self, expected_holder: Option<&str>) -> Result<()> {
        if let Some(expected) = expected_holder {
            if let Ok(Some(current)) = self.current() {
                if current.holder != expected {
                    return Ok(());
                }
            }
        }

        remove_lease_file(&self.path)
    }
}

fn remove_lease_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("failed to remove lease {}", path.display()))
        }
    }
}

/// Proof of holding the lease. Dropping it releases the lease.
#[derive(Debug)]
pub struct LeaseGuard {
    path: PathBuf,
    holder: String,
    released: bool,
}

impl LeaseGuard {
    #[cfg(test)]
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Removes the lease file if this guard still owns it.
    ///
    /// # Errors
    /// Returns an error if the lease file cannot be removed.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> Result<()> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        match serde_json::from_slice::<LeaseInfo>(&raw) {
            Ok(info) if info.holder == self.holder => remove_lease_file(&self.path),
            Ok(info) => {
                warn!(
                    holder = %self.holder,
                    current_holder = %info.holder,
                    "deploy lease was taken over before release"
                );
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Err(error) = self.remove_if_owned() {
            warn!(error = %format!("{error:#}"), "failed to release deploy lease");
        }
    }
}
