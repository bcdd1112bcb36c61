use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::excerpt;

const MAX_EXCERPT_LINES: usize = 40;
const MAX_OUTPUT_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// The runner held the lease and went through the sequence.
    Deploy,
    /// The lease was held by someone else; nothing was touched.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub previous_commit: Option<String>,
    pub outcome: DeployOutcome,
    pub failure_kind: Option<String>,
    pub message: String,
    pub delivery_id: Option<String>,
    pub duration_ms: u64,
    pub restarted: bool,
    pub log_excerpt: Vec<String>,
}

impl DeployRecord {
    #[must_use]
    pub fn is_attempt(&self) -> bool {
        self.kind == RecordKind::Deploy
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome == DeployOutcome::Success
    }

    /// Multi-line rendering used by the `history` and `deploy` commands.
    #[must_use]
    pub fn render(&self) -> String {
        let outcome = match (self.kind, self.outcome) {
            (RecordKind::Busy, _) => "BUSY",
            (RecordKind::Deploy, DeployOutcome::Success) => "SUCCESS",
            (RecordKind::Deploy, DeployOutcome::Failure) => "FAILURE",
        };

        let mut rendered = format!(
            "{}  {outcome:<7}  {}@{}  ({} ms{})",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.branch,
            short_sha(self.commit_sha.as_deref()),
            self.duration_ms,
            if self.restarted { ", restarted" } else { "" },
        );

        let _ = write!(rendered, "\n    {}", self.message);
        if let Some(kind) = &self.failure_kind {
            let _ = write!(rendered, "\n    failure: {kind}");
        }
        if let Some(previous) = &self.previous_commit {
            let _ = write!(rendered, "\n    previous: {previous}");
        }
        for line in &self.log_excerpt {
            let _ = write!(rendered, "\n      | {line}");
        }

        rendered
    }
}

#[must_use]
pub fn short_sha(sha: Option<&str>) -> &str {
    match sha {
        Some(value) => value.get(..12).unwrap_or(value),
        None => "-",
    }
}

/// Per-deploy transcript that ends up in `DeployRecord::log_excerpt`.
#[derive(Debug, Default)]
pub struct StepLog {
    lines: Vec<String>,
}

impl StepLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(&mut self, display: &str) {
        self.lines.push(format!("$ {display}"));
    }

    pub fn output(&mut self, status: &str, stdout: &str, stderr: &str) {
        self.lines.push(format!("  -> {status}"));
        if !stdout.trim().is_empty() {
            self.lines
                .push(format!("  stdout: {}", excerpt::tail(stdout, MAX_OUTPUT_CHARS)));
        }
        if !stderr.trim().is_empty() {
            self.lines
                .push(format!("  stderr: {}", excerpt::tail(stderr, MAX_OUTPUT_CHARS)));
        }
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.lines.push(message.into());
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Keeps the most recent lines; the start of a long transcript is the least useful
    /// part when reading a failure.
    #[must_use]
    pub fn into_excerpt(self) -> Vec<String> {
        if self.lines.len() <= MAX_EXCERPT_LINES {
            return self.lines;
        }

        let skipped = self.lines.len() - (MAX_EXCERPT_LINES - 1);
        let mut excerpt = Vec::with_capacity(MAX_EXCERPT_LINES);
        excerpt.push(format!("... {skipped} earlier lines omitted"));
        excerpt.extend(self.lines.into_iter().skip(skipped));
        excerpt
    }
}

/// Append-only JSON Lines file holding one `DeployRecord` per line.
#[derive(Debug, Clone)]
pub struct DeployLog {
    inner: Arc<DeployLogInner>,
}

#[derive(Debug)]
struct DeployLogInner {
    path: PathBuf,
    last: Mutex<Option<DeployRecord>>,
}

impl DeployLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(DeployLogInner {
                path: path.into(),
                last: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Appends `record` as a single line.
    ///
    /// # Errors
    /// Returns an error if the log directory cannot be created or the write fails.
    pub fn append(&self, record: &DeployRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("failed to serialize deploy record")?;
        line.push('\n');

        let mut last = self.inner.last.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(parent_dir) = self.inner.path.parent() {
            if !parent_dir.as_os_str().is_empty() {
                fs::create_dir_all(parent_dir).with_context(|| {
                    format!("failed to create deploy log dir {}", parent_dir.display())
                })?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .with_context(|| format!("failed to open deploy log {}", self.inner.path.display()))?;
        file.write_all(line.as_bytes())
            .context("failed to append deploy record")?;
        file.flush().context("failed to flush deploy log")?;

        *last = Some(record.clone());
        Ok(())
    }

    /// Most recent record. The file is read only until a record is known; after that the
    /// value kept by this handle (and updated by `append`) is returned. Blocks on file IO.
    ///
    /// # Errors
    /// Returns an error if the log file exists but cannot be read.
    pub fn last(&self) -> Result<Option<DeployRecord>> {
        let mut last = self.inner.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.is_none() {
            *last = self.read_recent(1)?.pop();
        }

        Ok(last.clone())
    }

    /// Up to `limit` records, oldest first. Lines that do not parse are skipped.
    ///
    /// # Errors
    /// Returns an error if the log file exists but cannot be read.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<DeployRecord>> {
        let file = match fs::File::open(&self.inner.path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to open deploy log {}", self.inner.path.display())
                })
            }
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("failed to read deploy log")?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<DeployRecord>(&line) {
                records.push(record);
            }
        }

        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}
