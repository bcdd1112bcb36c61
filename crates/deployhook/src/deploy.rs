use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::DeployHookConfig;
use crate::system::PrivilegeWrapper;

pub mod command;
pub mod dependencies;
pub mod error;
pub mod git;
pub mod health;
pub mod lease;
pub mod queue;
pub mod record;
pub mod runner;
pub mod systemd;

#[cfg(test)]
pub(crate) mod fakes;

pub use error::DeployError;
pub use queue::{DeployQueue, QueueSnapshot, Submission};
pub use record::{DeployLog, DeployOutcome, DeployRecord, RecordKind, StepLog};
pub use runner::{Collaborators, DeployRunner, RunnerSettings};

/// Lease lifetime on top of the deploy timeout. The runner cancels the sequence at the
/// timeout, so only lease handling and the record append run past it.
const LEASE_GRACE: Duration = Duration::from_secs(60);

/// Fetch plus hard reset against the source-control remote.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Commit the working tree currently points at, if it has one.
    async fn current_commit(&self, log: &mut StepLog) -> Result<Option<String>>;

    /// Makes the working tree match `commit_sha` on `branch` exactly (or the remote head
    /// of `branch` when no commit is given).
    async fn sync_to(
        &self,
        branch: &str,
        commit_sha: Option<&str>,
        log: &mut StepLog,
    ) -> Result<SyncedTree>;

    async fn changed_files(&self, from: &str, to: &str, log: &mut StepLog) -> Result<Vec<String>>;
}

/// Where `SourceControl::sync_to` left the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedTree {
    /// Full commit id now checked out.
    pub commit: String,
    /// Tracked files had local edits that the reset threw away.
    pub discarded_changes: bool,
}

#[async_trait]
pub trait DependencySync: Send + Sync {
    async fn sync(&self, log: &mut StepLog) -> Result<()>;
}

/// The long-running service as seen by the deployer: stop, start, and is it up.
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn stop(&self, log: &mut StepLog) -> Result<()>;
    async fn start(&self, log: &mut StepLog) -> Result<()>;
    async fn is_active(&self, log: &mut StepLog) -> Result<bool>;
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn describe(&self) -> String;

    /// One probe; `true` means healthy right now.
    async fn check(&self) -> bool;
}

/// A gated-in request to deploy `branch`, optionally pinned to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployRequest {
    pub branch: String,
    pub commit_sha: Option<String>,
    pub delivery_id: Option<String>,
}

impl DeployRequest {
    pub fn new(branch: impl Into<String>, commit_sha: Option<String>) -> Self {
        Self {
            branch: branch.into(),
            commit_sha,
            delivery_id: None,
        }
    }

    #[must_use]
    pub fn with_delivery_id(mut self, delivery_id: Option<String>) -> Self {
        self.delivery_id = delivery_id;
        self
    }

    /// Same branch and commit; delivery ids differ between retries of one push.
    #[must_use]
    pub fn targets_same_state(&self, other: &Self) -> bool {
        self.branch == other.branch && self.commit_sha == other.commit_sha
    }
}

/// Wires the git, systemd, health and dependency collaborators described by `config`.
///
/// # Errors
/// Returns an error if a required setting is missing or a collaborator rejects its
/// configuration.
pub fn build_runner(config: &DeployHookConfig) -> Result<DeployRunner> {
    let working_tree = config
        .working_tree()
        .context("working_tree is not configured")?;
    let service_name = config
        .service_name()
        .context("service_name is not configured")?;
    let command_timeout = config.command_timeout();

    let source: Arc<dyn SourceControl> = Arc::new(git::GitWorkspace::new(
        &working_tree,
        &config.remote(),
        command_timeout,
    )?);

    let supervisor: Arc<dyn ServiceSupervisor> = Arc::new(systemd::SystemdSupervisor::new(
        &service_name,
        PrivilegeWrapper::new(config.use_sudo()),
        command_timeout,
    )?);

    let health: Arc<dyn HealthProbe> = match config.health_check_url() {
        Some(url) => Arc::new(health::HttpHealthProbe::new(&url)?),
        None => Arc::new(health::SupervisorHealthProbe::new(Arc::clone(&supervisor))),
    };

    let dependencies = config
        .dependency_command()
        .map(|command_line| {
            dependencies::CommandDependencySync::from_command_line(
                &command_line,
                &working_tree,
                command_timeout,
            )
        })
        .transpose()?
        .map(|sync| Arc::new(sync) as Arc<dyn DependencySync>);

    let settings = RunnerSettings {
        health_timeout: config.health_timeout(),
        restart_pause: config.restart_pause(),
        deploy_timeout: config.deploy_timeout(),
        dependency_manifests: config.dependency_manifests(),
        ..RunnerSettings::default()
    };

    Ok(DeployRunner::new(
        Collaborators {
            source,
            dependencies,
            supervisor,
            health,
        },
        lease::DeployLease::new(config.lease_path(), config.deploy_timeout() + LEASE_GRACE),
        DeployLog::new(config.deploy_log_path()),
        settings,
    ))
}
