use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::error::DeployError;
use super::lease::{DeployLease, LeaseAttempt, LeaseInfo};
use super::record::{short_sha, DeployLog, DeployOutcome, DeployRecord, RecordKind, StepLog};
use super::{DependencySync, DeployRequest, HealthProbe, ServiceSupervisor, SourceControl};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub health_timeout: Duration,
    pub health_poll_interval: Duration,
    pub restart_pause: Duration,
    pub deploy_timeout: Duration,
    pub dependency_manifests: Vec<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(10),
            health_poll_interval: Duration::from_millis(500),
            restart_pause: Duration::from_secs(2),
            deploy_timeout: Duration::from_secs(300),
            dependency_manifests: vec!["requirements.txt".to_string()],
        }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceControl>,
    pub dependencies: Option<Arc<dyn DependencySync>>,
    pub supervisor: Arc<dyn ServiceSupervisor>,
    pub health: Arc<dyn HealthProbe>,
}

#[derive(Debug, Default)]
struct Progress {
    step: &'static str,
    previous_commit: Option<String>,
    commit_sha: Option<String>,
    restarted: bool,
}

/// Executes one deploy sequence at a time: lease, source sync, dependency sync,
/// restart, health check, record.
///
/// The whole sequence runs under `deploy_timeout`; when it expires the step in flight is
/// cancelled and its child processes are killed. A failed health check is not rolled
/// back. The new tree stays checked out and an operator has to deploy the previous
/// commit explicitly.
pub struct DeployRunner {
    collaborators: Collaborators,
    lease: DeployLease,
    log: DeployLog,
    settings: RunnerSettings,
}

impl DeployRunner {
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        lease: DeployLease,
        log: DeployLog,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            collaborators,
            lease,
            log,
            settings,
        }
    }

    #[must_use]
    pub fn log(&self) -> &DeployLog {
        &self.log
    }

    #[must_use]
    pub fn lease(&self) -> &DeployLease {
        &self.lease
    }

    /// Runs the full sequence for `request`. Every failure is folded into the returned
    /// record, which has already been appended to the deploy log.
    pub async fn run_deploy(&self, request: &DeployRequest) -> DeployRecord {
        let started = Instant::now();
        let commit = short_sha(request.commit_sha.as_deref()).to_string();
        info!(branch = %request.branch, %commit, delivery = ?request.delivery_id, "deploy starting");

        let guard = match self
            .lease
            .try_acquire(&request.branch, request.commit_sha.as_deref())
        {
            Ok(LeaseAttempt::Acquired(guard)) => guard,
            Ok(LeaseAttempt::Held(holder)) => {
                warn!(
                    branch = %request.branch,
                    %commit,
                    holder_branch = %holder.branch,
                    expires_at = %holder.expires_at,
                    "deploy busy; lease held by another deploy"
                );
                let record = busy_record(request, &holder, started);
                self.persist(&record);
                return record;
            }
            Err(lease_error) => {
                let record = deploy_record(
                    request,
                    Progress::default(),
                    Err(DeployError::Lease(format!("{lease_error:#}"))),
                    StepLog::new(),
                    started,
                );
                error!(branch = %request.branch, error = %record.message, "deploy lease error");
                self.persist(&record);
                return record;
            }
        };

        let mut steps = StepLog::new();
        let mut progress = Progress::default();
        let deadline = started + self.settings.deploy_timeout;
        let sequence = self.execute(request, &mut steps, &mut progress, deadline);
        let bounded = tokio::time::timeout_at(deadline, sequence).await;
        let result = bounded.unwrap_or_else(|_| {
            steps.note(format!("deadline reached during {}; step cancelled", progress.step));
            Err(DeployError::Timeout {
                limit_seconds: self.settings.deploy_timeout.as_secs(),
                step: progress.step,
            })
        });

        let record = deploy_record(request, progress, result, steps, started);
        self.persist(&record);

        if let Err(release_error) = guard.release() {
            warn!(error = %format!("{release_error:#}"), "failed to release deploy lease");
        }

        if record.succeeded() {
            info!(
                branch = %record.branch,
                commit = %short_sha(record.commit_sha.as_deref()),
                restarted = record.restarted,
                duration_ms = record.duration_ms,
                "deploy succeeded"
            );
        } else {
            error!(
                branch = %record.branch,
                commit = %short_sha(record.commit_sha.as_deref()),
                failure = ?record.failure_kind,
                message = %record.message,
                "deploy failed"
            );
        }

        record
    }

    async fn execute(
        &self,
        request: &DeployRequest,
        steps: &mut StepLog,
        progress: &mut Progress,
        deadline: Instant,
    ) -> Result<String, DeployError> {
        let source = &self.collaborators.source;

        progress.step = "source sync";
        progress.previous_commit = source
            .current_commit(steps)
            .await
            .map_err(|error| DeployError::source_sync(&error))?;

        let synced = source
            .sync_to(&request.branch, request.commit_sha.as_deref(), steps)
            .await
            .map_err(|error| DeployError::source_sync(&error))?;
        let target = synced.commit;
        progress.commit_sha = Some(target.clone());
        let unchanged = progress.previous_commit.as_deref() == Some(target.as_str())
            && !synced.discarded_changes;

        progress.step = "dependency sync";
        self.sync_dependencies(progress.previous_commit.as_deref(), &target, steps)
            .await?;

        progress.step = "service restart";
        if unchanged && self.collaborators.health.check().await {
            steps.note(format!(
                "tree already at {}; service healthy, restart skipped",
                short_sha(Some(&target))
            ));
            return Ok(format!(
                "{} already at {}; service healthy, no restart needed",
                request.branch,
                short_sha(Some(&target))
            ));
        }

        self.restart(steps).await?;
        progress.restarted = true;

        progress.step = "health check";
        let remaining = deadline.saturating_duration_since(Instant::now());
        let health_window = self.settings.health_timeout.min(remaining);
        if !self.wait_healthy(health_window, steps).await {
            let previous = progress
                .previous_commit
                .as_deref()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            return Err(DeployError::ProcessRestart(format!(
                "service did not report healthy within {}s; no automatic rollback, previous commit was {previous}",
                health_window.as_secs()
            )));
        }

        Ok(format!(
            "deployed {} at {}",
            request.branch,
            short_sha(Some(&target))
        ))
    }

    async fn sync_dependencies(
        &self,
        previous: Option<&str>,
        target: &str,
        steps: &mut StepLog,
    ) -> Result<(), DeployError> {
        let Some(dependencies) = &self.collaborators.dependencies else {
            return Ok(());
        };

        let needed = match previous {
            None => {
                steps.note("no previous commit recorded; syncing dependencies");
                true
            }
            Some(previous) if previous == target => false,
            Some(previous) => {
                match self
                    .collaborators
                    .source
                    .changed_files(previous, target, steps)
                    .await
                {
                    Ok(files) => files.iter().any(|file| {
                        self.settings
                            .dependency_manifests
                            .iter()
                            .any(|manifest| manifest == file)
                    }),
                    Err(diff_error) => {
                        steps.note(format!(
                            "could not diff manifests ({diff_error:#}); syncing dependencies"
                        ));
                        true
                    }
                }
            }
        };

        if !needed {
            steps.note("dependency manifests unchanged; sync skipped");
            return Ok(());
        }

        dependencies
            .sync(steps)
            .await
            .map_err(|error| DeployError::dependency_sync(&error))
    }

    async fn restart(&self, steps: &mut StepLog) -> Result<(), DeployError> {
        let supervisor = &self.collaborators.supervisor;

        supervisor
            .stop(steps)
            .await
            .map_err(|error| DeployError::process_restart(&error))?;

        steps.note(format!(
            "pause {} ms before start",
            self.settings.restart_pause.as_millis()
        ));
        tokio::time::sleep(self.settings.restart_pause).await;

        supervisor
            .start(steps)
            .await
            .map_err(|error| DeployError::process_restart(&error))
    }

    async fn wait_healthy(&self, window: Duration, steps: &mut StepLog) -> bool {
        let probe = &self.collaborators.health;
        steps.note(format!(
            "waiting up to {}s for {}",
            window.as_secs(),
            probe.describe()
        ));

        let deadline = Instant::now() + window;
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            if probe.check().await {
                steps.note(format!("healthy after {attempts} probe(s)"));
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                steps.note(format!("still unhealthy after {attempts} probe(s)"));
                return false;
            }

            let pause = self
                .settings
                .health_poll_interval
                .min(deadline.saturating_duration_since(now));
            tokio::time::sleep(pause).await;
        }
    }

    fn persist(&self, record: &DeployRecord) {
        if let Err(append_error) = self.log.append(record) {
            error!(
                error = %format!("{append_error:#}"),
                path = %self.log.path().display(),
                "failed to append deploy record"
            );
        }
    }
}

fn deploy_record(
    request: &DeployRequest,
    progress: Progress,
    result: Result<String, DeployError>,
    steps: StepLog,
    started: Instant,
) -> DeployRecord {
    let (outcome, failure_kind, message) = match result {
        Ok(message) => (DeployOutcome::Success, None, message),
        Err(failure) => (
            DeployOutcome::Failure,
            Some(failure.kind().to_string()),
            failure.to_string(),
        ),
    };

    DeployRecord {
        timestamp: Utc::now(),
        kind: RecordKind::Deploy,
        branch: request.branch.clone(),
        commit_sha: progress.commit_sha.or_else(|| request.commit_sha.clone()),
        previous_commit: progress.previous_commit,
        outcome,
        failure_kind,
        message,
        delivery_id: request.delivery_id.clone(),
        duration_ms: elapsed_millis(started),
        restarted: progress.restarted,
        log_excerpt: steps.into_excerpt(),
    }
}

fn busy_record(request: &DeployRequest, holder: &LeaseInfo, started: Instant) -> DeployRecord {
    DeployRecord {
        timestamp: Utc::now(),
        kind: RecordKind::Busy,
        branch: request.branch.clone(),
        commit_sha: request.commit_sha.clone(),
        previous_commit: None,
        outcome: DeployOutcome::Failure,
        failure_kind: Some("busy".to_string()),
        message: format!(
            "another deploy is in progress ({} at {}, lease expires {}); retry later",
            holder.branch,
            short_sha(holder.commit_sha.as_deref()),
            holder.expires_at.to_rfc3339()
        ),
        delivery_id: request.delivery_id.clone(),
        duration_ms: elapsed_millis(started),
        restarted: false,
        log_excerpt: Vec::new(),
    }
}

fn elapsed_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
