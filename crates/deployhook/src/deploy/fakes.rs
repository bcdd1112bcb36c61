use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::lease::DeployLease;
use super::record::{DeployLog, StepLog};
use super::runner::{Collaborators, DeployRunner, RunnerSettings};
use super::{DependencySync, HealthProbe, ServiceSupervisor, SourceControl, SyncedTree};

pub(crate) const REMOTE_HEAD: &str = "feedfacefeedfacefeedfacefeedfacefeedface";

/// Counts how many deploy sequences are inside a fake step at once.
#[derive(Debug, Default)]
pub(crate) struct Overlap {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Overlap {
    fn enter(&self) -> Inside<'_> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        Inside(self)
    }

    pub(crate) fn max(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Leaves the step on drop, including when a timeout cancels it mid-sleep.
pub(crate) struct Inside<'a>(&'a Overlap);

impl Drop for Inside<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeSource {
    pub(crate) head: Mutex<Option<String>>,
    pub(crate) fail_sync: AtomicBool,
    /// Tracked files edited in place; cleared by the next sync.
    pub(crate) dirty: AtomicBool,
    pub(crate) changed_files: Mutex<Vec<String>>,
    pub(crate) sync_delay: Mutex<Duration>,
    pub(crate) sync_calls: AtomicUsize,
    pub(crate) overlap: Arc<Overlap>,
}

impl FakeSource {
    pub(crate) fn at(commit: &str) -> Self {
        let source = Self::default();
        *source.head.lock().unwrap_or_else(PoisonError::into_inner) = Some(commit.to_string());
        source
    }

    pub(crate) fn head(&self) -> Option<String> {
        self.head
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn current_commit(&self, log: &mut StepLog) -> Result<Option<String>> {
        log.command("git rev-parse --verify HEAD");
        Ok(self.head())
    }

    async fn sync_to(
        &self,
        branch: &str,
        commit_sha: Option<&str>,
        log: &mut StepLog,
    ) -> Result<SyncedTree> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .sync_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        {
            let _inside = self.overlap.enter();
            tokio::time::sleep(delay).await;
        }

        log.command(&format!("git fetch --prune origin {branch}"));
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(anyhow!("fatal: unable to access remote: network is unreachable"));
        }

        let target = commit_sha.unwrap_or(REMOTE_HEAD).to_string();
        *self.head.lock().unwrap_or_else(PoisonError::into_inner) = Some(target.clone());
        Ok(SyncedTree {
            commit: target,
            discarded_changes: self.dirty.swap(false, Ordering::SeqCst),
        })
    }

    async fn changed_files(
        &self,
        _from: &str,
        _to: &str,
        log: &mut StepLog,
    ) -> Result<Vec<String>> {
        log.command("git diff --name-only");
        Ok(self
            .changed_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[derive(Debug)]
pub(crate) struct FakeSupervisor {
    pub(crate) active: AtomicBool,
    pub(crate) fail_start: AtomicBool,
    pub(crate) stop_delay: Mutex<Duration>,
    pub(crate) stops: AtomicUsize,
    pub(crate) starts: AtomicUsize,
    pub(crate) overlap: Overlap,
}

impl FakeSupervisor {
    pub(crate) fn running() -> Self {
        Self {
            active: AtomicBool::new(true),
            fail_start: AtomicBool::new(false),
            stop_delay: Mutex::new(Duration::ZERO),
            stops: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            overlap: Overlap::default(),
        }
    }

    pub(crate) fn restarts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceSupervisor for FakeSupervisor {
    async fn stop(&self, log: &mut StepLog) -> Result<()> {
        log.command("systemctl stop chatbot");
        self.stops.fetch_add(1, Ordering::SeqCst);
        let delay = *self.stop_delay.lock().unwrap_or_else(PoisonError::into_inner);
        let _inside = self.overlap.enter();
        tokio::time::sleep(delay).await;
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, log: &mut StepLog) -> Result<()> {
        log.command("systemctl start chatbot");
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("Job for chatbot.service failed"));
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_active(&self, _log: &mut StepLog) -> Result<bool> {
        Ok(self.active.load(Ordering::SeqCst))
    }
}

/// Healthy whenever the fake supervisor has the unit running, unless forced down.
#[derive(Debug)]
pub(crate) struct FakeHealth {
    pub(crate) supervisor: Arc<FakeSupervisor>,
    pub(crate) force_unhealthy: AtomicBool,
    pub(crate) checks: AtomicUsize,
}

#[async_trait]
impl HealthProbe for FakeHealth {
    fn describe(&self) -> String {
        "fake health".to_string()
    }

    async fn check(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        !self.force_unhealthy.load(Ordering::SeqCst) && self.supervisor.active.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeDependencies {
    pub(crate) runs: AtomicUsize,
    pub(crate) fail: AtomicBool,
}

#[async_trait]
impl DependencySync for FakeDependencies {
    async fn sync(&self, log: &mut StepLog) -> Result<()> {
        log.command("pip install -r requirements.txt");
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("No matching distribution found"));
        }
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) source: Arc<FakeSource>,
    pub(crate) supervisor: Arc<FakeSupervisor>,
    pub(crate) health: Arc<FakeHealth>,
    pub(crate) dependencies: Arc<FakeDependencies>,
    pub(crate) log: DeployLog,
    pub(crate) lease: DeployLease,
}

impl Harness {
    /// Service running and healthy, tree at `commit`, lease and log under `dir`.
    pub(crate) fn new(dir: &Path, commit: &str) -> Self {
        let supervisor = Arc::new(FakeSupervisor::running());
        Self {
            source: Arc::new(FakeSource::at(commit)),
            health: Arc::new(FakeHealth {
                supervisor: Arc::clone(&supervisor),
                force_unhealthy: AtomicBool::new(false),
                checks: AtomicUsize::new(0),
            }),
            supervisor,
            dependencies: Arc::new(FakeDependencies::default()),
            log: DeployLog::new(dir.join("deploys.jsonl")),
            lease: DeployLease::new(dir.join("deploy.lease"), Duration::from_secs(60)),
        }
    }

    pub(crate) fn settings() -> RunnerSettings {
        RunnerSettings {
            health_timeout: Duration::from_millis(200),
            health_poll_interval: Duration::from_millis(20),
            restart_pause: Duration::ZERO,
            deploy_timeout: Duration::from_secs(5),
            dependency_manifests: vec!["requirements.txt".to_string()],
        }
    }

    pub(crate) fn runner(&self) -> DeployRunner {
        self.runner_with(Self::settings())
    }

    pub(crate) fn runner_with(&self, settings: RunnerSettings) -> DeployRunner {
        DeployRunner::new(
            Collaborators {
                source: Arc::clone(&self.source) as Arc<dyn SourceControl>,
                dependencies: Some(Arc::clone(&self.dependencies) as Arc<dyn DependencySync>),
                supervisor: Arc::clone(&self.supervisor) as Arc<dyn ServiceSupervisor>,
                health: Arc::clone(&self.health) as Arc<dyn HealthProbe>,
            },
            self.lease.clone(),
            self.log.clone(),
            settings,
        )
    }
}
