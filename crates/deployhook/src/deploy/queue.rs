use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::record::short_sha;
use super::runner::DeployRunner;
use super::DeployRequest;

/// What happened to a submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Nothing was running or waiting; the worker picks it up right away.
    Started,
    /// A deploy is running; this request waits behind it.
    Queued,
    /// Queued, replacing an older request that had not started yet.
    Superseded { replaced: DeployRequest },
    /// Same branch and commit as the running or waiting request.
    Duplicate,
    /// The listener is shutting down and takes no new deploys.
    ShuttingDown,
}

impl Submission {
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Queued => "queued",
            Self::Superseded { .. } => "superseded",
            Self::Duplicate => "duplicate",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub running: Option<DeployRequest>,
    pub pending: Option<DeployRequest>,
}

#[derive(Debug, Default)]
struct QueueState {
    running: Option<DeployRequest>,
    pending: Option<DeployRequest>,
    shutting_down: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    wake: Notify,
    runner: Arc<DeployRunner>,
}

/// Single worker in front of the runner with room for one waiting request. Newer
/// requests replace the waiting one, so only the latest push is deployed after the
/// current deploy finishes.
#[derive(Clone)]
pub struct DeployQueue {
    inner: Arc<QueueInner>,
}

impl DeployQueue {
    /// Starts the worker task. The returned handle finishes after [`Self::shutdown`]
    /// once the in-flight deploy, if any, has completed.
    #[must_use]
    pub fn spawn(runner: Arc<DeployRunner>) -> (Self, JoinHandle<()>) {
        let queue = Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                runner,
            }),
        };

        let worker = queue.clone();
        let handle = tokio::spawn(async move { worker.work().await });
        (queue, handle)
    }

    pub async fn submit(&self, request: DeployRequest) -> Submission {
        let mut state = self.inner.state.lock().await;

        if state.shutting_down {
            return Submission::ShuttingDown;
        }

        let duplicate = state
            .running
            .iter()
            .chain(state.pending.iter())
            .any(|queued| queued.targets_same_state(&request));
        if duplicate {
            info!(branch = %request.branch, commit = %short_sha(request.commit_sha.as_deref()), "duplicate deploy request absorbed");
            return Submission::Duplicate;
        }

        let busy = state.running.is_some();
        let submission = match state.pending.replace(request) {
            Some(replaced) => {
                warn!(
                    branch = %replaced.branch,
                    commit = %short_sha(replaced.commit_sha.as_deref()),
                    "pending deploy superseded by a newer request"
                );
                Submission::Superseded { replaced }
            }
            None if busy => Submission::Queued,
            None => Submission::Started,
        };
        drop(state);

        self.inner.wake.notify_one();
        submission
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock().await;
        QueueSnapshot {
            running: state.running.clone(),
            pending: state.pending.clone(),
        }
    }

    /// Refuses new work and drops any waiting request. The running deploy is left to
    /// finish.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.shutting_down = true;
        if let Some(dropped) = state.pending.take() {
            warn!(
                branch = %dropped.branch,
                commit = %short_sha(dropped.commit_sha.as_deref()),
                "dropping pending deploy on shutdown"
            );
        }
        drop(state);

        self.inner.wake.notify_one();
    }

    async fn work(&self) {
        loop {
            let next = {
                let mut state = self.inner.state.lock().await;
                match state.pending.take() {
                    Some(request) => {
                        state.running = Some(request.clone());
                        Some(request)
                    }
                    None if state.shutting_down => break,
                    None => None,
                }
            };

            let Some(request) = next else {
                self.inner.wake.notified().await;
                continue;
            };

            // A panicking deploy must not take the worker down with it.
            let runner = Arc::clone(&self.inner.runner);
            let task = tokio::spawn(async move { runner.run_deploy(&request).await });
            if let Err(join_error) = task.await {
                error!(error = %join_error, "deploy task aborted");
            }

            self.inner.state.lock().await.running = None;
        }

        info!("deploy worker stopped");
    }
}
