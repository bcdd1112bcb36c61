use serde::Serialize;

use crate::deploy::{DeployRecord, DeployRequest};

#[derive(Debug, Serialize)]
pub(super) struct WebhookResponse {
    pub(super) status: &'static str,
    pub(super) message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) commit_sha: Option<String>,
}

impl WebhookResponse {
    pub(super) fn new(status: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            branch: None,
            commit_sha: None,
        }
    }

    pub(super) fn for_target(mut self, branch: &str, commit_sha: Option<&str>) -> Self {
        self.branch = Some(branch.to_string());
        self.commit_sha = commit_sha.map(ToString::to_string);
        self
    }
}

#[derive(Debug, Serialize)]
pub(super) struct HealthResponse {
    pub(super) status: &'static str,
}

#[derive(Debug, Serialize)]
pub(super) struct StatusResponse {
    pub(super) running: Option<DeployRequest>,
    pub(super) pending: Option<DeployRequest>,
    pub(super) last_deploy: Option<DeployRecord>,
}
