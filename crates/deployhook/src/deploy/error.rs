use thiserror::Error;

/// Reasons a gated-in deploy can end in failure. Each one is caught at the sequence
/// boundary and turned into a failed `DeployRecord`.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("source sync failed: {0}")]
    SourceSync(String),

    #[error("dependency sync failed: {0}")]
    DependencySync(String),

    #[error("service restart failed: {0}")]
    ProcessRestart(String),

    #[error("deploy exceeded its {limit_seconds}s limit during {step}")]
    Timeout {
        limit_seconds: u64,
        step: &'static str,
    },

    #[error("deploy lease unavailable: {0}")]
    Lease(String),
}

impl DeployError {
    pub(crate) fn source_sync(error: &anyhow::Error) -> Self {
        Self::SourceSync(format!("{error:#}"))
    }

    pub(crate) fn dependency_sync(error: &anyhow::Error) -> Self {
        Self::DependencySync(format!("{error:#}"))
    }

    pub(crate) fn process_restart(error: &anyhow::Error) -> Self {
        Self::ProcessRestart(format!("{error:#}"))
    }

    /// Stable identifier stored in the deploy log.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SourceSync(_) => "source_sync",
            Self::DependencySync(_) => "dependency_sync",
            Self::ProcessRestart(_) => "process_restart",
            Self::Timeout { .. } => "timeout",
            Self::Lease(_) => "lease",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_snake_case() {
        assert_eq!(DeployError::SourceSync(String::new()).kind(), "source_sync");
        assert_eq!(
            DeployError::Timeout {
                limit_seconds: 300,
                step: "restart"
            }
            .kind(),
            "timeout"
        );
    }

    #[test]
    fn messages_keep_the_anyhow_context_chain() {
        let error = anyhow::anyhow!("exit status 128").context("git fetch failed");
        let converted = DeployError::source_sync(&error);
        assert_eq!(
            converted.to_string(),
            "source sync failed: git fetch failed: exit status 128"
        );
    }
}
