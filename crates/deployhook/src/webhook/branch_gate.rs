use std::collections::BTreeSet;

const BRANCH_REF_PREFIX: &str = "refs/heads/";
const REF_NAMESPACE: &str = "refs/";

/// Branch names allowed to deploy. Loaded once from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedBranchSet {
    names: BTreeSet<String>,
}

impl AllowedBranchSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, branch: &str) -> bool {
        self.names.contains(branch)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Admit { branch: String },
    Reject { branch: String },
}

impl GateDecision {
    #[cfg(test)]
    #[must_use]
    pub fn branch(&self) -> &str {
        match self {
            Self::Admit { branch } | Self::Reject { branch } => branch,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BranchGate {
    allowed: AllowedBranchSet,
}

impl BranchGate {
    #[must_use]
    pub fn new(allowed: AllowedBranchSet) -> Self {
        Self { allowed }
    }

    #[must_use]
    pub fn allowed(&self) -> &AllowedBranchSet {
        &self.allowed
    }

    /// Exact membership of the short branch name. `refs/heads/` is stripped; any other
    /// `refs/` namespace (tags, notes, pull refs) is never a branch and is rejected.
    #[must_use]
    pub fn evaluate(&self, reference: &str) -> GateDecision {
        let Some(branch) = short_branch_name(reference) else {
            return GateDecision::Reject {
                branch: reference.to_string(),
            };
        };

        if self.allowed.contains(branch) {
            GateDecision::Admit {
                branch: branch.to_string(),
            }
        } else {
            GateDecision::Reject {
                branch: branch.to_string(),
            }
        }
    }
}

fn short_branch_name(reference: &str) -> Option<&str> {
    if let Some(branch) = reference.strip_prefix(BRANCH_REF_PREFIX) {
        return Some(branch);
    }

    if reference.starts_with(REF_NAMESPACE) {
        return None;
    }

    Some(reference)
}
