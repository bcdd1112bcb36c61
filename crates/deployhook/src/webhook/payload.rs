use serde::Deserialize;

/// The parts of a push delivery the listener looks at. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub repository: Option<Repository>,
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub id: String,
}

impl PushEvent {
    /// # Errors
    /// Returns the JSON error if `body` is not a push payload.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// `after`, falling back to `head_commit.id`.
    #[must_use]
    pub fn commit_sha(&self) -> Option<&str> {
        self.after
            .as_deref()
            .map(str::trim)
            .filter(|sha| !sha.is_empty())
            .or_else(|| self.head_commit.as_ref().map(|commit| commit.id.trim()))
            .filter(|sha| !sha.is_empty())
    }

    /// A push that removed the branch; there is nothing to deploy.
    #[must_use]
    pub fn is_branch_deletion(&self) -> bool {
        self.deleted
            || self
                .after
                .as_deref()
                .is_some_and(|sha| !sha.is_empty() && sha.bytes().all(|byte| byte == b'0'))
    }

    #[must_use]
    pub fn repository_name(&self) -> &str {
        self.repository
            .as_ref()
            .and_then(|repository| repository.full_name.as_deref())
            .unwrap_or("-")
    }
}
