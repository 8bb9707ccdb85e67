use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Input handed to one reviewer. Each reviewer receives its own copy.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewRequest {
    pub job_id: String,
    pub diff: String,
    pub files: Vec<String>,
    pub reviewer_category: String,
    /// Leased working copy the reviewer may inspect.
    #[serde(skip)]
    pub worktree: Option<String>,
}

/// External reviewer capability. Returns `RawFinding`-shaped JSON values,
/// which the caller validates entry by entry.
#[async_trait]
pub trait ReviewerAgent: Send + Sync {
    fn id(&self) -> &str;

    fn category(&self) -> &str;

    async fn review(&self, request: &ReviewRequest) -> Result<Vec<serde_json::Value>>;
}
