use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Tenants ──────────────────────────────────────────────────────────────

/// A rate-limited, isolated caller. The secret itself is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
}

// ── Review Jobs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "InProgress" => Some(Self::InProgress),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status only moves forward; terminal states accept nothing.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress) => true,
            (Self::Pending, Self::Failed) => true,
            (Self::InProgress, Self::Completed) => true,
            (Self::InProgress, Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One review request as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewJob {
    pub job_id: String,
    pub tenant_id: String,
    pub diff: String,
    pub files: Vec<String>,
    /// Set for implementation jobs; the branch the Merge Engine integrates.
    pub branch: Option<String>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub consensus_score: Option<f64>,
    pub tier: Option<Tier>,
    pub mpr_applied: bool,
    pub passed: Option<bool>,
    pub findings: Vec<DeduplicatedFinding>,
    /// Always set when `status == Failed`.
    pub error: Option<String>,
    pub reviewers_dispatched: u32,
    pub reviewers_responded: u32,
    pub bypassed: bool,
}

impl ReviewJob {
    pub fn new(
        job_id: impl Into<String>,
        tenant_id: impl Into<String>,
        diff: impl Into<String>,
        files: Vec<String>,
        branch: Option<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            tenant_id: tenant_id.into(),
            diff: diff.into(),
            files,
            branch,
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            completed_at: None,
            consensus_score: None,
            tier: None,
            mpr_applied: false,
            passed: None,
            findings: Vec::new(),
            error: None,
            reviewers_dispatched: 0,
            reviewers_responded: 0,
            bypassed: false,
        }
    }

    pub fn is_implementation(&self) -> bool {
        self.branch.as_deref().is_some_and(|b| !b.is_empty())
    }
}

// ── Findings ─────────────────────────────────────────────────────────────

/// One reviewer's opinion, as returned by the reviewer agent.
///
/// `reviewer_id` and `reviewer_category` are overwritten by the orchestrator
/// with the identity of the reviewer it dispatched; agents cannot spoof them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    #[serde(default)]
    pub reviewer_id: String,
    #[serde(default)]
    pub reviewer_category: String,
    /// 0–10.
    pub severity: u8,
    /// 0–100.
    pub confidence: u8,
    pub category: String,
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub remediation: String,
}

/// Opinion merged across reviewers that reported the same fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeduplicatedFinding {
    pub fingerprint: String,
    pub file: String,
    pub normalized_line: u32,
    pub category: String,
    pub severity: u8,
    pub confidence: u8,
    pub descriptions: Vec<String>,
    pub remediations: Vec<String>,
    /// Distinct contributing reviewer ids, sorted.
    pub reviewers: Vec<String>,
    /// Distinct contributing reviewer categories, sorted.
    pub reviewer_categories: Vec<String>,
    pub k: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    Informational,
    Moderate,
    Important,
    Critical,
}

impl Tier {
    pub fn from_score(cs: f64) -> Self {
        if cs >= 9.0 {
            Self::Critical
        } else if cs >= 7.0 {
            Self::Important
        } else if cs >= 4.0 {
            Self::Moderate
        } else {
            Self::Informational
        }
    }

    pub fn passes(self) -> bool {
        matches!(self, Self::Informational | Self::Moderate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Informational => "Informational",
            Self::Moderate => "Moderate",
            Self::Important => "Important",
            Self::Critical => "Critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Informational" => Some(Self::Informational),
            "Moderate" => Some(Self::Moderate),
            "Important" => Some(Self::Important),
            "Critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub cs: f64,
    pub tier: Tier,
    pub mpr_applied: bool,
    pub passed: bool,
}

// ── Worktree Leases ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Active,
    /// Held back from the pool after a rolled-back merge, for investigation.
    Preserved,
    Released,
    Orphaned,
}

/// Caller-visible view of an exclusively held working copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeLease {
    pub lease_id: String,
    pub tenant_id: String,
    pub job_id: Option<String>,
    pub slot: usize,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub state: LeaseState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub preserved: usize,
    pub available: usize,
    pub orphaned_total: u64,
}

// ── Merge Engine ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStage {
    Pending,
    Rebasing,
    Testing,
    Merged,
    IntegrationTesting,
    Done,
    RolledBack,
    /// Stopped before anything reached the integration branch.
    Aborted,
}

impl MergeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Rebasing => "rebasing",
            Self::Testing => "testing",
            Self::Merged => "merged",
            Self::IntegrationTesting => "integration_testing",
            Self::Done => "done",
            Self::RolledBack => "rolled_back",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "rebasing" => Some(Self::Rebasing),
            "testing" => Some(Self::Testing),
            "merged" => Some(Self::Merged),
            "integration_testing" => Some(Self::IntegrationTesting),
            "done" => Some(Self::Done),
            "rolled_back" => Some(Self::RolledBack),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Succeeded,
    RolledBack,
    /// Aborted before merge (rebase conflict, unit tests, merge conflict).
    Failed,
}

impl MergeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "rolled_back" => Some(Self::RolledBack),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailureSeverity {
    Warning,
    Error,
    Critical,
}

impl FailureSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// One integration effort for an implementation job, updated across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeAttempt {
    pub id: i64,
    pub task_id: String,
    pub branch: String,
    pub lease_id: Option<String>,
    pub stage: MergeStage,
    pub status: MergeStatus,
    pub retry_count: u32,
    pub severity: Option<FailureSeverity>,
    pub recovery_note: Option<String>,
    pub error: Option<String>,
    pub merge_commit: Option<String>,
    /// Revert that undid the last rolled-back merge; a retry re-applies it.
    pub revert_commit: Option<String>,
    /// Critical failures need a human; nothing retries them.
    pub escalated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Emergency bypass ─────────────────────────────────────────────────────

/// Append-only audit row written whenever gating is bypassed for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassRecord {
    pub id: i64,
    pub job_id: String,
    pub tenant_id: String,
    pub operator_id: String,
    pub reason: String,
    /// Consensus score at the moment of bypass (None if not yet scored).
    pub cs_at_bypass: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BypassRecord {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
