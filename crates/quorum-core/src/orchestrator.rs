use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    agent::{ReviewRequest, ReviewerAgent},
    config::Config,
    consensus,
    db::Db,
    merge::MergeQueue,
    pool::WorktreePool,
    types::{BypassRecord, JobStatus, RawFinding, ReviewJob, WorktreeLease},
};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),
    #[error("{pending} jobs already pending (limit {limit})")]
    Backlog { pending: u32, limit: u32 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub job_timeout: Duration,
    pub reviewer_timeout: Duration,
    pub lease_acquire_timeout: Duration,
    pub max_pending_jobs: u32,
    pub bypass_ttl_hours: i64,
    pub lease_stale_hours: i64,
}

impl From<&Config> for OrchestratorSettings {
    fn from(c: &Config) -> Self {
        Self {
            job_timeout: c.job_timeout(),
            reviewer_timeout: c.reviewer_timeout(),
            lease_acquire_timeout: c.lease_acquire_timeout(),
            max_pending_jobs: c.max_pending_jobs,
            bypass_ttl_hours: c.bypass_ttl_hours,
            lease_stale_hours: c.lease_stale_hours,
        }
    }
}

pub struct Orchestrator {
    pub db: Arc<Db>,
    pub pool: Arc<WorktreePool>,
    reviewers: Vec<Arc<dyn ReviewerAgent>>,
    settings: OrchestratorSettings,
    merge_queue: Option<MergeQueue>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Db>,
        pool: Arc<WorktreePool>,
        reviewers: Vec<Arc<dyn ReviewerAgent>>,
        settings: OrchestratorSettings,
        merge_queue: Option<MergeQueue>,
    ) -> Self {
        Self {
            db,
            pool,
            reviewers,
            settings,
            merge_queue,
        }
    }

    pub fn reviewer_count(&self) -> u32 {
        self.reviewers.len() as u32
    }

    // ── Submission ────────────────────────────────────────────────────────

    /// Persist a new `Pending` job and start it in the background.
    pub fn submit(
        self: &Arc<Self>,
        tenant_id: &str,
        diff: &str,
        files: Vec<String>,
        branch: Option<String>,
    ) -> Result<ReviewJob, OrchestratorError> {
        validate_submission(diff, &files, branch.as_deref())?;
        if self.reviewers.is_empty() {
            return Err(anyhow::anyhow!("no reviewers configured").into());
        }

        let pending = self.db.count_unfinished_jobs()?;
        if pending >= self.settings.max_pending_jobs {
            return Err(OrchestratorError::Backlog {
                pending,
                limit: self.settings.max_pending_jobs,
            });
        }

        let branch = branch.filter(|b| !b.trim().is_empty());
        let job = ReviewJob::new(
            uuid::Uuid::new_v4().to_string(),
            tenant_id,
            diff,
            files,
            branch,
        );
        self.db.insert_job(&job)?;
        info!(job_id = %job.job_id, tenant_id, files = job.files.len(), "review job submitted");

        let this = Arc::clone(self);
        let spawned = job.clone();
        tokio::spawn(async move {
            this.run_job(spawned).await;
        });
        Ok(job)
    }

    /// Drive one job to a terminal state within the job timeout.
    pub async fn run_job(self: Arc<Self>, job: ReviewJob) {
        let job_id = job.job_id.clone();
        let held: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let outcome = tokio::time::timeout(
            self.settings.job_timeout,
            self.execute(job, Arc::clone(&held)),
        )
        .await;

        // Released regardless of in-flight reviewer calls.
        let held_lease = held.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(lease_id) = held_lease {
            if let Err(e) = self.pool.release(&lease_id) {
                debug!(job_id = %job_id, "lease already reclaimed: {e}");
            }
        }

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                error!(job_id = %job_id, "review job failed: {e:#}");
                Some(format!("{e:#}"))
            }
            Err(_) => {
                warn!(job_id = %job_id, timeout = ?self.settings.job_timeout, "review job timed out");
                Some(format!(
                    "job exceeded its {:?} timeout before all reviewers finished",
                    self.settings.job_timeout
                ))
            }
        };
        if let Some(msg) = failure {
            match self.db.fail_job(&job_id, &msg) {
                Ok(true) => {}
                Ok(false) => debug!(job_id = %job_id, "job already terminal"),
                Err(e) => error!(job_id = %job_id, "fail_job: {e:#}"),
            }
        }
    }

    async fn acquire_lease(&self, job: &ReviewJob) -> Result<WorktreeLease> {
        loop {
            match self
                .pool
                .acquire(
                    &job.tenant_id,
                    Some(&job.job_id),
                    self.settings.lease_acquire_timeout,
                )
                .await
            {
                Ok(lease) => return Ok(lease),
                Err(e) if e.is_retryable() => {
                    info!(job_id = %job.job_id, "worktree pool exhausted, retrying: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn execute(&self, job: ReviewJob, held: Arc<Mutex<Option<String>>>) -> Result<()> {
        let lease = self.acquire_lease(&job).await?;
        // Recorded before the next await so a timeout cannot leak the lease.
        *held.lock().unwrap_or_else(|e| e.into_inner()) = Some(lease.lease_id.clone());

        let dispatched = self.reviewer_count();
        if !self.db.mark_job_in_progress(&job.job_id, dispatched)? {
            warn!(job_id = %job.job_id, "job left Pending before dispatch; skipping");
            return Ok(());
        }
        info!(job_id = %job.job_id, reviewers = dispatched, lease_id = %lease.lease_id, "dispatching reviewers");

        let (raw, responded) = self.fan_out(&job, &lease).await;
        let _ = self.pool.touch(&lease.lease_id);

        let (findings, result) = consensus::evaluate(&raw, dispatched);
        if !self
            .db
            .complete_job(&job.job_id, &result, &findings, responded)?
        {
            warn!(job_id = %job.job_id, "job already terminal; discarding verdict");
            return Ok(());
        }
        info!(
            job_id = %job.job_id,
            cs = result.cs,
            tier = result.tier.as_str(),
            mpr_applied = result.mpr_applied,
            passed = result.passed,
            findings = findings.len(),
            responded,
            "review job completed"
        );

        if job.is_implementation() {
            self.maybe_enqueue_merge(&job.job_id)?;
        }
        Ok(())
    }

    /// One isolated call per reviewer; waits for all of them or the shared
    /// reviewer deadline. Late or failed reviewers contribute nothing.
    async fn fan_out(&self, job: &ReviewJob, lease: &WorktreeLease) -> (Vec<RawFinding>, u32) {
        let deadline = tokio::time::Instant::now() + self.settings.reviewer_timeout;

        let handles: Vec<_> = self
            .reviewers
            .iter()
            .map(|reviewer| {
                let reviewer = Arc::clone(reviewer);
                let request = ReviewRequest {
                    job_id: job.job_id.clone(),
                    diff: job.diff.clone(),
                    files: job.files.clone(),
                    reviewer_category: reviewer.category().to_string(),
                    worktree: Some(lease.path.clone()),
                };
                let id = reviewer.id().to_string();
                let category = reviewer.category().to_string();
                let handle = tokio::spawn(async move { reviewer.review(&request).await });
                (id, category, handle)
            })
            .collect();

        let mut raw = Vec::new();
        let mut responded = 0u32;
        for (id, category, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(values))) => {
                    responded += 1;
                    raw.extend(parse_findings(&job.job_id, &id, &category, values));
                }
                Ok(Ok(Err(e))) => {
                    warn!(job_id = %job.job_id, reviewer = %id, "reviewer failed: {e:#}");
                }
                Ok(Err(e)) => {
                    warn!(job_id = %job.job_id, reviewer = %id, "reviewer task panicked: {e}");
                }
                Err(_) => {
                    warn!(job_id = %job.job_id, reviewer = %id, "reviewer timed out");
                }
            }
        }
        (raw, responded)
    }

    // ── Merge gate ────────────────────────────────────────────────────────

    /// Hand a completed implementation job to the merge engine if it passed
    /// review or carries an unexpired bypass. Returns whether it was queued.
    pub fn maybe_enqueue_merge(&self, job_id: &str) -> Result<bool> {
        let Some(queue) = &self.merge_queue else {
            return Ok(false);
        };
        let Some(job) = self.db.get_job(job_id)? else {
            return Ok(false);
        };
        let Some(branch) = job.branch.as_deref().filter(|b| !b.is_empty()) else {
            return Ok(false);
        };
        if job.status != JobStatus::Completed {
            return Ok(false);
        }
        let bypass = self.db.active_bypass(job_id, Utc::now())?;
        if job.passed != Some(true) && bypass.is_none() {
            info!(job_id, "implementation job did not pass review; not merging");
            return Ok(false);
        }
        let attempt = self.db.upsert_merge_attempt(job_id, branch)?;
        if attempt.status.is_terminal() {
            return Ok(false);
        }
        let queued = queue.enqueue(job_id);
        if queued {
            info!(job_id, branch, bypassed = bypass.is_some(), "queued for merge");
        }
        Ok(queued)
    }

    // ── Emergency bypass ──────────────────────────────────────────────────

    /// Record an audited bypass of review gating for `job`.
    pub fn bypass(
        &self,
        job: &ReviewJob,
        operator_id: &str,
        reason: &str,
    ) -> Result<BypassRecord, OrchestratorError> {
        let operator_id = operator_id.trim();
        let reason = reason.trim();
        if operator_id.is_empty() {
            return Err(OrchestratorError::Validation(
                "operator_id must not be empty".into(),
            ));
        }
        if reason.is_empty() {
            return Err(OrchestratorError::Validation(
                "reason must not be empty".into(),
            ));
        }
        let record = self.db.insert_bypass(
            &job.job_id,
            &job.tenant_id,
            operator_id,
            reason,
            job.consensus_score,
            self.settings.bypass_ttl_hours,
        )?;
        warn!(
            job_id = %job.job_id,
            operator_id,
            cs_at_bypass = ?job.consensus_score,
            expires_at = %record.expires_at,
            "review gating bypassed: {reason}"
        );
        if job.status == JobStatus::Completed && job.is_implementation() {
            self.maybe_enqueue_merge(&job.job_id)?;
        }
        Ok(record)
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    /// Reclaim orphaned leases and fail the jobs that held them.
    pub fn sweep(&self) -> Vec<WorktreeLease> {
        self.fail_orphans(self.pool.sweep())
    }

    pub fn sweep_at(&self, now: chrono::DateTime<Utc>) -> Vec<WorktreeLease> {
        self.fail_orphans(self.pool.sweep_at(now))
    }

    fn fail_orphans(&self, orphaned: Vec<WorktreeLease>) -> Vec<WorktreeLease> {
        for lease in &orphaned {
            let Some(job_id) = lease.job_id.as_deref() else {
                continue;
            };
            let msg = format!(
                "worktree lease {} orphaned after more than {}h without activity",
                lease.lease_id, self.settings.lease_stale_hours
            );
            match self.db.fail_job(job_id, &msg) {
                Ok(true) => warn!(job_id, lease_id = %lease.lease_id, "job failed by orphan sweep"),
                Ok(false) => {}
                Err(e) => error!(job_id, "fail_job after sweep: {e:#}"),
            }
        }
        orphaned
    }

    /// Fail jobs a previous process left unfinished; their reviewers are gone.
    pub fn fail_interrupted(&self) -> Result<usize> {
        let mut n = 0;
        for job in self.db.list_unfinished_jobs()? {
            if self
                .db
                .fail_job(&job.job_id, "interrupted by service restart")?
            {
                n += 1;
            }
        }
        if n > 0 {
            warn!("failed {n} review jobs interrupted by restart");
        }
        Ok(n)
    }
}

fn validate_submission(
    diff: &str,
    files: &[String],
    branch: Option<&str>,
) -> Result<(), OrchestratorError> {
    if diff.trim().is_empty() {
        return Err(OrchestratorError::Validation("diff must not be empty".into()));
    }
    if files.iter().any(|f| f.trim().is_empty()) {
        return Err(OrchestratorError::Validation(
            "files must not contain empty paths".into(),
        ));
    }
    if let Some(b) = branch {
        if b.starts_with('-') || b.contains(char::is_whitespace) || b.contains("..") {
            return Err(OrchestratorError::Validation(format!(
                "invalid branch name {b:?}"
            )));
        }
    }
    Ok(())
}

/// Turn one reviewer's JSON output into findings, dropping malformed entries.
/// Identity fields are taken from the dispatch, never from the payload.
pub fn parse_findings(
    job_id: &str,
    reviewer_id: &str,
    reviewer_category: &str,
    values: Vec<serde_json::Value>,
) -> Vec<RawFinding> {
    let mut out = Vec::with_capacity(values.len());
    for (i, value) in values.into_iter().enumerate() {
        let mut finding: RawFinding = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(e) => {
                warn!(job_id, reviewer = reviewer_id, index = i, "dropping malformed finding: {e}");
                continue;
            }
        };
        if finding.severity > 10
            || finding.confidence > 100
            || finding.file.trim().is_empty()
            || finding.category.trim().is_empty()
        {
            warn!(
                job_id,
                reviewer = reviewer_id,
                index = i,
                severity = finding.severity,
                confidence = finding.confidence,
                "dropping out-of-range finding"
            );
            continue;
        }
        finding.reviewer_id = reviewer_id.to_string();
        finding.reviewer_category = reviewer_category.to_string();
        out.push(finding);
    }
    out
}
