//! Serialized integration of approved implementation branches.
//!
//! Each attempt runs `rebase -> unit tests -> merge --no-ff -> integration
//! suite` while holding a global merge lock, so the integration branch only
//! ever sees one merge at a time. A failing integration suite reverts the
//! merge commit and keeps the worktree lease for inspection.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::{
    config::Config,
    db::Db,
    git::Git,
    pool::WorktreePool,
    types::{FailureSeverity, JobStatus, MergeAttempt, MergeStage, MergeStatus, WorktreeLease},
};

const OUTPUT_TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub integration_branch: String,
    pub unit_test_cmd: String,
    pub integration_test_cmd: String,
    pub retry_budget: u32,
    pub lease_acquire_timeout: Duration,
}

impl From<&Config> for MergeSettings {
    fn from(c: &Config) -> Self {
        Self {
            integration_branch: c.integration_branch.clone(),
            unit_test_cmd: c.unit_test_cmd.clone(),
            integration_test_cmd: c.integration_test_cmd.clone(),
            retry_budget: c.merge_retry_budget,
            lease_acquire_timeout: c.lease_acquire_timeout(),
        }
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────

/// Producer side of the merge queue. A job id is queued at most once at a time.
#[derive(Clone)]
pub struct MergeQueue {
    tx: mpsc::UnboundedSender<String>,
    queued: Arc<StdMutex<HashSet<String>>>,
}

pub struct MergeReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    queued: Arc<StdMutex<HashSet<String>>>,
}

pub fn merge_queue() -> (MergeQueue, MergeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(StdMutex::new(HashSet::new()));
    (
        MergeQueue {
            tx,
            queued: Arc::clone(&queued),
        },
        MergeReceiver { rx, queued },
    )
}

impl MergeQueue {
    /// Returns false if the job is already waiting or the worker is gone.
    pub fn enqueue(&self, job_id: &str) -> bool {
        let mut q = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        if !q.insert(job_id.to_string()) {
            return false;
        }
        if self.tx.send(job_id.to_string()).is_err() {
            q.remove(job_id);
            return false;
        }
        true
    }
}

impl MergeReceiver {
    pub async fn recv(&mut self) -> Option<String> {
        let id = self.rx.recv().await?;
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        Some(id)
    }
}

// ── Failure classification ────────────────────────────────────────────────

const FAILURE_WORDS: &[&str] = &[
    "fail", "failed", "failure", "failures", "error", "errors", "panic", "panicked", "abort",
    "aborted",
];
const CRITICAL_PHRASES: &[&[&str]] = &[&["critical"], &["security"], &["data", "loss"]];
const WARNING_WORDS: &[&str] = &["warning", "warnings", "warn", "lint"];

/// Lowercased words of `line`; identifiers such as `auth_token` stay whole.
fn words(line: &str) -> Vec<String> {
    line.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn has_any(words: &[String], wanted: &[&str]) -> bool {
    words.iter().any(|w| wanted.contains(&w.as_str()))
}

fn has_phrase(words: &[String], phrase: &[&str]) -> bool {
    words
        .windows(phrase.len())
        .any(|win| win.iter().zip(phrase).all(|(w, p)| w == p))
}

/// Classify a failing integration run from its output.
///
/// Only failure lines are inspected for CRITICAL markers: lines carrying a
/// failure word, or lines tagged `CRITICAL` as a log level. Output with no
/// failure line but some warnings is a Warning; anything else is an Error.
pub fn classify_failure(output: &str) -> FailureSeverity {
    let mut failures = 0usize;
    let mut warnings = 0usize;
    for line in output.lines() {
        let tokens = words(line);
        let tagged_critical = tokens.first().is_some_and(|w| w == "critical");
        if tagged_critical || has_any(&tokens, FAILURE_WORDS) {
            if CRITICAL_PHRASES.iter().any(|p| has_phrase(&tokens, p)) {
                return FailureSeverity::Critical;
            }
            failures += 1;
        } else if has_any(&tokens, WARNING_WORDS) {
            warnings += 1;
        }
    }
    if failures == 0 && warnings > 0 {
        FailureSeverity::Warning
    } else {
        FailureSeverity::Error
    }
}

fn tail(s: &str) -> &str {
    let s = s.trim();
    if s.len() <= OUTPUT_TAIL_CHARS {
        return s;
    }
    let mut start = s.len() - OUTPUT_TAIL_CHARS;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn recovery_note(attempt: &MergeAttempt, merge_commit: &str, output: &str) -> String {
    format!(
        "Merge attempt {} of branch {} was rolled back: the integration suite failed on \
         merge commit {}. Fix the failure below before the next attempt.\n\n{}",
        attempt.retry_count + 1,
        attempt.branch,
        &merge_commit[..merge_commit.len().min(12)],
        tail(output),
    )
}

// ── Shell ─────────────────────────────────────────────────────────────────

pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ShellOutput {
    fn passed() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs `cmd` through `sh -c` in `dir`. An empty command passes.
pub async fn run_shell(dir: &str, cmd: &str) -> Result<ShellOutput> {
    if cmd.trim().is_empty() {
        return Ok(ShellOutput::passed());
    }
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .output()
        .await
        .context("run test command")?;

    Ok(ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(1),
    })
}

// ── Engine ────────────────────────────────────────────────────────────────

pub struct MergeEngine {
    db: Arc<Db>,
    pool: Arc<WorktreePool>,
    git: Git,
    settings: MergeSettings,
    merge_lock: Mutex<()>,
}

impl MergeEngine {
    pub fn new(db: Arc<Db>, pool: Arc<WorktreePool>, git: Git, settings: MergeSettings) -> Self {
        Self {
            db,
            pool,
            git,
            settings,
            merge_lock: Mutex::new(()),
        }
    }

    /// Consume the queue until every sender is dropped. Attempts that come
    /// back `Pending` (an ERROR failure with budget left) are re-queued.
    pub async fn run_worker(self: Arc<Self>, queue: MergeQueue, mut rx: MergeReceiver) {
        info!("merge worker started");
        while let Some(job_id) = rx.recv().await {
            match self.process(&job_id).await {
                Ok(attempt) if attempt.status == MergeStatus::Pending => {
                    info!(
                        job_id = %job_id,
                        retry_count = attempt.retry_count,
                        "re-queueing merge after rollback"
                    );
                    queue.enqueue(&job_id);
                }
                Ok(_) => {}
                Err(e) => error!(job_id = %job_id, "merge attempt error: {e:#}"),
            }
        }
        info!("merge worker stopped");
    }

    /// Re-queue attempts left pending by a previous process.
    pub fn resume_pending(&self, queue: &MergeQueue) -> Result<usize> {
        let pending = self.db.list_pending_merges()?;
        for m in &pending {
            queue.enqueue(&m.task_id);
        }
        Ok(pending.len())
    }

    /// Run one integration attempt for `job_id` under the global merge lock.
    pub async fn process(&self, job_id: &str) -> Result<MergeAttempt> {
        let _guard = self.merge_lock.lock().await;

        let job = self
            .db
            .get_job(job_id)?
            .with_context(|| format!("unknown job {job_id}"))?;
        if job.status != JobStatus::Completed {
            anyhow::bail!("job {job_id} is {} and cannot be merged", job.status);
        }
        let branch = job
            .branch
            .clone()
            .filter(|b| !b.is_empty())
            .with_context(|| format!("job {job_id} has no branch"))?;

        let mut attempt = self.db.upsert_merge_attempt(job_id, &branch)?;
        if attempt.status.is_terminal() {
            return Ok(attempt);
        }

        // A retry replaces the worktree preserved by the previous rollback.
        if let Some(old) = attempt.lease_id.take() {
            let _ = self.pool.release(&old);
        }

        let lease = match self
            .pool
            .acquire(
                &job.tenant_id,
                Some(job_id),
                self.settings.lease_acquire_timeout,
            )
            .await
        {
            Ok(l) => l,
            Err(e) if e.is_retryable() => {
                warn!(job_id, "merge waiting for a worktree: {e}");
                attempt.error = Some(e.to_string());
                self.db.update_merge_attempt(&attempt)?;
                return Ok(attempt);
            }
            Err(e) => return Err(e.into()),
        };
        attempt.lease_id = Some(lease.lease_id.clone());
        attempt.error = None;
        attempt.severity = None;

        self.attempt(&mut attempt, &lease).await?;
        Ok(attempt)
    }

    fn advance(&self, attempt: &mut MergeAttempt, stage: MergeStage) -> Result<()> {
        attempt.stage = stage;
        self.db.update_merge_attempt(attempt)?;
        info!(task_id = %attempt.task_id, stage = stage.as_str(), "merge stage");
        Ok(())
    }

    /// Stop before anything reached the integration branch.
    fn abort(&self, attempt: &mut MergeAttempt, lease: &WorktreeLease, reason: String) -> Result<()> {
        warn!(task_id = %attempt.task_id, "merge aborted: {reason}");
        attempt.stage = MergeStage::Aborted;
        attempt.status = MergeStatus::Failed;
        attempt.error = Some(reason);
        attempt.lease_id = None;
        self.db.update_merge_attempt(attempt)?;
        let _ = self.pool.release(&lease.lease_id);
        Ok(())
    }

    fn finish(&self, attempt: &mut MergeAttempt, lease: &WorktreeLease) -> Result<()> {
        attempt.stage = MergeStage::Done;
        attempt.status = MergeStatus::Succeeded;
        attempt.lease_id = None;
        attempt.revert_commit = None;
        self.db.update_merge_attempt(attempt)?;
        let _ = self.pool.release(&lease.lease_id);
        info!(
            task_id = %attempt.task_id,
            merge_commit = ?attempt.merge_commit,
            "merge succeeded"
        );
        Ok(())
    }

    /// Drive one attempt to a recorded outcome. Failures before the merge
    /// commit exists abort; any failure after it rolls the merge back.
    async fn attempt(&self, attempt: &mut MergeAttempt, lease: &WorktreeLease) -> Result<()> {
        let (pre_merge, merge_commit) = match self.merge_stage(attempt, lease).await {
            Ok(merged) => merged,
            Err(e) => return self.abort(attempt, lease, format!("{e:#}")),
        };

        let suite = match self.integration_stage(attempt, lease, &merge_commit).await {
            Ok(suite) => suite,
            Err(e) => {
                error!(task_id = %attempt.task_id, "integration stage failed: {e:#}");
                attempt.severity = Some(FailureSeverity::Error);
                let output = format!("integration stage could not run: {e:#}");
                return self.rollback(attempt, lease, &pre_merge, &merge_commit, &output);
            }
        };
        if suite.success() {
            return self.finish(attempt, lease);
        }

        let output = suite.combined_output();
        let severity = classify_failure(&output);
        attempt.severity = Some(severity);
        if severity == FailureSeverity::Warning {
            attempt.error = Some(format!("integration warnings:\n{}", tail(&output)));
            return self.finish(attempt, lease);
        }

        self.rollback(attempt, lease, &pre_merge, &merge_commit, &output)
    }

    /// Rebase, unit tests, then merge. Returns `(pre_merge, merge_commit)`.
    async fn merge_stage(
        &self,
        attempt: &mut MergeAttempt,
        lease: &WorktreeLease,
    ) -> Result<(String, String)> {
        let wt = lease.path.as_str();
        let target = self.settings.integration_branch.as_str();

        // 1. Rebase the branch onto the integration branch.
        self.advance(attempt, MergeStage::Rebasing)?;
        self.git.checkout_detached(wt, &attempt.branch)?;
        if let Err(e) = self.git.rebase_onto(wt, target) {
            let _ = self.git.abort_rebase(wt);
            anyhow::bail!("rebase onto {target} failed: {e:#}");
        }
        let mut rebased = self.git.rev_parse_in(wt, "HEAD")?;

        // After a rollback the branch's commits already sit in the target's
        // history behind the revert, so re-apply them by reverting the revert.
        if let Some(revert) = attempt.revert_commit.clone() {
            if self.git.is_ancestor_in(wt, &revert, "HEAD")? {
                rebased = self.git.revert_in(wt, &revert).with_context(|| {
                    format!("re-applying {} over {revert} failed", attempt.branch)
                })?;
            }
        }
        if rebased == self.git.rev_parse(target)? {
            anyhow::bail!("branch {} has no changes relative to {target}", attempt.branch);
        }
        let _ = self.pool.touch(&lease.lease_id);

        // 2. The job's own tests, post-rebase.
        self.advance(attempt, MergeStage::Testing)?;
        let unit = run_shell(wt, &self.settings.unit_test_cmd).await?;
        if !unit.success() {
            anyhow::bail!(
                "unit tests failed after rebase (exit {}):\n{}",
                unit.exit_code,
                tail(&unit.combined_output())
            );
        }
        let _ = self.pool.touch(&lease.lease_id);

        // 3. Merge into the integration branch.
        let pre_merge = self.git.rev_parse(target)?;
        let message = format!("Merge {} ({})", attempt.branch, attempt.task_id);
        let merge_commit = self.git.merge_no_ff(target, &rebased, &message)?;
        attempt.merge_commit = Some(merge_commit.clone());
        Ok((pre_merge, merge_commit))
    }

    /// Full integration suite against the merge commit.
    async fn integration_stage(
        &self,
        attempt: &mut MergeAttempt,
        lease: &WorktreeLease,
        merge_commit: &str,
    ) -> Result<ShellOutput> {
        let wt = lease.path.as_str();
        self.advance(attempt, MergeStage::Merged)?;
        self.advance(attempt, MergeStage::IntegrationTesting)?;
        self.git.checkout_detached(wt, merge_commit)?;
        let suite = run_shell(wt, &self.settings.integration_test_cmd).await?;
        let _ = self.pool.touch(&lease.lease_id);
        Ok(suite)
    }

    fn rollback(
        &self,
        attempt: &mut MergeAttempt,
        lease: &WorktreeLease,
        pre_merge: &str,
        merge_commit: &str,
        output: &str,
    ) -> Result<()> {
        let target = self.settings.integration_branch.as_str();
        let _ = self.pool.preserve(&lease.lease_id);
        info!(task_id = %attempt.task_id, merge_commit, "starting rollback");

        let restored = self
            .git
            .checkout(target)
            .and_then(|_| self.git.revert_merge(merge_commit))
            .and_then(|head| Ok((self.git.trees_identical(pre_merge, &head)?, head)));
        match restored {
            Ok((true, head)) => attempt.revert_commit = Some(head),
            Ok((false, _)) => {
                error!(task_id = %attempt.task_id, "rollback left {target} differing from {pre_merge}");
                attempt.status = MergeStatus::Failed;
                attempt.escalated = true;
                attempt.error = Some(format!(
                    "revert of {merge_commit} did not restore {target} to {pre_merge}"
                ));
                self.db.update_merge_attempt(attempt)?;
                return Ok(());
            }
            Err(e) => {
                error!(task_id = %attempt.task_id, "rollback failed: {e:#}");
                attempt.status = MergeStatus::Failed;
                attempt.escalated = true;
                attempt.error = Some(format!("automatic rollback failed: {e:#}"));
                self.db.update_merge_attempt(attempt)?;
                return Ok(());
            }
        }

        attempt.stage = MergeStage::RolledBack;
        attempt.error = Some(tail(output).to_string());
        match attempt.severity {
            Some(FailureSeverity::Critical) => {
                attempt.status = MergeStatus::RolledBack;
                attempt.escalated = true;
                error!(
                    task_id = %attempt.task_id,
                    worktree = %lease.path,
                    "CRITICAL integration failure rolled back; human review required"
                );
            }
            _ if attempt.retry_count < self.settings.retry_budget => {
                attempt.recovery_note = Some(recovery_note(attempt, merge_commit, output));
                attempt.retry_count += 1;
                attempt.status = MergeStatus::Pending;
                warn!(
                    task_id = %attempt.task_id,
                    retry_count = attempt.retry_count,
                    "integration failed; rolled back, retry scheduled"
                );
            }
            _ => {
                attempt.status = MergeStatus::RolledBack;
                warn!(
                    task_id = %attempt.task_id,
                    retry_count = attempt.retry_count,
                    "integration failed; rolled back, retry budget exhausted"
                );
            }
        }
        self.db.update_merge_attempt(attempt)?;
        Ok(())
    }
}
