use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    BypassRecord, ConsensusResult, DeduplicatedFinding, FailureSeverity, JobStatus, MergeAttempt,
    MergeStage, MergeStatus, ReviewJob, Tenant, Tier,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

const JOB_COLUMNS: &str = "job_id, tenant_id, diff, files, branch, status, submitted_at, \
     completed_at, consensus_score, tier, mpr_applied, passed, findings, error, \
     reviewers_dispatched, reviewers_responded, \
     EXISTS(SELECT 1 FROM bypass_audit b WHERE b.job_id = review_jobs.job_id)";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewJob> {
    let files: String = row.get(3)?;
    let status: String = row.get(5)?;
    let submitted_at: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;
    let tier: Option<String> = row.get(9)?;
    let findings: String = row.get(12)?;
    Ok(ReviewJob {
        job_id: row.get(0)?,
        tenant_id: row.get(1)?,
        diff: row.get(2)?,
        files: serde_json::from_str(&files).unwrap_or_default(),
        branch: row.get(4)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        submitted_at: parse_ts(&submitted_at),
        completed_at: completed_at.as_deref().map(parse_ts),
        consensus_score: row.get(8)?,
        tier: tier.as_deref().and_then(Tier::parse),
        mpr_applied: row.get(10)?,
        passed: row.get(11)?,
        findings: serde_json::from_str::<Vec<DeduplicatedFinding>>(&findings).unwrap_or_default(),
        error: row.get(13)?,
        reviewers_dispatched: row.get(14)?,
        reviewers_responded: row.get(15)?,
        bypassed: row.get(16)?,
    })
}

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    let created_at: String = row.get(3)?;
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        secret_hash: row.get(2)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_bypass(row: &rusqlite::Row<'_>) -> rusqlite::Result<BypassRecord> {
    let created_at: String = row.get(6)?;
    let expires_at: String = row.get(7)?;
    Ok(BypassRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        tenant_id: row.get(2)?,
        operator_id: row.get(3)?,
        reason: row.get(4)?,
        cs_at_bypass: row.get(5)?,
        created_at: parse_ts(&created_at),
        expires_at: parse_ts(&expires_at),
    })
}

const MERGE_COLUMNS: &str = "id, task_id, branch, lease_id, stage, status, retry_count, \
     severity, recovery_note, error, merge_commit, revert_commit, escalated, created_at, \
     updated_at";

fn row_to_merge_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeAttempt> {
    let stage: String = row.get(4)?;
    let status: String = row.get(5)?;
    let severity: Option<String> = row.get(7)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(MergeAttempt {
        id: row.get(0)?,
        task_id: row.get(1)?,
        branch: row.get(2)?,
        lease_id: row.get(3)?,
        stage: MergeStage::parse(&stage).unwrap_or(MergeStage::Pending),
        status: MergeStatus::parse(&status).unwrap_or(MergeStatus::Pending),
        retry_count: row.get(6)?,
        severity: severity.as_deref().and_then(FailureSeverity::parse),
        recovery_note: row.get(8)?,
        error: row.get(9)?,
        merge_commit: row.get(10)?,
        revert_commit: row.get(11)?,
        escalated: row.get(12)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Tenants ───────────────────────────────────────────────────────────

    /// Returns false when the id is already taken.
    pub fn insert_tenant(&self, tenant: &Tenant) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO tenants (id, name, secret_hash, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    tenant.id,
                    tenant.name,
                    tenant.secret_hash,
                    fmt_ts(tenant.created_at)
                ],
            )
            .context("insert_tenant")?;
        Ok(n == 1)
    }

    pub fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, name, secret_hash, created_at FROM tenants WHERE id = ?1",
                params![id],
                row_to_tenant,
            )
            .optional()
            .context("get_tenant")?;
        Ok(result)
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, name, secret_hash, created_at FROM tenants ORDER BY created_at, id",
        )?;
        let tenants = stmt
            .query_map([], row_to_tenant)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_tenants")?;
        Ok(tenants)
    }

    // ── Review Jobs ───────────────────────────────────────────────────────

    pub fn insert_job(&self, job: &ReviewJob) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO review_jobs \
             (job_id, tenant_id, diff, files, branch, status, submitted_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                job.job_id,
                job.tenant_id,
                job.diff,
                serde_json::to_string(&job.files)?,
                job.branch,
                job.status.as_str(),
                fmt_ts(job.submitted_at),
            ],
        )
        .context("insert_job")?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<ReviewJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM review_jobs WHERE job_id = ?1"),
                params![job_id],
                row_to_job,
            )
            .optional()
            .context("get_job")?;
        Ok(result)
    }

    pub fn list_unfinished_jobs(&self) -> Result<Vec<ReviewJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM review_jobs \
             WHERE status IN ('Pending', 'InProgress') ORDER BY submitted_at, job_id"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_unfinished_jobs")?;
        Ok(jobs)
    }

    pub fn count_unfinished_jobs(&self) -> Result<u32> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM review_jobs WHERE status IN ('Pending', 'InProgress')",
                [],
                |r| r.get(0),
            )
            .context("count_unfinished_jobs")?;
        Ok(n)
    }

    /// Compare-and-set on status. Returns false (and writes nothing) when the
    /// current status does not permit `next`.
    fn transition(
        conn: &Connection,
        job_id: &str,
        next: JobStatus,
        set_sql: &str,
        extra: &[&dyn rusqlite::ToSql],
    ) -> Result<bool> {
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM review_jobs WHERE job_id = ?1",
                params![job_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(current) = current.as_deref().and_then(JobStatus::parse) else {
            return Ok(false);
        };
        if !current.can_transition_to(next) {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE review_jobs SET status = ?1, updated_at = ?2{set_sql} \
             WHERE job_id = ?3 AND status = ?4"
        );
        let now = now_str();
        let next_s = next.as_str();
        let current_s = current.as_str();
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&next_s, &now, &job_id, &current_s];
        args.extend_from_slice(extra);
        let n = conn.execute(&sql, args.as_slice())?;
        Ok(n == 1)
    }

    pub fn mark_job_in_progress(&self, job_id: &str, dispatched: u32) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Self::transition(
            &conn,
            job_id,
            JobStatus::InProgress,
            ", reviewers_dispatched = ?5",
            params![dispatched],
        )
        .context("mark_job_in_progress")
    }

    pub fn complete_job(
        &self,
        job_id: &str,
        result: &ConsensusResult,
        findings: &[DeduplicatedFinding],
        responded: u32,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let findings_json = serde_json::to_string(findings)?;
        let now = now_str();
        Self::transition(
            &conn,
            job_id,
            JobStatus::Completed,
            ", completed_at = ?5, consensus_score = ?6, tier = ?7, mpr_applied = ?8, \
             passed = ?9, findings = ?10, reviewers_responded = ?11",
            params![
                now,
                result.cs,
                result.tier.as_str(),
                result.mpr_applied,
                result.passed,
                findings_json,
                responded,
            ],
        )
        .context("complete_job")
    }

    pub fn fail_job(&self, job_id: &str, error: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        Self::transition(
            &conn,
            job_id,
            JobStatus::Failed,
            ", completed_at = ?5, error = ?6",
            params![now, error],
        )
        .context("fail_job")
    }

    // ── Bypass audit ──────────────────────────────────────────────────────

    pub fn insert_bypass(
        &self,
        job_id: &str,
        tenant_id: &str,
        operator_id: &str,
        reason: &str,
        cs_at_bypass: Option<f64>,
        ttl_hours: i64,
    ) -> Result<BypassRecord> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let created_at = Utc::now();
        let expires_at = created_at + ChronoDuration::hours(ttl_hours);
        conn.execute(
            "INSERT INTO bypass_audit \
             (job_id, tenant_id, operator_id, reason, cs_at_bypass, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job_id,
                tenant_id,
                operator_id,
                reason,
                cs_at_bypass,
                fmt_ts(created_at),
                fmt_ts(expires_at),
            ],
        )
        .context("insert_bypass")?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT id, job_id, tenant_id, operator_id, reason, cs_at_bypass, created_at, \
             expires_at FROM bypass_audit WHERE id = ?1",
            params![id],
            row_to_bypass,
        )
        .context("insert_bypass readback")
    }

    pub fn list_bypasses(&self, job_id: &str) -> Result<Vec<BypassRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, job_id, tenant_id, operator_id, reason, cs_at_bypass, created_at, \
             expires_at FROM bypass_audit WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![job_id], row_to_bypass)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_bypasses")?;
        Ok(rows)
    }

    /// Newest bypass for the job that has not expired at `now`.
    pub fn active_bypass(&self, job_id: &str, now: DateTime<Utc>) -> Result<Option<BypassRecord>> {
        Ok(self
            .list_bypasses(job_id)?
            .into_iter()
            .rev()
            .find(|b| b.is_active_at(now)))
    }

    // ── Merge attempts ────────────────────────────────────────────────────

    /// Creates the job's attempt row on first call, returns the existing one after.
    pub fn upsert_merge_attempt(&self, task_id: &str, branch: &str) -> Result<MergeAttempt> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "INSERT OR IGNORE INTO merge_attempts (task_id, branch, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?3)",
            params![task_id, branch, now],
        )
        .context("upsert_merge_attempt")?;
        conn.query_row(
            &format!("SELECT {MERGE_COLUMNS} FROM merge_attempts WHERE task_id = ?1"),
            params![task_id],
            row_to_merge_attempt,
        )
        .context("upsert_merge_attempt readback")
    }

    pub fn get_merge_attempt(&self, task_id: &str) -> Result<Option<MergeAttempt>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {MERGE_COLUMNS} FROM merge_attempts WHERE task_id = ?1"),
                params![task_id],
                row_to_merge_attempt,
            )
            .optional()
            .context("get_merge_attempt")?;
        Ok(result)
    }

    pub fn list_pending_merges(&self) -> Result<Vec<MergeAttempt>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {MERGE_COLUMNS} FROM merge_attempts WHERE status = 'pending' ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], row_to_merge_attempt)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_pending_merges")?;
        Ok(rows)
    }

    pub fn update_merge_attempt(&self, m: &MergeAttempt) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE merge_attempts SET lease_id = ?1, stage = ?2, status = ?3, \
             retry_count = ?4, severity = ?5, recovery_note = ?6, error = ?7, \
             merge_commit = ?8, revert_commit = ?9, escalated = ?10, updated_at = ?11 \
             WHERE id = ?12",
            params![
                m.lease_id,
                m.stage.as_str(),
                m.status.as_str(),
                m.retry_count,
                m.severity.map(|s| s.as_str()),
                m.recovery_note,
                m.error,
                m.merge_commit,
                m.revert_commit,
                m.escalated,
                now_str(),
                m.id,
            ],
        )
        .context("update_merge_attempt")?;
        Ok(())
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("get_config")?;
        Ok(result)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let updated_at = now_str();
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, updated_at],
        )
        .context("set_config")?;
        Ok(())
    }

    pub fn seed_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            params![key, value],
        )
        .context("seed_config")?;
        Ok(())
    }
}
