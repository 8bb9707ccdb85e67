use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use quorum_core::agent::{ReviewRequest, ReviewerAgent};
use quorum_core::db::Db;
use quorum_core::merge::{merge_queue, MergeReceiver};
use quorum_core::orchestrator::{
    parse_findings, Orchestrator, OrchestratorError, OrchestratorSettings,
};
use quorum_core::pool::{ScratchWorkspace, WorktreePool};
use quorum_core::types::{JobStatus, ReviewJob, Tenant, Tier};
use serde_json::{json, Value};

// ── helpers ───────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Script {
    Findings(Vec<Value>),
    Fail,
    Stall(Duration),
}

struct ScriptedReviewer {
    id: String,
    category: String,
    script: Script,
}

#[async_trait]
impl ReviewerAgent for ScriptedReviewer {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> &str {
        &self.category
    }

    async fn review(&self, request: &ReviewRequest) -> Result<Vec<Value>> {
        assert_eq!(request.reviewer_category, self.category);
        assert!(request.worktree.is_some());
        match &self.script {
            Script::Findings(v) => Ok(v.clone()),
            Script::Fail => anyhow::bail!("reviewer process exited with status 1"),
            Script::Stall(d) => {
                tokio::time::sleep(*d).await;
                Ok(Vec::new())
            }
        }
    }
}

const CATEGORIES: [&str; 5] = [
    "security",
    "reliability",
    "correctness",
    "performance",
    "maintainability",
];

fn panel(scripts: Vec<Script>) -> Vec<Arc<dyn ReviewerAgent>> {
    scripts
        .into_iter()
        .zip(CATEGORIES)
        .map(|(script, category)| {
            Arc::new(ScriptedReviewer {
                id: format!("reviewer-{category}"),
                category: category.to_string(),
                script,
            }) as Arc<dyn ReviewerAgent>
        })
        .collect()
}

fn quiet_panel() -> Vec<Arc<dyn ReviewerAgent>> {
    panel(vec![Script::Findings(vec![]); 5])
}

fn sql_injection(line: u32) -> Value {
    json!({
        "severity": 8,
        "confidence": 90,
        "category": "security",
        "file": "app/db.py",
        "line": line,
        "description": "query built by string concatenation",
        "remediation": "use bound parameters"
    })
}

/// Three of five reviewers flag the same two spots.
fn consensus_panel() -> Vec<Arc<dyn ReviewerAgent>> {
    let flagged = Script::Findings(vec![sql_injection(40), sql_injection(43)]);
    panel(vec![
        flagged.clone(),
        flagged.clone(),
        flagged,
        Script::Findings(vec![]),
        Script::Findings(vec![]),
    ])
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        job_timeout: Duration::from_secs(5),
        reviewer_timeout: Duration::from_secs(2),
        lease_acquire_timeout: Duration::from_secs(1),
        max_pending_jobs: 10,
        bypass_ttl_hours: 24,
        lease_stale_hours: 24,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    orch: Arc<Orchestrator>,
    merges: Option<MergeReceiver>,
}

fn harness(
    reviewers: Vec<Arc<dyn ReviewerAgent>>,
    settings: OrchestratorSettings,
    with_merge: bool,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Db::open(":memory:").unwrap();
    db.migrate().unwrap();
    db.insert_tenant(&Tenant {
        id: "acme".into(),
        name: "acme".into(),
        secret_hash: "00".into(),
        created_at: Utc::now(),
    })
    .unwrap();
    let pool = Arc::new(WorktreePool::new(
        2,
        24,
        Arc::new(ScratchWorkspace::new(dir.path().join("worktrees"))),
    ));
    let (queue, merges) = if with_merge {
        let (q, rx) = merge_queue();
        (Some(q), Some(rx))
    } else {
        (None, None)
    };
    let orch = Arc::new(Orchestrator::new(
        Arc::new(db),
        pool,
        reviewers,
        settings,
        queue,
    ));
    Harness {
        _dir: dir,
        orch,
        merges,
    }
}

async fn wait_terminal(orch: &Orchestrator, job_id: &str) -> ReviewJob {
    for _ in 0..500 {
        let job = orch.db.get_job(job_id).unwrap().unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ── full pipeline ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_pipeline_two_agreed_findings() {
    let h = harness(consensus_panel(), settings(), false);
    let job = h
        .orch
        .submit("acme", "--- a/app/db.py\n+++ b/app/db.py\n", vec!["app/db.py".into()], None)
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let done = wait_terminal(&h.orch, &job.job_id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.findings.len(), 2);
    assert!(done.findings.iter().all(|f| f.k == 3));
    assert!(close(done.consensus_score.unwrap(), 7.2));
    assert_eq!(done.tier, Some(Tier::Important));
    assert_eq!(done.passed, Some(false));
    assert!(!done.mpr_applied);
    assert_eq!(done.reviewers_dispatched, 5);
    assert_eq!(done.reviewers_responded, 5);
    assert_eq!(h.orch.pool.stats().in_use, 0);
}

#[tokio::test]
async fn test_bad_reviewers_do_not_sink_consensus() {
    let mixed = vec![
        Script::Findings(vec![
            json!({"severity": 6, "confidence": 50, "category": "correctness",
                   "file": "a.rs", "line": 1, "reviewer_id": "spoofed"}),
            json!({"severity": "high", "file": "a.rs"}),
            json!({"severity": 11, "confidence": 50, "category": "x", "file": "a.rs", "line": 2}),
        ]),
        Script::Fail,
        Script::Stall(Duration::from_secs(30)),
        Script::Findings(vec![]),
        Script::Findings(vec![]),
    ];
    let mut s = settings();
    s.reviewer_timeout = Duration::from_millis(200);
    let h = harness(panel(mixed), s, false);
    let job = h.orch.submit("acme", "+x", vec!["a.rs".into()], None).unwrap();

    let done = wait_terminal(&h.orch, &job.job_id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.reviewers_responded, 3);
    assert_eq!(done.findings.len(), 1);
    assert_eq!(done.findings[0].reviewers, vec!["reviewer-security".to_string()]);
    assert!(close(done.consensus_score.unwrap(), 2.28));
    assert_eq!(done.passed, Some(true));
}

#[tokio::test]
async fn test_job_timeout_fails_and_releases_lease() {
    let mut s = settings();
    s.job_timeout = Duration::from_millis(150);
    s.reviewer_timeout = Duration::from_secs(30);
    let h = harness(panel(vec![Script::Stall(Duration::from_secs(30)); 5]), s, false);
    let job = h.orch.submit("acme", "+x", vec![], None).unwrap();

    let done = wait_terminal(&h.orch, &job.job_id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.error.unwrap().contains("timeout"));
    assert!(done.tier.is_none());
    assert_eq!(h.orch.pool.stats().in_use, 0);
}

// ── admission ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_submission_validation() {
    let h = harness(quiet_panel(), settings(), false);
    assert!(matches!(
        h.orch.submit("acme", "   ", vec![], None),
        Err(OrchestratorError::Validation(_))
    ));
    assert!(matches!(
        h.orch.submit("acme", "+x", vec!["".into()], None),
        Err(OrchestratorError::Validation(_))
    ));
    assert!(matches!(
        h.orch.submit("acme", "+x", vec![], Some("--upload-pack=evil".into())),
        Err(OrchestratorError::Validation(_))
    ));
    assert_eq!(h.orch.db.count_unfinished_jobs().unwrap(), 0);
}

#[tokio::test]
async fn test_backlog_limit_rejects_new_jobs() {
    let mut s = settings();
    s.max_pending_jobs = 1;
    let h = harness(panel(vec![Script::Stall(Duration::from_secs(30)); 5]), s, false);
    h.orch.submit("acme", "+x", vec![], None).unwrap();
    let err = h.orch.submit("acme", "+y", vec![], None).unwrap_err();
    assert!(matches!(err, OrchestratorError::Backlog { pending: 1, limit: 1 }));
}

// ── merge gate / bypass ───────────────────────────────────────────────────

#[tokio::test]
async fn test_passing_implementation_job_is_queued() {
    let mut h = harness(quiet_panel(), settings(), true);
    let job = h
        .orch
        .submit("acme", "+x", vec![], Some("feature/clean".into()))
        .unwrap();
    let done = wait_terminal(&h.orch, &job.job_id).await;
    assert_eq!(done.passed, Some(true));

    let rx = h.merges.as_mut().unwrap();
    let queued = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(queued.as_deref(), Some(job.job_id.as_str()));
    let attempt = h.orch.db.get_merge_attempt(&job.job_id).unwrap().unwrap();
    assert_eq!(attempt.branch, "feature/clean");
}

#[tokio::test]
async fn test_failing_job_merges_only_after_bypass() {
    let mut h = harness(consensus_panel(), settings(), true);
    let job = h
        .orch
        .submit("acme", "+x", vec![], Some("feature/risky".into()))
        .unwrap();
    let done = wait_terminal(&h.orch, &job.job_id).await;
    assert_eq!(done.passed, Some(false));

    let rx = h.merges.as_mut().unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err());
    assert!(h.orch.db.get_merge_attempt(&job.job_id).unwrap().is_none());

    assert!(matches!(
        h.orch.bypass(&done, "oncall-7", "  "),
        Err(OrchestratorError::Validation(_))
    ));
    assert!(matches!(
        h.orch.bypass(&done, "", "prod outage"),
        Err(OrchestratorError::Validation(_))
    ));
    assert!(h.orch.db.list_bypasses(&job.job_id).unwrap().is_empty());

    let record = h.orch.bypass(&done, "oncall-7", "prod outage").unwrap();
    assert_eq!(record.operator_id, "oncall-7");
    assert!(close(record.cs_at_bypass.unwrap(), 7.2));

    let queued = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(queued.as_deref(), Some(job.job_id.as_str()));
    assert!(h.orch.db.get_job(&job.job_id).unwrap().unwrap().bypassed);
}

// ── maintenance ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sweep_fails_job_with_orphaned_lease() {
    let h = harness(quiet_panel(), settings(), false);
    let job = ReviewJob::new("stuck", "acme", "+x", vec![], None);
    h.orch.db.insert_job(&job).unwrap();
    h.orch.db.mark_job_in_progress("stuck", 5).unwrap();
    let lease = h
        .orch
        .pool
        .acquire("acme", Some("stuck"), Duration::from_millis(50))
        .await
        .unwrap();

    let orphaned = h.orch.sweep_at(Utc::now() + ChronoDuration::hours(25));
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].lease_id, lease.lease_id);

    let failed = h.orch.db.get_job("stuck").unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("orphaned"));
}

#[tokio::test]
async fn test_restart_fails_unfinished_jobs() {
    let h = harness(quiet_panel(), settings(), false);
    for id in ["a", "b"] {
        h.orch
            .db
            .insert_job(&ReviewJob::new(id, "acme", "+x", vec![], None))
            .unwrap();
    }
    h.orch.db.mark_job_in_progress("b", 5).unwrap();

    assert_eq!(h.orch.fail_interrupted().unwrap(), 2);
    assert_eq!(h.orch.db.count_unfinished_jobs().unwrap(), 0);
    assert_eq!(h.orch.fail_interrupted().unwrap(), 0);
}

#[test]
fn test_parse_findings_stamps_dispatch_identity() {
    let values = vec![
        json!({"severity": 3, "confidence": 40, "category": "style", "file": "x.rs",
               "line": 9, "reviewer_id": "someone-else", "reviewer_category": "security"}),
        json!({"severity": 3, "confidence": 101, "category": "style", "file": "x.rs", "line": 9}),
        json!({"severity": 3, "confidence": 40, "category": "", "file": "x.rs", "line": 9}),
        json!("not an object"),
    ];
    let out = parse_findings("job", "reviewer-performance", "performance", values);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].reviewer_id, "reviewer-performance");
    assert_eq!(out[0].reviewer_category, "performance");
    assert_eq!(out[0].description, "");
}
