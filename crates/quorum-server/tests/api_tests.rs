use std::{sync::Arc, time::Duration, time::Instant};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use quorum_core::{
    agent::{ReviewRequest, ReviewerAgent},
    db::Db,
    orchestrator::{Orchestrator, OrchestratorSettings},
    pool::{ScratchWorkspace, WorktreePool},
    ratelimit::RateLimiter,
};
use quorum_server::{middleware::hash_secret, router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

// ── helpers ───────────────────────────────────────────────────────────────

struct QuietReviewer(String);

#[async_trait]
impl ReviewerAgent for QuietReviewer {
    fn id(&self) -> &str {
        &self.0
    }

    fn category(&self) -> &str {
        &self.0
    }

    async fn review(&self, _request: &ReviewRequest) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

const OPERATOR_TOKEN: &str = "ops-secret";

struct TestApp {
    _dir: tempfile::TempDir,
    app: Router,
    state: Arc<AppState>,
}

fn test_app_with(capacity: u32, refill_per_s: f64, max_body_bytes: usize) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Db::open(":memory:").unwrap();
    db.migrate().unwrap();
    let db = Arc::new(db);
    let pool = Arc::new(WorktreePool::new(
        2,
        24,
        Arc::new(ScratchWorkspace::new(dir.path().join("worktrees"))),
    ));
    let reviewers: Vec<Arc<dyn ReviewerAgent>> = ["security", "correctness"]
        .into_iter()
        .map(|c| Arc::new(QuietReviewer(c.to_string())) as Arc<dyn ReviewerAgent>)
        .collect();
    let settings = OrchestratorSettings {
        job_timeout: Duration::from_secs(5),
        reviewer_timeout: Duration::from_secs(2),
        lease_acquire_timeout: Duration::from_secs(1),
        max_pending_jobs: 10,
        bypass_ttl_hours: 24,
        lease_stale_hours: 24,
    };
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        pool,
        reviewers,
        settings,
        None,
    ));
    let state = Arc::new(AppState {
        db,
        orchestrator,
        limiter: Arc::new(RateLimiter::new(capacity, refill_per_s).unwrap()),
        max_body_bytes,
        operator_token_hash: Some(hash_secret(OPERATOR_TOKEN)),
        start_time: Instant::now(),
    });
    TestApp {
        _dir: dir,
        app: router(Arc::clone(&state)),
        state,
    }
}

fn test_app() -> TestApp {
    test_app_with(100, 100.0, 1024 * 1024)
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

async fn send(app: &Router, req: Request<Body>) -> Reply {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    Reply {
        status,
        headers,
        body,
    }
}

fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

struct Creds {
    tenant: String,
    secret: String,
}

fn authed(mut req: Request<Body>, creds: &Creds) -> Request<Body> {
    let headers = req.headers_mut();
    headers.insert("x-tenant-id", creds.tenant.parse().unwrap());
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {}", creds.secret).parse().unwrap(),
    );
    req
}

fn as_operator(mut req: Request<Body>, token: &str) -> Request<Body> {
    req.headers_mut()
        .insert("x-operator-token", token.parse().unwrap());
    req
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create_project(app: &Router, name: &str) -> Creds {
    let reply = send(
        app,
        json_request(Method::POST, "/v1/projects/", &json!({ "name": name })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
    Creds {
        tenant: reply.body["id"].as_str().unwrap().to_string(),
        secret: reply.body["secret"].as_str().unwrap().to_string(),
    }
}

async fn submit(app: &Router, creds: &Creds, body: &Value) -> Reply {
    send(
        app,
        authed(json_request(Method::POST, "/v1/reviews/", body), creds),
    )
    .await
}

fn review_body() -> Value {
    json!({
        "diff": "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-a\n+b\n",
        "files": ["src/lib.rs"],
    })
}

async fn wait_terminal(t: &TestApp, job_id: &str) {
    for _ in 0..500 {
        let job = t.state.db.get_job(job_id).unwrap().unwrap();
        if job.status.is_terminal() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never finished");
}

fn assert_envelope(reply: &Reply, kind: &str) {
    assert_eq!(reply.body["error"], kind, "{}", reply.body);
    assert!(reply.body["detail"].is_string());
    assert!(reply.body["request_id"].is_string());
}

// ── projects ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_project_shows_secret_once() {
    let t = test_app();
    let reply = send(
        &t.app,
        json_request(Method::POST, "/v1/projects/", &json!({ "name": "Acme Payments" })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.body["id"], "acme-payments");
    assert_eq!(reply.body["name"], "Acme Payments");
    let secret = reply.body["secret"].as_str().unwrap();
    assert_eq!(secret.len(), 64);
    assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));

    let list = send(&t.app, get("/v1/projects/")).await;
    assert_eq!(list.status, StatusCode::OK);
    let projects = list.body.as_array().unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0]["id"], "acme-payments");
    assert!(projects[0].get("secret").is_none());
    assert!(projects[0].get("secret_hash").is_none());
}

#[tokio::test]
async fn test_duplicate_project_conflicts() {
    let t = test_app();
    create_project(&t.app, "acme").await;
    let reply = send(
        &t.app,
        json_request(Method::POST, "/v1/projects/", &json!({ "name": "Other", "id": "acme" })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CONFLICT);
    assert_envelope(&reply, "Conflict");
}

#[tokio::test]
async fn test_project_validation() {
    let t = test_app();
    let reply = send(
        &t.app,
        json_request(Method::POST, "/v1/projects/", &json!({ "name": "   " })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_envelope(&reply, "ValidationError");

    let reply = send(
        &t.app,
        json_request(Method::POST, "/v1/projects/", &json!({ "name": "x", "id": "no spaces" })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
}

// ── auth ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_or_bad_credentials_are_unauthorized() {
    let t = test_app();
    let creds = create_project(&t.app, "acme").await;

    let reply = send(&t.app, get("/v1/resources/pool")).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_envelope(&reply, "Unauthorized");

    let wrong = Creds {
        tenant: creds.tenant.clone(),
        secret: "0".repeat(64),
    };
    let reply = send(&t.app, authed(get("/v1/resources/pool"), &wrong)).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let unknown = Creds {
        tenant: "nobody".into(),
        secret: creds.secret.clone(),
    };
    let reply = send(&t.app, authed(get("/v1/resources/pool"), &unknown)).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = send(&t.app, authed(get("/v1/resources/pool"), &creds)).await;
    assert_eq!(reply.status, StatusCode::OK);
}

// ── reviews ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_submit_and_poll_review() {
    let t = test_app();
    let creds = create_project(&t.app, "acme").await;

    let reply = submit(&t.app, &creds, &review_body()).await;
    assert_eq!(reply.status, StatusCode::ACCEPTED, "{}", reply.body);
    assert_eq!(reply.body["status"], "Pending");
    let job_id = reply.body["job_id"].as_str().unwrap().to_string();

    wait_terminal(&t, &job_id).await;
    let reply = send(&t.app, authed(get(&format!("/v1/reviews/{job_id}")), &creds)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["job_id"], job_id.as_str());
    assert_eq!(reply.body["status"], "Completed");
    assert_eq!(reply.body["consensus_score"], 0.0);
    assert_eq!(reply.body["passed"], true);
    assert_eq!(reply.body["reviewers_dispatched"], 2);
    assert_eq!(reply.body["bypassed"], false);
}

#[tokio::test]
async fn test_cross_tenant_access_is_forbidden() {
    let t = test_app();
    let owner = create_project(&t.app, "acme").await;
    let other = create_project(&t.app, "globex").await;

    let reply = submit(&t.app, &owner, &review_body()).await;
    let job_id = reply.body["job_id"].as_str().unwrap().to_string();

    let reply = send(&t.app, authed(get(&format!("/v1/reviews/{job_id}")), &other)).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_envelope(&reply, "Forbidden");

    let reply = send(
        &t.app,
        authed(get(&format!("/v1/reviews/{job_id}/audit")), &other),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_job_and_route_are_not_found() {
    let t = test_app();
    let creds = create_project(&t.app, "acme").await;

    let reply = send(&t.app, authed(get("/v1/reviews/does-not-exist"), &creds)).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_envelope(&reply, "NotFound");

    let reply = send(&t.app, get("/v1/nothing-here")).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_envelope(&reply, "NotFound");
}

#[tokio::test]
async fn test_malformed_review_body_is_unprocessable() {
    let t = test_app();
    let creds = create_project(&t.app, "acme").await;

    let req = Request::builder()
        .method(Method::POST)
        .uri("/v1/reviews/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let reply = send(&t.app, authed(req, &creds)).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_envelope(&reply, "ValidationError");

    let reply = submit(&t.app, &creds, &json!({ "diff": "x" })).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);

    let reply = submit(&t.app, &creds, &json!({ "diff": "  ", "files": [] })).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(reply.body["detail"].as_str().unwrap().contains("diff"));

    let mut bad_branch = review_body();
    bad_branch["branch"] = json!("--upload-pack=evil");
    let reply = submit(&t.app, &creds, &bad_branch).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let t = test_app_with(100, 100.0, 1024);
    let creds = create_project(&t.app, "acme").await;

    let body = json!({ "diff": "+".repeat(4096), "files": ["a.rs"] });
    let reply = submit(&t.app, &creds, &body).await;
    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_envelope(&reply, "PayloadTooLarge");
}

// ── rate limiting ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rate_limit_headers_on_every_response() {
    let t = test_app_with(10, 10.0, 1024 * 1024);
    let creds = create_project(&t.app, "acme").await;

    let reply = send(&t.app, authed(get("/v1/resources/rate-limit"), &creds)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["x-ratelimit-limit"], "10");
    assert_eq!(reply.headers["x-ratelimit-remaining"], "9");
    assert!(reply.headers.contains_key("x-ratelimit-reset"));

    let reply = send(&t.app, get("/v1/health")).await;
    assert!(reply.headers.contains_key("x-ratelimit-limit"));

    let reply = send(&t.app, get("/v1/resources/pool")).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert!(reply.headers.contains_key("x-ratelimit-remaining"));
}

#[tokio::test]
async fn test_unknown_routes_spend_anonymous_tokens() {
    let t = test_app_with(2, 0.01, 1024 * 1024);

    let reply = send(&t.app, get("/v1/nothing-here")).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.headers["x-ratelimit-limit"], "2");
    assert_eq!(reply.headers["x-ratelimit-remaining"], "1");
    assert!(reply.headers.contains_key("x-ratelimit-reset"));

    send(&t.app, get("/robots.txt")).await;
    let reply = send(&t.app, get("/v1/nothing-here")).await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert_envelope(&reply, "TooManyRequests");
}

#[tokio::test]
async fn test_exhausted_bucket_returns_429_with_retry_after() {
    let t = test_app_with(2, 0.01, 1024 * 1024);
    let creds = create_project(&t.app, "acme").await;

    for _ in 0..2 {
        let reply = send(&t.app, authed(get("/v1/resources/pool"), &creds)).await;
        assert_eq!(reply.status, StatusCode::OK);
    }
    let reply = send(&t.app, authed(get("/v1/resources/pool"), &creds)).await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert_envelope(&reply, "TooManyRequests");
    let retry_after = reply.body["retry_after"].as_u64().unwrap();
    assert!(retry_after >= 1);
    assert_eq!(
        reply.headers[header::RETRY_AFTER],
        retry_after.to_string().as_str()
    );
    assert_eq!(reply.headers["x-ratelimit-remaining"], "0");
}

#[tokio::test]
async fn test_tenants_have_independent_buckets() {
    let t = test_app_with(3, 0.01, 1024 * 1024);
    let a = create_project(&t.app, "acme").await;
    let b = create_project(&t.app, "globex").await;

    for _ in 0..3 {
        send(&t.app, authed(get("/v1/resources/pool"), &a)).await;
    }
    let reply = send(&t.app, authed(get("/v1/resources/pool"), &a)).await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);

    let reply = send(&t.app, authed(get("/v1/resources/pool"), &b)).await;
    assert_eq!(reply.status, StatusCode::OK);
}

#[tokio::test]
async fn test_failed_auth_drains_anonymous_bucket() {
    let t = test_app_with(2, 0.01, 1024 * 1024);
    // project creation spends one anonymous token
    create_project(&t.app, "acme").await;

    let reply = send(&t.app, get("/v1/resources/pool")).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let reply = send(&t.app, get("/v1/resources/pool")).await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(reply.body["retry_after"].as_u64().unwrap() >= 1);
}

// ── resources ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pool_and_rate_limit_resources() {
    let t = test_app_with(10, 2.0, 1024 * 1024);
    let creds = create_project(&t.app, "acme").await;

    let reply = send(&t.app, authed(get("/v1/resources/pool"), &creds)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["capacity"], 2);
    assert_eq!(reply.body["in_use"], 0);
    assert_eq!(reply.body["orphaned_total"], 0);
    assert_eq!(reply.body["leases"], json!([]));

    let reply = send(&t.app, authed(get("/v1/resources/rate-limit"), &creds)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["capacity"], 10);
    assert_eq!(reply.body["refill_rate"], 2.0);
    let available = reply.body["available_tokens"].as_f64().unwrap();
    assert!((8.0..=10.0).contains(&available), "{available}");
    assert!(reply.body["full_in_s"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_health_is_public() {
    let t = test_app();
    let reply = send(&t.app, get("/v1/health")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["status"], "ok");
    assert!(reply.body["version"].is_string());
    assert!(reply.body["uptime_s"].is_u64());
}

// ── request ids ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_request_id_is_echoed() {
    let t = test_app();

    let req = Request::builder()
        .uri("/v1/reviews/abc")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let reply = send(&t.app, req).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.headers["x-request-id"], "req-123");
    assert_eq!(reply.body["request_id"], "req-123");

    let reply = send(&t.app, get("/v1/health")).await;
    let minted = reply.headers["x-request-id"].to_str().unwrap();
    assert!(uuid::Uuid::parse_str(minted).is_ok());
}

// ── bypass ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bypass_requires_reason_and_operator() {
    let t = test_app();
    let creds = create_project(&t.app, "acme").await;
    let reply = submit(&t.app, &creds, &review_body()).await;
    let job_id = reply.body["job_id"].as_str().unwrap().to_string();
    wait_terminal(&t, &job_id).await;
    let uri = format!("/v1/reviews/{job_id}/bypass");
    let bypass = |body: Value| {
        as_operator(
            authed(json_request(Method::POST, &uri, &body), &creds),
            OPERATOR_TOKEN,
        )
    };

    let reply = send(&t.app, bypass(json!({ "reason": "", "operator_id": "ops" }))).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);

    let reply = send(&t.app, bypass(json!({ "reason": "hotfix", "operator_id": " " }))).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);

    let reply = send(
        &t.app,
        bypass(json!({ "reason": "prod outage hotfix", "operator_id": "oncall-alice" })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
    assert_eq!(reply.body["operator_id"], "oncall-alice");
    assert_eq!(reply.body["cs_at_bypass"], 0.0);

    let reply = send(
        &t.app,
        authed(get(&format!("/v1/reviews/{job_id}/audit")), &creds),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    let bypasses = reply.body["bypasses"].as_array().unwrap();
    assert_eq!(bypasses.len(), 1);
    assert_eq!(bypasses[0]["reason"], "prod outage hotfix");
    assert_eq!(bypasses[0]["active"], true);

    let reply = send(&t.app, authed(get(&format!("/v1/reviews/{job_id}")), &creds)).await;
    assert_eq!(reply.body["bypassed"], true);
}

#[tokio::test]
async fn test_bypass_needs_operator_token() {
    let t = test_app();
    let creds = create_project(&t.app, "acme").await;
    let reply = submit(&t.app, &creds, &review_body()).await;
    let job_id = reply.body["job_id"].as_str().unwrap().to_string();
    wait_terminal(&t, &job_id).await;
    let uri = format!("/v1/reviews/{job_id}/bypass");
    let body = json!({ "reason": "prod outage hotfix", "operator_id": "oncall-alice" });

    // Tenant credentials alone are not enough.
    let reply = send(&t.app, authed(json_request(Method::POST, &uri, &body), &creds)).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_envelope(&reply, "Forbidden");

    let reply = send(
        &t.app,
        as_operator(
            authed(json_request(Method::POST, &uri, &body), &creds),
            "guessed",
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);

    // A server without an operator token refuses every bypass.
    let locked = router(Arc::new(AppState {
        db: Arc::clone(&t.state.db),
        orchestrator: Arc::clone(&t.state.orchestrator),
        limiter: Arc::clone(&t.state.limiter),
        max_body_bytes: t.state.max_body_bytes,
        operator_token_hash: None,
        start_time: Instant::now(),
    }));
    let reply = send(
        &locked,
        as_operator(
            authed(json_request(Method::POST, &uri, &body), &creds),
            OPERATOR_TOKEN,
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);

    assert!(t.state.db.list_bypasses(&job_id).unwrap().is_empty());
    let reply = send(&t.app, authed(get(&format!("/v1/reviews/{job_id}")), &creds)).await;
    assert_eq!(reply.body["bypassed"], false);
}

#[tokio::test]
async fn test_merge_status_missing_for_review_only_job() {
    let t = test_app();
    let creds = create_project(&t.app, "acme").await;
    let reply = submit(&t.app, &creds, &review_body()).await;
    let job_id = reply.body["job_id"].as_str().unwrap().to_string();

    let reply = send(
        &t.app,
        authed(get(&format!("/v1/reviews/{job_id}/merge")), &creds),
    )
    .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_envelope(&reply, "NotFound");
}
