use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri},
    response::Json,
    Extension,
};
use chrono::Utc;
use quorum_core::types::{ReviewJob, Tenant};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    error::ApiError,
    middleware::{authorize_operator, hash_secret, ApiJson, AuthedTenant},
    AppState,
};

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectBody {
    name: String,
    id: Option<String>,
}

#[derive(Deserialize)]
pub struct SubmitReviewBody {
    diff: String,
    files: Vec<String>,
    branch: Option<String>,
}

#[derive(Deserialize)]
pub struct BypassBody {
    reason: String,
    operator_id: String,
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

fn valid_tenant_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn new_secret() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Load a job the caller is allowed to see: 404 if unknown, 403 if another
/// tenant owns it.
fn owned_job(state: &AppState, tenant: &AuthedTenant, job_id: &str) -> Result<ReviewJob, ApiError> {
    let job = state
        .db
        .get_job(job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("review job {job_id} not found")))?;
    if job.tenant_id != tenant.0 {
        return Err(ApiError::Forbidden(format!(
            "review job {job_id} belongs to another project"
        )));
    }
    Ok(job)
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

pub(crate) async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no route for {}", uri.path()))
}

// Projects

pub(crate) async fn create_project(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<CreateProjectBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("name must not be empty".into()));
    }
    let id = match body.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => slugify(name),
    };
    if !valid_tenant_id(&id) {
        return Err(ApiError::Validation(format!(
            "project id {id:?} must be 1-64 characters of [A-Za-z0-9_-]"
        )));
    }

    let secret = new_secret();
    let tenant = Tenant {
        id: id.clone(),
        name: name.to_string(),
        secret_hash: hash_secret(&secret),
        created_at: Utc::now(),
    };
    if !state.db.insert_tenant(&tenant)? {
        return Err(ApiError::Conflict(format!("project {id} already exists")));
    }
    info!(tenant_id = %id, "project created");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": tenant.id,
            "name": tenant.name,
            "secret": secret,
            "created_at": tenant.created_at,
        })),
    ))
}

pub(crate) async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let tenants = state.db.list_tenants()?;
    Ok(Json(json!(tenants)))
}

// Reviews

pub(crate) async fn submit_review(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<AuthedTenant>,
    ApiJson(body): ApiJson<SubmitReviewBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job = state
        .orchestrator
        .submit(&tenant.0, &body.diff, body.files, body.branch)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job.job_id,
            "status": job.status,
            "submitted_at": job.submitted_at,
        })),
    ))
}

pub(crate) async fn get_review(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<AuthedTenant>,
    Path(id): Path<String>,
) -> Result<Json<ReviewJob>, ApiError> {
    owned_job(&state, &tenant, &id).map(Json)
}

pub(crate) async fn bypass_review(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<AuthedTenant>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<BypassBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    authorize_operator(&state, &headers)?;
    let job = owned_job(&state, &tenant, &id)?;
    let record = state
        .orchestrator
        .bypass(&job, &body.operator_id, &body.reason)?;
    Ok((StatusCode::CREATED, Json(json!(record))))
}

pub(crate) async fn review_audit(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<AuthedTenant>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job = owned_job(&state, &tenant, &id)?;
    let now = Utc::now();
    let records: Vec<Value> = state
        .db
        .list_bypasses(&job.job_id)?
        .into_iter()
        .map(|r| {
            let active = r.is_active_at(now);
            let mut v = json!(r);
            v["active"] = json!(active);
            v
        })
        .collect();
    Ok(Json(json!({ "job_id": job.job_id, "bypasses": records })))
}

pub(crate) async fn review_merge(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<AuthedTenant>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job = owned_job(&state, &tenant, &id)?;
    let attempt = state
        .db
        .get_merge_attempt(&job.job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("no merge attempt for review job {id}")))?;
    Ok(Json(json!(attempt)))
}

// Resources

pub(crate) async fn pool_status(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<AuthedTenant>,
) -> Json<Value> {
    let pool = &state.orchestrator.pool;
    let stats = pool.stats();
    let leases: Vec<_> = pool
        .leases()
        .into_iter()
        .filter(|l| l.tenant_id == tenant.0)
        .collect();
    Json(json!({
        "capacity": stats.capacity,
        "in_use": stats.in_use,
        "preserved": stats.preserved,
        "available": stats.available,
        "orphaned_total": stats.orphaned_total,
        "leases": leases,
    }))
}

pub(crate) async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<AuthedTenant>,
) -> Json<Value> {
    Json(json!(state.limiter.snapshot(&tenant.0)))
}
