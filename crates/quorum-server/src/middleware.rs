use std::sync::Arc;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use quorum_core::ratelimit::{RateLimitDecision, ANONYMOUS_KEY};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{error::ApiError, AppState};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const OPERATOR_HEADER: &str = "x-operator-token";

// ── Request ids ───────────────────────────────────────────────────────────

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Id of the request being handled on this task, if any.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

fn usable_request_id(v: &HeaderValue) -> Option<String> {
    let s = v.to_str().ok()?.trim();
    let ok = !s.is_empty()
        && s.len() <= 128
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    ok.then(|| s.to_string())
}

/// Adopts a well-formed incoming `X-Request-Id` or mints a uuid, and echoes it back.
pub async fn request_id(req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(usable_request_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut response = REQUEST_ID.scope(id.clone(), next.run(req)).await;
    if let Ok(v) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), v);
    }
    response
}

// ── Authentication ────────────────────────────────────────────────────────

/// Tenant id of an authenticated caller, set by [`guard`].
#[derive(Debug, Clone)]
pub struct AuthedTenant(pub String);

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let tenant_id = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing X-Tenant-Id header".into()))?;
    let secret = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;

    let invalid = || ApiError::Unauthorized("invalid tenant credentials".into());
    let tenant = state.db.get_tenant(tenant_id)?.ok_or_else(invalid)?;
    if !constant_time_eq(hash_secret(secret).as_bytes(), tenant.secret_hash.as_bytes()) {
        return Err(invalid());
    }
    Ok(tenant.id)
}

/// Operator-only actions need `X-Operator-Token` on top of tenant auth.
/// Refused outright when no operator token is configured.
pub fn authorize_operator(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.operator_token_hash.as_deref() else {
        return Err(ApiError::Forbidden(
            "operator actions are disabled on this server".into(),
        ));
    };
    let presented = headers
        .get(OPERATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Forbidden("missing X-Operator-Token header".into()))?;
    if !constant_time_eq(hash_secret(presented).as_bytes(), expected.as_bytes()) {
        warn!("bypass attempted with an invalid operator token");
        return Err(ApiError::Forbidden("invalid operator token".into()));
    }
    Ok(())
}

// ── Admission ─────────────────────────────────────────────────────────────

/// Protected routes: authenticate, then charge the tenant's bucket.
/// Failed authentication is charged to the anonymous bucket and answers 429
/// once that bucket is empty.
pub async fn guard(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let tenant_id = match authenticate(&state, req.headers()) {
        Ok(id) => id,
        Err(e) => {
            let decision = state.limiter.allow(ANONYMOUS_KEY);
            let response = if decision.admitted {
                e.into_response()
            } else {
                ApiError::TooManyRequests {
                    retry_after: decision.retry_after.as_secs(),
                }
                .into_response()
            };
            return with_limit_headers(response, &decision);
        }
    };
    req.extensions_mut().insert(AuthedTenant(tenant_id.clone()));
    admit(&state, &tenant_id, req, next).await
}

/// Public routes share the anonymous bucket.
pub async fn public_limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    admit(&state, ANONYMOUS_KEY, req, next).await
}

async fn admit(state: &AppState, key: &str, req: Request, next: Next) -> Response {
    let decision = state.limiter.allow(key);
    let response = if decision.admitted {
        next.run(req).await
    } else {
        let retry_after = decision.retry_after.as_secs();
        warn!(key, retry_after, path = %req.uri().path(), "rate limit exceeded");
        ApiError::TooManyRequests { retry_after }.into_response()
    };
    with_limit_headers(response, &decision)
}

fn with_limit_headers(mut response: Response, d: &RateLimitDecision) -> Response {
    let values = [
        ("x-ratelimit-limit", d.capacity as u64),
        ("x-ratelimit-remaining", d.remaining.max(0.0).floor() as u64),
        ("x-ratelimit-reset", d.reset_after.as_secs_f64().ceil() as u64),
    ];
    for (name, value) in values {
        if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), v);
        }
    }
    response
}

// ── JSON bodies ───────────────────────────────────────────────────────────

/// `Json` whose rejections use the error envelope: 413 over the body
/// limit, 422 for anything else unparseable.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(v)) => Ok(Self(v)),
            Err(rejection) => Err(map_json_rejection(rejection)),
        }
    }
}

fn map_json_rejection(rejection: JsonRejection) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("request body exceeds the size limit".into())
    } else {
        ApiError::Validation(rejection.body_text())
    }
}
