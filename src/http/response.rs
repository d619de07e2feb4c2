//! JSON responses produced by the dispatch core.
//!
//! # Responsibilities
//! - Policy responses (405, 429, 400) with a `{message}` body
//! - Handler failures as 500 with `{message, error: {kind, message}}`
//! - Rate-limit headers on every limited client's response
//!
//! # Design Decisions
//! - Only kind and message of a failure reach the client, never a backtrace
//! - Rate-limit headers never overwrite values a handler already set

use std::time::SystemTime;

use axum::{
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::routing::endpoint::HandlerError;
use crate::security::rate_limit::RateLimitStatus;

pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// A JSON body of the form `{"message": ...}`.
pub fn json_message(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "message": message.into() }))).into_response()
}

/// A 500 describing a failed handler.
pub fn internal_error(error: &HandlerError) -> Response {
    let body = json!({
        "message": "An unexpected error occurred while handling this request",
        "error": {
            "kind": error.kind(),
            "message": error.message(),
        }
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/// A 429 with `Retry-After` and the rate-limit headers.
pub fn rate_limited(status: &RateLimitStatus, now: SystemTime) -> Response {
    let retry_after = status.retry_after_secs(now);
    let mut response = json_message(
        StatusCode::TOO_MANY_REQUESTS,
        format!("You are being rate limited, retry in {} seconds", retry_after),
    );

    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    apply_rate_limit_headers(headers, status);
    response
}

/// Add `X-RateLimit-*` headers unless they are already present.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    headers
        .entry(X_RATELIMIT_REMAINING)
        .or_insert_with(|| HeaderValue::from(status.remaining));
    headers
        .entry(X_RATELIMIT_LIMIT)
        .or_insert_with(|| HeaderValue::from(status.limit));
    headers
        .entry(X_RATELIMIT_RESET)
        .or_insert_with(|| HeaderValue::from(status.reset_unix_secs()));
}
