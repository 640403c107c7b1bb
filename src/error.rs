// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error type for the job controllers and its HTTP mapping.
//!
//! Every failure a caller can observe synchronously falls into one of four
//! buckets:
//! - validation problems with the request (400)
//! - unknown job ids (404)
//! - the download daemon being unreachable or not installed (500)
//! - RPC or other server-side failures (500)
//!
//! Transfer failures never show up here; they are reported through status
//! polling. Server-fault responses carry a reference code that is logged
//! together with the full detail so a report can be matched to the logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"Bearer [a-zA-Z0-9._~+/-]+=*").expect("Bearer token regex"), "Bearer [REDACTED]"),
        (Regex::new(r"token:[^\s,\]\x22]+").expect("RPC secret regex"), "token:[REDACTED]"),
        (Regex::new(r"hf_[a-zA-Z0-9]{20,}").expect("Hub token regex"), "[HUB_TOKEN_REDACTED]"),
    ]
});

/// Strip bearer tokens and RPC secrets from text before it reaches a log line.
pub fn redact_secrets(text: &str) -> String {
    let mut out = text.to_string();
    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

/// Synchronous failure of a start, status or stop operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Missing or unusable input; nothing was submitted to a backend.
    #[error("{0}")]
    InvalidRequest(String),
    /// No job with that id in the addressed registry.
    #[error("{0}")]
    NotFound(String),
    /// The download daemon could not be reached, started, or found.
    #[error("{0}")]
    BackendUnavailable(String),
    /// The daemon answered with an error or an unusable reply.
    #[error("{0}")]
    Rpc(String),
    /// Anything else that went wrong on our side.
    #[error("{0}")]
    Internal(String),
}

impl JobError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn unknown_id() -> Self {
        Self::NotFound("unknown gid".to_string())
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            JobError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::BackendUnavailable(_) | JobError::Rpc(_) | JobError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// JSON body sent for every failed request.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        let reference = if status.is_server_error() {
            let reference = generate_reference_code();
            tracing::error!(
                reference = %reference,
                status = status.as_u16(),
                detail = %redact_secrets(&message),
                "Request failed"
            );
            Some(reference)
        } else {
            tracing::debug!(status = status.as_u16(), detail = %message, "Request rejected");
            None
        };

        let body = ErrorResponse {
            ok: false,
            error: message,
            reference,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_code_format() {
        let code = generate_reference_code();
        assert!(code.starts_with("ERR-"));
        let parts: Vec<&str> = code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(JobError::invalid("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(JobError::unknown_id().status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            JobError::BackendUnavailable("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(JobError::Rpc("bad".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_display_is_plain_message() {
        assert_eq!(JobError::invalid("URL is required.").to_string(), "URL is required.");
        assert_eq!(JobError::unknown_id().to_string(), "unknown gid");
    }

    #[test]
    fn test_redact_bearer_and_rpc_secret() {
        let text = r#"header Authorization: Bearer abc.def-123 params ["token:s3cret", "x"]"#;
        let redacted = redact_secrets(text);
        assert!(!redacted.contains("abc.def-123"));
        assert!(!redacted.contains("s3cret"));
        assert!(redacted.contains("Bearer [REDACTED]"));
        assert!(redacted.contains("token:[REDACTED]"));
    }

    async fn body_of(response: Response) -> serde_json::Value {
        use http_body_util::BodyExt;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_client_error_has_no_reference() {
        let response = JobError::invalid("nope").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_of(response).await,
            serde_json::json!({"ok": false, "error": "nope"})
        );
    }

    #[tokio::test]
    async fn test_server_error_carries_reference() {
        let response = JobError::Rpc("aria2c RPC error: boom".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(response).await;
        assert_eq!(body["error"], "aria2c RPC error: boom");
        assert!(body["reference"].as_str().unwrap().starts_with("ERR-"));
    }
}
