//! ACME problem documents (RFC 7807 with the ACME error namespace).
//!
//! Handlers return `Result<Response, Problem>`; the router layers make
//! sure every rendered problem carries a fresh `Replay-Nonce` and a
//! `Retry-After` header.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

pub const ERROR_NS: &str = "urn:ietf:params:acme:error:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    /// Bare error tag, namespaced at render time.
    pub error_type: String,
    pub title: String,
    pub detail: Option<String>,
    pub subproblems: Vec<Problem>,
    pub status: StatusCode,
}

impl Problem {
    pub fn new(error_type: &str, title: impl Into<String>) -> Self {
        Self {
            error_type: error_type.to_string(),
            title: title.into(),
            detail: None,
            subproblems: Vec::new(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_subproblems(mut self, subproblems: Vec<Problem>) -> Self {
        self.subproblems = subproblems;
        self
    }

    pub fn malformed(title: impl Into<String>) -> Self {
        Self::new("malformed", title)
    }

    pub fn bad_nonce() -> Self {
        Self::new("badNonce", "Invalid/missing replay-nonce")
    }

    pub fn unauthorized(title: impl Into<String>) -> Self {
        Self::new("unauthorized", title).with_status(StatusCode::FORBIDDEN)
    }

    pub fn account_does_not_exist(title: impl Into<String>) -> Self {
        Self::new("accountDoesNotExist", title)
    }

    pub fn server_internal(title: impl Into<String>) -> Self {
        Self::new("serverInternal", title).with_status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "type": format!("{}{}", ERROR_NS, self.error_type),
            "title": self.title,
        });
        if let Some(detail) = &self.detail {
            body["detail"] = json!(detail);
        }
        if !self.subproblems.is_empty() {
            body["subproblems"] = Value::Array(
                self.subproblems.iter().map(Problem::to_json).collect(),
            );
        }
        body
    }
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.title)
    }
}

impl std::error::Error for Problem {}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.to_json())).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<sqlx::Error> for Problem {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {}", err);
        Self::server_internal("An internal server error occurred")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_type() {
        let problem = Problem::new("badSignatureAlgorithm", "Invalid JWK signature algorithm.");
        assert_eq!(
            problem.to_json()["type"],
            "urn:ietf:params:acme:error:badSignatureAlgorithm"
        );
    }

    #[test]
    fn test_detail_and_subproblems_render() {
        let problem = Problem::malformed("One or more identifiers are invalid.")
            .with_subproblems(vec![
                Problem::new("rejectedIdentifier", "Invalid identifier value")
                    .with_detail("identifier values can not be wildcard"),
            ]);
        let body = problem.to_json();
        assert!(body.get("detail").is_none());
        assert_eq!(body["subproblems"].as_array().unwrap().len(), 1);
        assert_eq!(
            body["subproblems"][0]["detail"],
            "identifier values can not be wildcard"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Problem::malformed("x").status, StatusCode::BAD_REQUEST);
        assert_eq!(Problem::unauthorized("x").status, StatusCode::FORBIDDEN);
        assert_eq!(
            Problem::server_internal("x").status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_problem_response_content_type() {
        let response = Problem::bad_nonce().into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
