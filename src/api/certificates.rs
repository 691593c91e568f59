//! CA API endpoints: certificate status, creation and retrieval.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

use crate::ca::service::{CertificateService, CertificateStatus};
use crate::ca::CaError;
use crate::db::{Certificate, CertificateResponse};
use crate::CaState;

#[derive(Debug, Deserialize)]
pub struct CreateCertificatesRequest {
    pub certificate_names: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedCertificatesResponse {
    pub certificates: Vec<CertificateResponse>,
}

#[derive(Debug, Serialize)]
pub struct CertificateStatusesResponse {
    pub statuses: Vec<CertificateStatus>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub err: String,
    pub detail: String,
}

/// CA engine errors rendered as API responses: configuration mistakes
/// are the client's fault, everything else is a server failure.
pub struct CaApiError(CaError);

impl From<CaError> for CaApiError {
    fn from(err: CaError) -> Self {
        Self(err)
    }
}

impl CaApiError {
    fn kind(&self) -> &'static str {
        match self.0 {
            CaError::FileExists(_) => "FileExists",
            CaError::Io(_) => "Io",
            CaError::GenPkey(_) => "GenPkey",
            CaError::GenCsr(_) => "GenCsr",
            CaError::GenCert(_) => "GenCert",
            CaError::GenCrl(_) => "GenCrl",
            CaError::CertConfigNotFound(_) => "CertConfigNotFound",
            CaError::UnknownModule(_) => "UnknownModule",
            CaError::Module(_) => "Module",
            CaError::Database(_) => "Database",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self.0 {
            CaError::CertConfigNotFound(_) | CaError::UnknownModule(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CaApiError {
    fn into_response(self) -> Response {
        error!("CA API error: {}", self.0);
        let body = ErrorResponse {
            err: self.kind().to_string(),
            detail: self.0.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

pub async fn cert_status(
    State(state): State<Arc<CaState>>,
) -> Result<Json<CertificateStatusesResponse>, CaApiError> {
    let service = CertificateService::new(state.config.clone(), state.db.clone());
    let statuses = service.status().await?;
    Ok(Json(CertificateStatusesResponse { statuses }))
}

pub async fn create_certificates(
    State(state): State<Arc<CaState>>,
    Json(request): Json<CreateCertificatesRequest>,
) -> Result<Response, CaApiError> {
    debug!(
        "Received request to create certificates: {}",
        request.certificate_names.join(" | ")
    );

    if request.certificate_names.is_empty() {
        let body = ErrorResponse {
            err: "BadRequest".to_string(),
            detail: "No certificates requested to create.".to_string(),
        };
        return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
    }

    let service = CertificateService::new(state.config.clone(), state.db.clone());
    let certificates = service
        .create_certificates(&request.certificate_names)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedCertificatesResponse { certificates }),
    )
        .into_response())
}

pub async fn get_certificate(
    State(state): State<Arc<CaState>>,
    Path(name): Path<String>,
) -> Result<Response, CaApiError> {
    match Certificate::get_by_name(&state.db, &name).await.map_err(CaError::from)? {
        Some(cert) => Ok(Json(CertificateResponse::from(cert)).into_response()),
        None => {
            let body = ErrorResponse {
                err: "NotFound".to_string(),
                detail: "Certificate not found.".to_string(),
            };
            Ok((StatusCode::NOT_FOUND, Json(body)).into_response())
        }
    }
}
