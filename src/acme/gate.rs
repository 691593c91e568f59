//! The per-request gate in front of every authenticated ACME endpoint:
//! parse and verify the JWS envelope, enforce the per-path jwk/kid
//! policy, resolve the account and consume the replay nonce. Handlers
//! receive the result as an [`AcmeContext`] request extension.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use super::jws::{Jwk, ParsedEnvelope};
use super::problem::Problem;
use super::problem_response;
use crate::db::{Account, AccountStatus, DbPool, JwkRecord};
use crate::AcmeState;

/// Paths whose requests must self-identify with a full `jwk`.
const JWK_PATHS: &[&str] = &["/new-account", "/revoke-cert"];
/// Paths whose requests must reference an existing account by `kid`.
const KID_PATHS: &[&str] = &["/account/", "/new-order", "/authz"];

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Verified request context for the downstream handler.
#[derive(Debug, Clone)]
pub struct AcmeContext {
    pub envelope: ParsedEnvelope,
    pub account: Option<Account>,
}

pub async fn acme_gate(
    State(state): State<Arc<AcmeState>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let problem = Problem::malformed("Failed to read request body").with_detail(e.to_string());
            return problem_response(&state, problem, None);
        }
    };

    let path = parts.uri.path().to_string();
    let (envelope, account) = match resolve(&state, &path, &bytes).await {
        Ok(resolved) => resolved,
        Err(problem) => return problem_response(&state, problem, None),
    };

    // Account resolution happens-before the nonce pop, which
    // happens-before any business logic.
    let account_id = account.as_ref().map(|a| a.id.clone());
    let nonce_popped = envelope
        .header
        .nonce
        .as_deref()
        .map(|nonce| state.nonces.pop_nonce(nonce, account_id.as_deref()))
        .unwrap_or(false);
    if !nonce_popped {
        return problem_response(&state, Problem::bad_nonce(), account_id.as_deref());
    }

    parts.extensions.insert(AcmeContext { envelope, account });
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

async fn resolve(
    state: &AcmeState,
    path: &str,
    body: &[u8],
) -> Result<(ParsedEnvelope, Option<Account>), Problem> {
    let envelope = ParsedEnvelope::parse(body)?;

    if JWK_PATHS.iter().any(|p| path.starts_with(p)) && envelope.header.jwk.is_none() {
        return Err(Problem::malformed(format!(
            "{path} requests must contain a jwk key."
        )));
    }
    if KID_PATHS.iter().any(|p| path.starts_with(p)) && envelope.header.kid.is_none() {
        return Err(Problem::malformed(format!(
            "{path} requests must contain a kid."
        )));
    }

    let account = if let Some(kid) = &envelope.header.kid {
        let account = Account::get_by_kid(&state.db, kid).await?.ok_or_else(|| {
            Problem::account_does_not_exist(format!("Account {kid} does not exist."))
                .with_status(StatusCode::FORBIDDEN)
        })?;
        envelope.verify_with(&stored_jwk(&state.db, &account).await?)?;
        Some(account)
    } else if let Some(jwk) = &envelope.header.jwk {
        // A known key verifies against its stored form; an unknown key
        // was already verified against the submitted one at parse time.
        let account = find_account_by_jwk(&state.db, jwk).await?;
        if let Some(account) = &account {
            envelope.verify_with(&stored_jwk(&state.db, account).await?)?;
        }
        account
    } else {
        return Err(Problem::malformed("Must provide either kid or jwk."));
    };

    if let Some(account) = &account {
        if account.status != AccountStatus::Valid {
            return Err(Problem::unauthorized("Account is not valid."));
        }
    }

    Ok((envelope, account))
}

async fn stored_jwk(db: &DbPool, account: &Account) -> Result<Jwk, Problem> {
    let record = JwkRecord::get_by_id(db, &account.jwk_id)
        .await?
        .ok_or_else(|| Problem::server_internal("An internal server error occurred"))?;
    Ok(Jwk::from(&record))
}

/// Accounts are unique per JWK; the identity tuple depends on the key
/// type.
pub async fn find_account_by_jwk(db: &DbPool, jwk: &Jwk) -> Result<Option<Account>, Problem> {
    let record = match jwk.kty.as_str() {
        "RSA" => match (&jwk.n, &jwk.e) {
            (Some(n), Some(e)) => JwkRecord::find_rsa(db, n, e).await?,
            _ => None,
        },
        "EC" => match (&jwk.crv, &jwk.x, &jwk.y) {
            (Some(crv), Some(x), Some(y)) => JwkRecord::find_ec(db, crv, x, y).await?,
            _ => None,
        },
        "oct" => match &jwk.k {
            Some(k) => JwkRecord::find_oct(db, k).await?,
            _ => None,
        },
        _ => None,
    };

    match record {
        Some(record) => Ok(Account::get_by_jwk_id(db, &record.id).await?),
        None => Ok(None),
    }
}
