//! Authorization and challenge endpoints. A challenge POST flips the
//! challenge to `processing` and hands it to the background HTTP-01
//! validator; polling observes the persisted state transitions.

use axum::{
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde_json::json;
use std::sync::Arc;

use super::account::require_account;
use super::gate::AcmeContext;
use super::problem::{Problem, ERROR_NS};
use super::validator::Http01Validator;
use super::{absolute_url, acme_response};
use crate::db::{Authz, AuthzStatus, Challenge, ChallengeStatus, ErrorRecord, Order};
use crate::AcmeState;

async fn load_authz(state: &AcmeState, authz_id: &str) -> Result<Authz, Problem> {
    Authz::get_by_id(&state.db, authz_id)
        .await?
        .ok_or_else(|| Problem::malformed("Invalid authz ID."))
}

/// Relations are ids; the owning account is reached through the order.
async fn owning_order(state: &AcmeState, authz: &Authz) -> Result<Order, Problem> {
    Order::get_by_id(&state.db, &authz.order_id)
        .await?
        .ok_or_else(|| Problem::server_internal("An internal server error occurred"))
}

/// Transition an authorization past its expiry, persisting the change.
async fn expire_authz_if_needed(state: &AcmeState, authz: &mut Authz) -> Result<bool, Problem> {
    if authz.status == AuthzStatus::Expired {
        return Ok(true);
    }
    if authz.is_expired() {
        Authz::set_status(&state.db, &authz.id, AuthzStatus::Expired).await?;
        authz.status = AuthzStatus::Expired;
        return Ok(true);
    }
    Ok(false)
}

pub async fn authz(
    State(state): State<Arc<AcmeState>>,
    headers: HeaderMap,
    Path(authz_id): Path<String>,
    Extension(ctx): Extension<AcmeContext>,
) -> Result<Response, Problem> {
    let account = require_account(&ctx)?;
    let mut authz = load_authz(&state, &authz_id).await?;
    let mut order = owning_order(&state, &authz).await?;
    if order.account_id != account.id {
        return Err(Problem::unauthorized(
            "Account is not authorized to access this authz.",
        ));
    }

    expire_authz_if_needed(&state, &mut authz).await?;
    if order.status != crate::db::OrderStatus::Expired && order.is_expired() {
        Order::set_status(&state.db, &order.id, crate::db::OrderStatus::Expired).await?;
        order.status = crate::db::OrderStatus::Expired;
    }

    let challenges = Challenge::list_by_authz(&state.db, &authz.id).await?;
    let challenge_bodies: Vec<serde_json::Value> = challenges
        .iter()
        .map(|challenge| {
            json!({
                "type": challenge.challenge_type,
                "token": challenge.token(),
                "status": challenge.status,
                "url": absolute_url(&headers, &format!("/challenge/{}", challenge.id)),
            })
        })
        .collect();

    let mut body = json!({
        "status": authz.status,
        "expires": authz.expires,
        "identifier": {
            "type": authz.identifier_type,
            "value": authz.identifier_value,
        },
        "challenges": challenge_bodies,
    });

    // An attached error record turns the poll into a 400
    let mut status_code = StatusCode::OK;
    if let Some(error_id) = &authz.error_id {
        if let Some(error) = ErrorRecord::get_by_id(&state.db, error_id).await? {
            status_code = StatusCode::BAD_REQUEST;
            body["error"] = json!({
                "type": format!("{}{}", ERROR_NS, error.error_type.as_deref().unwrap_or("serverInternal")),
                "title": error.title,
                "detail": error.detail,
            });
        }
    }

    Ok(acme_response(
        &state,
        status_code,
        body,
        Some(&account.id),
        None,
        true,
    ))
}

pub async fn challenge(
    State(state): State<Arc<AcmeState>>,
    headers: HeaderMap,
    Path(challenge_id): Path<String>,
    Extension(ctx): Extension<AcmeContext>,
) -> Result<Response, Problem> {
    let account = require_account(&ctx)?;
    let Some(mut challenge) = Challenge::get_by_id(&state.db, &challenge_id).await? else {
        return Err(Problem::malformed("Invalid challenge ID."));
    };
    let mut authz = load_authz(&state, &challenge.authz_id).await?;
    let order = owning_order(&state, &authz).await?;
    if order.account_id != account.id {
        return Err(Problem::unauthorized(
            "Account is not authorized to access this challenge.",
        ));
    }

    let authz_expired = expire_authz_if_needed(&state, &mut authz).await?;
    if authz_expired && challenge.status != ChallengeStatus::Invalid {
        Challenge::set_status(&state.db, &challenge.id, ChallengeStatus::Invalid).await?;
        challenge.status = ChallengeStatus::Invalid;
    }

    if !authz_expired && challenge.status != ChallengeStatus::Valid {
        // Persist `processing` before the validator is scheduled so
        // polls never observe a stale pending state.
        Challenge::set_status(&state.db, &challenge.id, ChallengeStatus::Processing).await?;
        challenge.status = ChallengeStatus::Processing;

        Http01Validator::new(&state, challenge.clone(), authz.clone()).spawn();
    }

    Ok(acme_response(
        &state,
        StatusCode::OK,
        json!({
            "status": challenge.status,
            "type": challenge.challenge_type,
            "token": challenge.token(),
            "url": absolute_url(&headers, &format!("/challenge/{}", challenge.id)),
        }),
        Some(&account.id),
        None,
        true,
    ))
}
