//! Account endpoints: registration (`/new-account`) and updates.

use axum::{
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::gate::AcmeContext;
use super::jws::Jwk;
use super::problem::Problem;
use super::{absolute_url, acme_response, new_account_kid};
use crate::db::{Account, AccountStatus, JwkRecord};
use crate::AcmeState;

/// The gate resolves accounts; handlers on kid paths can rely on one
/// being present.
pub(super) fn require_account(ctx: &AcmeContext) -> Result<&Account, Problem> {
    ctx.account
        .as_ref()
        .ok_or_else(|| Problem::unauthorized("Account is not valid."))
}

fn account_body(account: &Account) -> serde_json::Value {
    let mut body = json!({ "status": account.status });
    if let Some(contact) = &account.contact {
        body["contact"] = json!(contact.split(',').collect::<Vec<_>>());
    }
    body
}

pub async fn new_account(
    State(state): State<Arc<AcmeState>>,
    headers: HeaderMap,
    Extension(ctx): Extension<AcmeContext>,
) -> Result<Response, Problem> {
    let payload = ctx.envelope.payload.clone().unwrap_or_default();

    if ctx.account.is_none() && payload.only_return_existing {
        return Err(Problem::account_does_not_exist(
            "Provided JWK is not linked to an account.",
        ));
    }

    let (account, status_code) = match ctx.account {
        Some(account) => {
            if account.status != AccountStatus::Valid {
                return Err(Problem::unauthorized(format!(
                    "Account status is {}.",
                    account.status.as_str()
                )));
            }
            (account, StatusCode::OK)
        }
        None => {
            let jwk = ctx
                .envelope
                .header
                .jwk
                .as_ref()
                .ok_or_else(|| Problem::malformed("Must provide either kid or jwk."))?;

            let record = jwk_record(jwk);
            record.insert(&state.db).await?;

            let account = Account::new(
                new_account_kid(),
                record.id.clone(),
                payload.contact.as_ref().map(|c| c.join(",")),
            );
            account.insert(&state.db).await?;
            (account, StatusCode::CREATED)
        }
    };

    let location = absolute_url(&headers, &format!("/account/{}", account.kid));
    Ok(acme_response(
        &state,
        status_code,
        account_body(&account),
        Some(&account.id),
        Some(location),
        false,
    ))
}

pub async fn update_account(
    State(state): State<Arc<AcmeState>>,
    headers: HeaderMap,
    Path(kid): Path<String>,
    Extension(ctx): Extension<AcmeContext>,
) -> Result<Response, Problem> {
    let mut account = require_account(&ctx)?.clone();
    if account.kid != kid {
        return Err(Problem::unauthorized(
            "Account is not authorized to access this account.",
        ));
    }

    let Some(payload) = &ctx.envelope.payload else {
        return Err(Problem::malformed("No fields provided in request body."));
    };

    if let Some(contact) = &payload.contact {
        account.contact = Some(contact.join(","));
    }
    if let Some(status) = &payload.status {
        account.status = match status.as_str() {
            "valid" => AccountStatus::Valid,
            "deactivated" => AccountStatus::Deactivated,
            _ => {
                return Err(Problem::malformed("Invalid status value")
                    .with_detail("account status must be one of valid, deactivated"))
            }
        };
    }
    account.update(&state.db).await?;

    let location = absolute_url(&headers, &format!("/account/{}", account.kid));
    Ok(acme_response(
        &state,
        StatusCode::OK,
        account_body(&account),
        Some(&account.id),
        Some(location),
        false,
    ))
}

fn jwk_record(jwk: &Jwk) -> JwkRecord {
    JwkRecord {
        id: Uuid::new_v4().to_string(),
        kty: jwk.kty.clone(),
        n: jwk.n.clone(),
        e: jwk.e.clone(),
        crv: jwk.crv.clone(),
        x: jwk.x.clone(),
        y: jwk.y.clone(),
        k: jwk.k.clone(),
        created_at: String::new(),
        updated_at: String::new(),
    }
}
