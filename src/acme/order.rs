//! Order endpoints: creation with identifier/client validation, order
//! polling and the per-account order listing.

use axum::{
    extract::{ConnectInfo, Extension, Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde_json::json;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

use super::account::require_account;
use super::gate::AcmeContext;
use super::jws::{key_authorization, Identifier, Jwk};
use super::problem::Problem;
use super::{absolute_url, acme_response, client_ip, random_token};
use crate::config::{AcmeProfile, ProfileLookupError};
use crate::db::{Authz, Challenge, JwkRecord, Order, OrderStatus};
use crate::AcmeState;

fn profile_problem(err: ProfileLookupError) -> Problem {
    match err {
        ProfileLookupError::NotFound(name) => {
            Problem::new("invalidProfile", format!("Profile '{name}' not found."))
        }
        ProfileLookupError::Ambiguous(name) => Problem::new(
            "invalidProfile",
            format!("Multiple profiles found with the name: '{name}'"),
        ),
        ProfileLookupError::Disabled(name) => {
            Problem::new("invalidProfile", format!("Profile '{name}' is disabled."))
        }
    }
}

/// Reverse-DNS names of the client, used by the profile ACL matcher.
async fn reverse_hostnames(ip: IpAddr) -> Vec<String> {
    let Ok(resolver) = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf() else {
        return Vec::new();
    };
    match resolver.reverse_lookup(ip).await {
        Ok(lookup) => lookup
            .iter()
            .map(|name| name.to_string().trim_end_matches('.').to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// A client may order for an identifier when the profile pre-validates
/// it, the ACL allows it, or the client's address appears in the
/// identifier's resolved address set.
async fn validate_identifier(
    profile: &AcmeProfile,
    client: IpAddr,
    client_hostnames: &[String],
    identifier: &Identifier,
) -> Option<Problem> {
    if profile.client_is_valid(client, &identifier.value, client_hostnames) {
        return None;
    }

    let resolved: HashSet<IpAddr> =
        match tokio::net::lookup_host((identifier.value.as_str(), 0)).await {
            Ok(addrs) => addrs.map(|addr| addr.ip()).collect(),
            Err(e) => {
                return Some(
                    Problem::malformed(format!("Domain {} does not exist", identifier.value))
                        .with_detail(e.to_string()),
                )
            }
        };
    if resolved.is_empty() {
        return Some(Problem::malformed(format!(
            "Domain {} exists but has no IPs",
            identifier.value
        )));
    }

    let allowed = profile.client_is_allowed(client, &identifier.value, client_hostnames);
    if !allowed && !resolved.contains(&client) {
        return Some(Problem::unauthorized(format!(
            "Client IP '{client}' has not authority over '{}'",
            identifier.value
        )));
    }

    None
}

pub async fn new_order(
    State(state): State<Arc<AcmeState>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Extension(ctx): Extension<AcmeContext>,
) -> Result<Response, Problem> {
    let account = require_account(&ctx)?.clone();
    let Some(payload) = ctx.envelope.payload.clone() else {
        return Err(Problem::malformed("No fields provided in request body."));
    };
    let identifiers = match payload.identifiers {
        Some(identifiers) if !identifiers.is_empty() => identifiers,
        _ => return Err(Problem::malformed("Order must contain identifiers.")),
    };

    let profile = state
        .config
        .get_profile_by_name(payload.profile.as_deref())
        .map_err(profile_problem)?;

    let client = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr))
        .ok_or_else(|| Problem::malformed("Unable to determine client address."))?;
    let client_hostnames = if profile.needs_reverse_dns() {
        reverse_hostnames(client).await
    } else {
        Vec::new()
    };
    debug!(
        client = %client,
        hostnames = ?client_hostnames,
        "Validating new order"
    );

    let mut errors = Vec::new();
    for identifier in &identifiers {
        if let Some(problem) =
            validate_identifier(profile, client, &client_hostnames, identifier).await
        {
            errors.push(problem);
        }
    }
    if !errors.is_empty() {
        return Err(
            Problem::malformed("One or more identifiers are invalid.").with_subproblems(errors)
        );
    }

    let order = Order::new(
        &account.id,
        &profile.name,
        payload.not_before.clone(),
        payload.not_after.clone(),
    );
    order.insert(&state.db).await?;

    let account_jwk: Jwk = JwkRecord::get_by_id(&state.db, &account.jwk_id)
        .await?
        .as_ref()
        .map(Jwk::from)
        .ok_or_else(|| Problem::server_internal("An internal server error occurred"))?;

    let mut authz_urls = Vec::new();
    for identifier in &identifiers {
        let authz = Authz::new(&order.id, identifier.id_type, &identifier.value);
        authz.insert(&state.db).await?;
        authz_urls.push(absolute_url(&headers, &format!("/authz/{}", authz.id)));

        // Key authorizations are fixed at challenge creation time
        for challenge_type in &profile.supported_challenge_types {
            let token = random_token();
            let key_auth = key_authorization(&token, &account_jwk)?;
            Challenge::new(&authz.id, challenge_type, &key_auth)
                .insert(&state.db)
                .await?;
        }
    }

    let location = absolute_url(&headers, &format!("/order/{}", order.id));
    Ok(acme_response(
        &state,
        StatusCode::CREATED,
        json!({
            "status": order.status,
            "expires": order.expires,
            "identifiers": identifiers,
            "authorizations": authz_urls,
            "finalize": absolute_url(&headers, &format!("/order/{}/finalize", order.id)),
        }),
        Some(&account.id),
        Some(location),
        false,
    ))
}

pub async fn order(
    State(state): State<Arc<AcmeState>>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Extension(ctx): Extension<AcmeContext>,
) -> Result<Response, Problem> {
    let account = require_account(&ctx)?;
    let Some(mut order) = Order::get_by_id(&state.db, &order_id).await? else {
        return Err(Problem::malformed("Invalid order ID."));
    };
    if order.account_id != account.id {
        return Err(Problem::unauthorized(
            "Account is not authorized to access this order.",
        ));
    }

    // Any access past the expiry transitions and persists
    if order.status != OrderStatus::Expired && order.is_expired() {
        Order::set_status(&state.db, &order.id, OrderStatus::Expired).await?;
        order.status = OrderStatus::Expired;
    }

    let authz_entries = Authz::list_by_order(&state.db, &order.id).await?;
    let identifiers: Vec<serde_json::Value> = authz_entries
        .iter()
        .map(|authz| {
            json!({ "type": authz.identifier_type, "value": authz.identifier_value })
        })
        .collect();
    let authz_urls: Vec<String> = authz_entries
        .iter()
        .map(|authz| absolute_url(&headers, &format!("/authz/{}", authz.id)))
        .collect();

    let mut body = json!({
        "status": order.status,
        "expires": order.expires,
        "notBefore": order.not_before,
        "notAfter": order.not_after,
        "identifiers": identifiers,
        "authorizations": authz_urls,
        "finalize": absolute_url(&headers, &format!("/order/{}/finalize", order.id)),
    });
    if order.crt_pem.is_some() {
        body["certificate"] = json!(absolute_url(
            &headers,
            &format!("/order/{}/certificate", order.id)
        ));
    }

    let location = absolute_url(&headers, &format!("/order/{}", order.id));
    Ok(acme_response(
        &state,
        StatusCode::OK,
        body,
        Some(&account.id),
        Some(location),
        false,
    ))
}

pub async fn account_orders(
    State(state): State<Arc<AcmeState>>,
    headers: HeaderMap,
    Path(kid): Path<String>,
    Extension(ctx): Extension<AcmeContext>,
) -> Result<Response, Problem> {
    let account = require_account(&ctx)?;
    if account.kid != kid {
        return Err(Problem::unauthorized("Account is not authorized."));
    }

    let orders = Order::list_by_account(&state.db, &account.id).await?;
    let urls: Vec<String> = orders
        .iter()
        .map(|order| absolute_url(&headers, &format!("/order/{}", order.id)))
        .collect();

    Ok(acme_response(
        &state,
        StatusCode::OK,
        json!({ "orders": urls }),
        Some(&account.id),
        None,
        false,
    ))
}
