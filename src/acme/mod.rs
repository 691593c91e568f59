//! The ACME server plane: RFC 8555-style HTTP API over signed JWS
//! requests.

mod account;
mod authz;
pub mod gate;
pub mod jws;
pub mod nonce;
mod order;
pub mod problem;
pub mod validator;

use axum::{
    extract::{Request, State},
    http::{header::HeaderValue, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AcmeState;
use self::problem::Problem;

pub fn create_router(state: Arc<AcmeState>) -> Router {
    // Requests on these routes pass the JWS/account/nonce gate first
    let gated = Router::new()
        .route("/new-account", post(account::new_account))
        .route("/account/:kid", post(account::update_account))
        .route("/account/:kid/orders", post(order::account_orders))
        .route("/new-order", post(order::new_order))
        .route("/order/:id", post(order::order))
        .route("/authz/:id", post(authz::authz))
        .route("/challenge/:id", post(authz::challenge))
        .layer(middleware::from_fn_with_state(state.clone(), gate::acme_gate));

    Router::new()
        .route("/directory", get(directory))
        .route("/new-nonce", get(new_nonce))
        .route("/health", get(health_check))
        .merge(gated)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ensure_error_headers,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

/// GET/HEAD /new-nonce: nothing but a fresh anonymous nonce.
async fn new_nonce(State(state): State<Arc<AcmeState>>) -> Response {
    let nonce = state.nonces.new_nonce(None);
    let mut response = StatusCode::OK.into_response();
    if let Ok(value) = HeaderValue::from_str(&nonce) {
        response.headers_mut().insert("Replay-Nonce", value);
    }
    response
}

async fn directory(State(state): State<Arc<AcmeState>>, headers: HeaderMap) -> Json<serde_json::Value> {
    let base = base_url(&headers);
    let profiles: serde_json::Map<String, serde_json::Value> = state
        .config
        .profiles
        .iter()
        .map(|profile| (profile.name.clone(), profile.to_meta()))
        .collect();

    Json(json!({
        "newNonce": format!("{base}/new-nonce"),
        "newAccount": format!("{base}/new-account"),
        "newOrder": format!("{base}/new-order"),
        "revokeCert": format!("{base}/revoke-cert"),
        "keyChange": null,
        "meta": { "profiles": profiles },
    }))
}

/// Every error response out of this plane carries a fresh nonce and a
/// Retry-After, even when it was produced outside the gate.
async fn ensure_error_headers(
    State(state): State<Arc<AcmeState>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        if !response.headers().contains_key("Replay-Nonce") {
            if let Ok(value) = HeaderValue::from_str(&state.nonces.new_nonce(None)) {
                response.headers_mut().insert("Replay-Nonce", value);
            }
        }
        if !response.headers().contains_key("Retry-After") {
            if let Ok(value) = HeaderValue::from_str(&state.config.retry_after_seconds.to_string())
            {
                response.headers_mut().insert("Retry-After", value);
            }
        }
    }
    response
}

/// Base URL as the client addressed us; TLS termination is out of scope
/// so the scheme is plain http.
pub fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

pub fn absolute_url(headers: &HeaderMap, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("{}{}", base_url(headers), path)
}

/// Client address: first X-Forwarded-For hop, else the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<std::net::IpAddr> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return Some(ip);
            }
        }
    }
    peer.map(|addr| addr.ip())
}

/// 256-bit URL-safe random token (challenge tokens).
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Opaque account identifier: `acct-` + 24 hex chars.
pub fn new_account_kid() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    format!("acct-{}", hex::encode(bytes))
}

/// A JSON response with the headers every authenticated ACME response
/// carries: a fresh `Replay-Nonce` (bound to the account) and optionally
/// `Location` and `Retry-After`.
pub fn acme_response(
    state: &AcmeState,
    status: StatusCode,
    body: serde_json::Value,
    account_id: Option<&str>,
    location: Option<String>,
    retry_after: bool,
) -> Response {
    let mut response = (status, Json(body)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&state.nonces.new_nonce(account_id)) {
        headers.insert("Replay-Nonce", value);
    }
    if let Some(location) = location {
        if let Ok(value) = HeaderValue::from_str(&location) {
            headers.insert("Location", value);
        }
    }
    if retry_after {
        if let Ok(value) = HeaderValue::from_str(&state.config.retry_after_seconds.to_string()) {
            headers.insert("Retry-After", value);
        }
    }
    response
}

/// A problem rendered with the mandatory failure headers.
pub fn problem_response(state: &AcmeState, problem: Problem, account_id: Option<&str>) -> Response {
    let mut response = problem.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&state.nonces.new_nonce(account_id)) {
        headers.insert("Replay-Nonce", value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.config.retry_after_seconds.to_string()) {
        headers.insert("Retry-After", value);
    }
    response
}

#[cfg(test)]
mod http_tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{Authz, AuthzStatus, Challenge, ChallengeStatus};
    use axum::body::Body;
    use axum::http::{header, Method, Request as HttpRequest};
    use ring::hmac;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    const TEST_KEY: &[u8] = b"an-oct-key-shared-with-the-tests";

    const CONFIG_YAML: &str = "\
sigil_acme:
  nonce_ttl_seconds: 300
  retry_after_seconds: 5
  http01:
    port: 1
    timeout_seconds: 1
    retries: 1
    retry_delay_seconds: 0.01
  profiles:
    - name: internal
      ca: root
      default: true
      pre_validated:
        - domain: example.com
          clients: [\"*\"]
        - domain: 127.0.0.1
          clients: [\"*\"]
";

    async fn test_app() -> (Router, Arc<AcmeState>) {
        let config = Config::from_yaml(CONFIG_YAML).unwrap();
        let db = crate::db::test_pool().await;
        let state = Arc::new(AcmeState::new(config.sigil_acme, db));
        (create_router(state.clone()), state)
    }

    fn b64(value: &Value) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
    }

    fn oct_jwk() -> Value {
        json!({ "kty": "oct", "k": URL_SAFE_NO_PAD.encode(TEST_KEY) })
    }

    fn signed_body(
        jwk: Option<Value>,
        kid: Option<&str>,
        nonce: &str,
        url: &str,
        payload: Option<Value>,
    ) -> Body {
        let mut header = json!({ "alg": "HS256", "nonce": nonce, "url": url });
        if let Some(jwk) = jwk {
            header["jwk"] = jwk;
        }
        if let Some(kid) = kid {
            header["kid"] = json!(kid);
        }
        let protected = b64(&header);
        let payload = payload.map(|p| b64(&p)).unwrap_or_default();
        let message = format!("{protected}.{payload}");
        let key = hmac::Key::new(hmac::HMAC_SHA256, TEST_KEY);
        let tag = hmac::sign(&key, message.as_bytes());
        Body::from(
            serde_json::to_vec(&json!({
                "protected": protected,
                "payload": payload,
                "signature": URL_SAFE_NO_PAD.encode(tag.as_ref()),
            }))
            .unwrap(),
        )
    }

    async fn fetch_nonce(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method(Method::HEAD)
                    .uri("/new-nonce")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response
            .headers()
            .get("Replay-Nonce")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    async fn post(app: &Router, uri: &str, body: Body) -> axum::response::Response {
        app.clone()
            .oneshot(
                HttpRequest::builder()
                    .method(Method::POST)
                    .uri(uri)
                    .header(header::HOST, "acme.test")
                    .header("x-forwarded-for", "203.0.113.9")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Register an account, returning its kid.
    async fn register(app: &Router) -> String {
        let nonce = fetch_nonce(app).await;
        let body = signed_body(
            Some(oct_jwk()),
            None,
            &nonce,
            "http://acme.test/new-account",
            Some(json!({"contact": ["mailto:ops@example.com"]})),
        );
        let response = post(app, "/new-account", body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = response
            .headers()
            .get("Location")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        location.rsplit('/').next().unwrap().to_string()
    }

    async fn place_order(app: &Router, kid: &str, value: &str) -> Value {
        let nonce = fetch_nonce(app).await;
        let body = signed_body(
            None,
            Some(kid),
            &nonce,
            "http://acme.test/new-order",
            Some(json!({"identifiers": [{"type": "dns", "value": value}]})),
        );
        let response = post(app, "/new-order", body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await
    }

    #[tokio::test]
    async fn test_new_nonce_and_account_registration() {
        let (app, _state) = test_app().await;

        let nonce = fetch_nonce(&app).await;
        assert!(nonce.len() >= 43);

        let body = signed_body(
            Some(oct_jwk()),
            None,
            &nonce,
            "http://acme.test/new-account",
            Some(json!({"contact": ["mailto:ops@example.com"]})),
        );
        let response = post(&app, "/new-account", body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("Replay-Nonce"));

        let location = response
            .headers()
            .get("Location")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let kid = location.rsplit('/').next().unwrap();
        assert!(kid.starts_with("acct-"));
        assert_eq!(kid.len(), 29);

        let body = body_json(response).await;
        assert_eq!(body["status"], "valid");
    }

    #[tokio::test]
    async fn test_existing_key_returns_existing_account() {
        let (app, _state) = test_app().await;
        let kid = register(&app).await;

        let nonce = fetch_nonce(&app).await;
        let body = signed_body(
            Some(oct_jwk()),
            None,
            &nonce,
            "http://acme.test/new-account",
            Some(json!({})),
        );
        let response = post(&app, "/new-account", body).await;
        assert_eq!(response.status(), StatusCode::OK);
        let location = response
            .headers()
            .get("Location")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(location.ends_with(&kid));
    }

    #[tokio::test]
    async fn test_unknown_kty_is_bad_signature_algorithm() {
        let (app, _state) = test_app().await;
        let nonce = fetch_nonce(&app).await;
        let body = signed_body(
            Some(json!({"kty": "foo", "k": "eA"})),
            None,
            &nonce,
            "http://acme.test/new-account",
            None,
        );
        let response = post(&app, "/new-account", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().contains_key("Replay-Nonce"));
        assert!(response.headers().contains_key("Retry-After"));
        let body = body_json(response).await;
        assert_eq!(
            body["type"],
            "urn:ietf:params:acme:error:badSignatureAlgorithm"
        );
    }

    #[tokio::test]
    async fn test_nonce_replay_is_rejected() {
        let (app, _state) = test_app().await;
        let nonce = fetch_nonce(&app).await;

        let make_body = || {
            signed_body(
                Some(oct_jwk()),
                None,
                &nonce,
                "http://acme.test/new-account",
                Some(json!({})),
            )
        };

        let first = post(&app, "/new-account", make_body()).await;
        assert_eq!(first.status(), StatusCode::CREATED);

        // Same nonce again
        let second = post(&app, "/new-account", make_body()).await;
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
        let fresh = second
            .headers()
            .get("Replay-Nonce")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_ne!(fresh, nonce);
        let body = body_json(second).await;
        assert_eq!(body["type"], "urn:ietf:params:acme:error:badNonce");
    }

    #[tokio::test]
    async fn test_only_return_existing_without_account() {
        let (app, _state) = test_app().await;
        let nonce = fetch_nonce(&app).await;
        let body = signed_body(
            Some(oct_jwk()),
            None,
            &nonce,
            "http://acme.test/new-account",
            Some(json!({"onlyReturnExisting": true})),
        );
        let response = post(&app, "/new-account", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(
            body["type"],
            "urn:ietf:params:acme:error:accountDoesNotExist"
        );
    }

    #[tokio::test]
    async fn test_unknown_kid_is_account_does_not_exist() {
        let (app, _state) = test_app().await;
        let nonce = fetch_nonce(&app).await;
        let body = signed_body(
            None,
            Some("acct-ffffffffffffffffffffffff"),
            &nonce,
            "http://acme.test/new-order",
            Some(json!({"identifiers": [{"type": "dns", "value": "example.com"}]})),
        );
        let response = post(&app, "/new-order", body).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(
            body["type"],
            "urn:ietf:params:acme:error:accountDoesNotExist"
        );
    }

    #[tokio::test]
    async fn test_new_order_lowercases_and_creates_chain() {
        let (app, state) = test_app().await;
        let kid = register(&app).await;

        let order_body = place_order(&app, &kid, "EXAMPLE.COM").await;
        assert_eq!(order_body["status"], "pending");
        assert_eq!(order_body["identifiers"][0]["value"], "example.com");
        let authz_urls = order_body["authorizations"].as_array().unwrap();
        assert_eq!(authz_urls.len(), 1);

        // Exactly one http-01 challenge whose token prefixes its stored
        // key authorization
        let authz_id = authz_urls[0].as_str().unwrap().rsplit('/').next().unwrap();
        let challenges = Challenge::list_by_authz(&state.db, authz_id).await.unwrap();
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].challenge_type, "http-01");
        assert!(challenges[0]
            .key_authorization
            .starts_with(&format!("{}.", challenges[0].token())));

        let authz = Authz::get_by_id(&state.db, authz_id).await.unwrap().unwrap();
        assert_eq!(authz.status, AuthzStatus::Pending);
        assert!(!authz.wildcard);
    }

    #[tokio::test]
    async fn test_unknown_profile_is_invalid_profile() {
        let (app, _state) = test_app().await;
        let kid = register(&app).await;

        let nonce = fetch_nonce(&app).await;
        let body = signed_body(
            None,
            Some(&kid),
            &nonce,
            "http://acme.test/new-order",
            Some(json!({
                "identifiers": [{"type": "dns", "value": "example.com"}],
                "profile": "nope",
            })),
        );
        let response = post(&app, "/new-order", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["type"], "urn:ietf:params:acme:error:invalidProfile");
    }

    #[tokio::test]
    async fn test_order_poll_is_post_as_get() {
        let (app, _state) = test_app().await;
        let kid = register(&app).await;
        let order_body = place_order(&app, &kid, "example.com").await;

        let nonce = fetch_nonce(&app).await;
        // finalize is http://acme.test/order/{id}/finalize
        let order_id = order_body["finalize"]
            .as_str()
            .unwrap()
            .split('/')
            .nth(4)
            .unwrap();
        let order_url = format!("/order/{order_id}");
        let response = post(
            &app,
            &order_url,
            signed_body(None, Some(&kid), &nonce, "http://acme.test/order", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["identifiers"][0]["value"], "example.com");
    }

    #[tokio::test]
    async fn test_orders_listing() {
        let (app, _state) = test_app().await;
        let kid = register(&app).await;
        place_order(&app, &kid, "example.com").await;
        place_order(&app, &kid, "example.com").await;

        let nonce = fetch_nonce(&app).await;
        let response = post(
            &app,
            &format!("/account/{kid}/orders"),
            signed_body(None, Some(&kid), &nonce, "http://acme.test/orders", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["orders"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_account_update_changes_contact_and_status() {
        let (app, _state) = test_app().await;
        let kid = register(&app).await;

        let nonce = fetch_nonce(&app).await;
        let response = post(
            &app,
            &format!("/account/{kid}"),
            signed_body(
                None,
                Some(&kid),
                &nonce,
                "http://acme.test/account",
                Some(json!({"contact": ["mailto:new@example.com"], "status": "deactivated"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "deactivated");
        assert_eq!(body["contact"][0], "mailto:new@example.com");

        // A deactivated account no longer passes the gate
        let nonce = fetch_nonce(&app).await;
        let response = post(
            &app,
            "/new-order",
            signed_body(
                None,
                Some(&kid),
                &nonce,
                "http://acme.test/new-order",
                Some(json!({"identifiers": [{"type": "dns", "value": "example.com"}]})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["type"], "urn:ietf:params:acme:error:unauthorized");
    }

    #[tokio::test]
    async fn test_authz_poll_and_challenge_kickoff() {
        let (app, state) = test_app().await;
        let kid = register(&app).await;
        let order_body = place_order(&app, &kid, "127.0.0.1").await;
        let authz_url = order_body["authorizations"][0].as_str().unwrap();
        let authz_id = authz_url.rsplit('/').next().unwrap();

        let nonce = fetch_nonce(&app).await;
        let response = post(
            &app,
            &format!("/authz/{authz_id}"),
            signed_body(None, Some(&kid), &nonce, "http://acme.test/authz", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["identifier"]["value"], "127.0.0.1");
        let challenge_url = body["challenges"][0]["url"].as_str().unwrap().to_string();
        let challenge_id = challenge_url.rsplit('/').next().unwrap().to_string();

        // POSTing the challenge schedules validation and answers with
        // the current (processing) state
        let nonce = fetch_nonce(&app).await;
        let response = post(
            &app,
            &format!("/challenge/{challenge_id}"),
            signed_body(None, Some(&kid), &nonce, "http://acme.test/challenge", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("Retry-After"));
        let body = body_json(response).await;
        assert_eq!(body["status"], "processing");

        // Nothing answers on the configured port, so the background task
        // settles the chain as invalid
        let mut challenge_status = ChallengeStatus::Processing;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let challenge = Challenge::get_by_id(&state.db, &challenge_id)
                .await
                .unwrap()
                .unwrap();
            challenge_status = challenge.status;
            if challenge_status != ChallengeStatus::Processing {
                break;
            }
        }
        assert_eq!(challenge_status, ChallengeStatus::Invalid);

        // The failed authz now reports its error with a 400
        let nonce = fetch_nonce(&app).await;
        let response = post(
            &app,
            &format!("/authz/{authz_id}"),
            signed_body(None, Some(&kid), &nonce, "http://acme.test/authz", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "invalid");
        assert_eq!(body["error"]["type"], "urn:ietf:params:acme:error:connection");
    }

    #[tokio::test]
    async fn test_foreign_order_is_unauthorized() {
        let (app, _state) = test_app().await;
        let kid = register(&app).await;
        let order_body = place_order(&app, &kid, "example.com").await;
        let order_url = order_body["finalize"].as_str().unwrap();
        let order_id = order_url.split('/').nth(4).unwrap();

        // A second account with a different key
        let other_key = b"a-different-oct-key-entirely!!!!";
        let other_jwk = json!({ "kty": "oct", "k": URL_SAFE_NO_PAD.encode(other_key) });
        let nonce = fetch_nonce(&app).await;
        let mut header = json!({ "alg": "HS256", "nonce": nonce, "url": "http://acme.test/new-account", "jwk": other_jwk });
        let protected = b64(&header);
        let key = hmac::Key::new(hmac::HMAC_SHA256, other_key);
        let tag = hmac::sign(&key, format!("{protected}.").as_bytes());
        let body = Body::from(
            serde_json::to_vec(&json!({
                "protected": protected,
                "payload": "",
                "signature": URL_SAFE_NO_PAD.encode(tag.as_ref()),
            }))
            .unwrap(),
        );
        let response = post(&app, "/new-account", body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let other_kid = response
            .headers()
            .get("Location")
            .unwrap()
            .to_str()
            .unwrap()
            .rsplit('/')
            .next()
            .unwrap()
            .to_string();

        // It cannot read the first account's order
        let nonce = fetch_nonce(&app).await;
        header = json!({ "alg": "HS256", "nonce": nonce, "url": "http://acme.test/order", "kid": other_kid });
        let protected = b64(&header);
        let tag = hmac::sign(&key, format!("{protected}.").as_bytes());
        let body = Body::from(
            serde_json::to_vec(&json!({
                "protected": protected,
                "payload": "",
                "signature": URL_SAFE_NO_PAD.encode(tag.as_ref()),
            }))
            .unwrap(),
        );
        let response = post(&app, &format!("/order/{order_id}"), body).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_directory_lists_endpoints_and_profiles() {
        let (app, _state) = test_app().await;
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method(Method::GET)
                    .uri("/directory")
                    .header(header::HOST, "acme.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["newNonce"], "http://acme.test/new-nonce");
        assert_eq!(body["newAccount"], "http://acme.test/new-account");
        assert_eq!(body["newOrder"], "http://acme.test/new-order");
        assert_eq!(body["revokeCert"], "http://acme.test/revoke-cert");
        assert!(body["keyChange"].is_null());
        assert_eq!(body["meta"]["profiles"]["internal"]["default"], true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_and_absolute_url() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("acme.example:8080"));
        assert_eq!(base_url(&headers), "http://acme.example:8080");
        assert_eq!(
            absolute_url(&headers, "/order/abc"),
            "http://acme.example:8080/order/abc"
        );
        assert_eq!(
            absolute_url(&headers, "order/abc"),
            "http://acme.example:8080/order/abc"
        );
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(
            client_ip(&headers, Some(peer)).unwrap().to_string(),
            "203.0.113.7"
        );

        let headers = HeaderMap::new();
        assert_eq!(
            client_ip(&headers, Some(peer)).unwrap().to_string(),
            "127.0.0.1"
        );
        assert!(client_ip(&headers, None).is_none());
    }

    #[test]
    fn test_account_kid_shape() {
        let kid = new_account_kid();
        assert!(kid.starts_with("acct-"));
        assert_eq!(kid.len(), 5 + 24);
        assert!(kid[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_random_token_is_urlsafe() {
        let token = random_token();
        assert!(token.len() >= 43);
        assert!(!token.contains('+') && !token.contains('/') && !token.contains('='));
    }
}
