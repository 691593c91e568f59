//! Background HTTP-01 challenge validator.
//!
//! Runs off the request task that scheduled it, owns its own database
//! handle, and persists every state transition individually so polling
//! clients observe intermediate states.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Http01Config;
use crate::db::{
    Authz, AuthzStatus, Challenge, ChallengeStatus, DbPool, ErrorRecord, Order, OrderStatus,
};
use crate::AcmeState;

/// Response statuses worth another attempt.
const RETRY_STATUS: &[u16] = &[400, 404, 500, 502, 503, 504];

pub struct Http01Validator {
    db: DbPool,
    config: Http01Config,
    challenge: Challenge,
    authz: Authz,
}

impl Http01Validator {
    pub fn new(state: &AcmeState, challenge: Challenge, authz: Authz) -> Self {
        Self {
            db: state.db.clone(),
            config: state.config.http01.clone(),
            challenge,
            authz,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.validate().await })
    }

    pub async fn validate(self) {
        let mut guard = CancelGuard {
            db: self.db.clone(),
            challenge_id: self.challenge.id.clone(),
            authz_id: self.authz.id.clone(),
            order_id: self.authz.order_id.clone(),
            armed: true,
        };

        match self.fetch_and_compare().await {
            Ok(()) => {
                info!(
                    challenge = %self.challenge.id,
                    identifier = %self.authz.identifier_value,
                    "Challenge validated"
                );
                self.persist_success().await;
            }
            Err((category, detail)) => {
                warn!(
                    challenge = %self.challenge.id,
                    identifier = %self.authz.identifier_value,
                    error = %detail,
                    "Challenge validation failed"
                );
                persist_failure(
                    &self.db,
                    &self.challenge.id,
                    &self.authz.id,
                    &self.authz.order_id,
                    category,
                    detail,
                )
                .await;
            }
        }

        guard.armed = false;
    }

    /// One validation pass with the configured retry budget. Success is
    /// HTTP 200 with a trimmed body equal to the full key authorization.
    async fn fetch_and_compare(&self) -> Result<(), (&'static str, String)> {
        let token = self.challenge.token();
        let url = format!(
            "http://{}:{}/.well-known/acme-challenge/{}",
            self.authz.identifier_value, self.config.port, token
        );

        let redirect = if self.config.follow_redirect {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .redirect(redirect)
            .build()
            .map_err(|e| ("connection", format!("Failed to build HTTP client: {e}")))?;

        let attempts = self.config.retries.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(backoff_delay(self.config.retry_delay_seconds, attempt)).await;
            }
            let has_budget = attempt + 1 < attempts;

            match client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    if status == 200 && body.trim() == self.challenge.key_authorization {
                        return Ok(());
                    }
                    if RETRY_STATUS.contains(&status) && has_budget {
                        continue;
                    }
                    return Err((
                        "incorrectResponse",
                        format!("Invalid response from {url}: {status} {body}"),
                    ));
                }
                Err(e) if has_budget => {
                    warn!(url = %url, attempt, "Challenge fetch failed: {e}");
                }
                Err(e) => return Err(("connection", connection_detail(&url, &e))),
            }
        }

        Err((
            "connection",
            "Max retries exceeded when trying to validate challenge.".to_string(),
        ))
    }

    async fn persist_success(&self) {
        if let Err(e) =
            Challenge::set_status(&self.db, &self.challenge.id, ChallengeStatus::Valid).await
        {
            error!("Failed to persist challenge status: {e}");
            return;
        }
        if let Err(e) = Authz::set_status(&self.db, &self.authz.id, AuthzStatus::Valid).await {
            error!("Failed to persist authz status: {e}");
        }
    }
}

fn connection_detail(url: &str, e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "Timed out waiting for response, this is most likely due to a firewall blocking the request."
            .to_string()
    } else if e.is_redirect() {
        "Too many redirects when trying to validate challenge.".to_string()
    } else {
        format!("Failed to connect to {url}: {e}")
    }
}

fn backoff_delay(factor: f64, attempt: u32) -> Duration {
    Duration::from_secs_f64(factor.max(0.0) * 2f64.powi(attempt.saturating_sub(1) as i32))
}

/// Mark the challenge chain invalid and attach the error record. Each
/// write is persisted on its own, in order.
async fn persist_failure(
    db: &DbPool,
    challenge_id: &str,
    authz_id: &str,
    order_id: &str,
    category: &str,
    detail: String,
) {
    let record = ErrorRecord::new(category, "Failed to validate challenge.", Some(detail));
    if let Err(e) = record.insert(db).await {
        error!("Failed to persist challenge error: {e}");
        return;
    }
    if let Err(e) = Challenge::set_status(db, challenge_id, ChallengeStatus::Invalid).await {
        error!("Failed to persist challenge status: {e}");
    }
    if let Err(e) = Authz::set_status(db, authz_id, AuthzStatus::Invalid).await {
        error!("Failed to persist authz status: {e}");
    }
    if let Err(e) = Authz::attach_error(db, authz_id, &record.id).await {
        error!("Failed to attach authz error: {e}");
    }
    if let Err(e) = Order::set_status(db, order_id, OrderStatus::Invalid).await {
        error!("Failed to persist order status: {e}");
    }
}

/// A cancelled validation must not leave the challenge in `processing`.
struct CancelGuard {
    db: DbPool,
    challenge_id: String,
    authz_id: String,
    order_id: String,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let db = self.db.clone();
        let challenge_id = std::mem::take(&mut self.challenge_id);
        let authz_id = std::mem::take(&mut self.authz_id);
        let order_id = std::mem::take(&mut self.order_id);
        handle.spawn(async move {
            persist_failure(
                &db,
                &challenge_id,
                &authz_id,
                &order_id,
                "connection",
                "Challenge validation was cancelled before completion.".to_string(),
            )
            .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcmeConfig;
    use crate::db::{Account, JwkRecord};
    use crate::AcmeState;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const KEY_AUTH: &str = "tok123.thumbprint-of-test-key";

    async fn seeded_state(port: u16) -> (Arc<AcmeState>, Challenge, Authz, Order) {
        let db = crate::db::test_pool().await;
        let mut config = AcmeConfig::default();
        config.http01.port = port;
        config.http01.timeout_seconds = 2;
        config.http01.retries = 1;
        let state = Arc::new(AcmeState::new(config, db.clone()));

        let jwk = JwkRecord {
            id: "jwk-1".to_string(),
            kty: "oct".to_string(),
            n: None,
            e: None,
            crv: None,
            x: None,
            y: None,
            k: Some("a2V5".to_string()),
            created_at: String::new(),
            updated_at: String::new(),
        };
        jwk.insert(&db).await.unwrap();

        let account = Account::new("acct-000000000000000000000000".to_string(), jwk.id, None);
        account.insert(&db).await.unwrap();

        let order = Order::new(&account.id, "internal", None, None);
        order.insert(&db).await.unwrap();

        let authz = Authz::new(&order.id, crate::db::IdentifierType::Ip, "127.0.0.1");
        authz.insert(&db).await.unwrap();

        let challenge = Challenge::new(&authz.id, "http-01", KEY_AUTH);
        challenge.insert(&db).await.unwrap();
        Challenge::set_status(&db, &challenge.id, ChallengeStatus::Processing)
            .await
            .unwrap();

        (state, challenge, authz, order)
    }

    /// One-shot HTTP responder serving `body` for any request.
    async fn serve_once(status_line: &'static str, body: String) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_successful_validation_transitions_to_valid() {
        let port = serve_once("HTTP/1.1 200 OK", format!("{KEY_AUTH}\n")).await;
        let (state, challenge, authz, order) = seeded_state(port).await;

        Http01Validator::new(&state, challenge.clone(), authz.clone())
            .validate()
            .await;

        let challenge = Challenge::get_by_id(&state.db, &challenge.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Valid);

        let authz = Authz::get_by_id(&state.db, &authz.id).await.unwrap().unwrap();
        assert_eq!(authz.status, AuthzStatus::Valid);
        assert!(authz.error_id.is_none());

        // Order is untouched on success
        let order = Order::get_by_id(&state.db, &order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_wrong_body_is_incorrect_response() {
        let port = serve_once("HTTP/1.1 200 OK", "something-else".to_string()).await;
        let (state, challenge, authz, order) = seeded_state(port).await;

        Http01Validator::new(&state, challenge.clone(), authz.clone())
            .validate()
            .await;

        let challenge = Challenge::get_by_id(&state.db, &challenge.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Invalid);

        let authz = Authz::get_by_id(&state.db, &authz.id).await.unwrap().unwrap();
        assert_eq!(authz.status, AuthzStatus::Invalid);
        let error = ErrorRecord::get_by_id(&state.db, authz.error_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.error_type.as_deref(), Some("incorrectResponse"));

        let order = Order::get_by_id(&state.db, &order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);
    }

    #[tokio::test]
    async fn test_unreachable_responder_is_connection_error() {
        // Bind-then-drop to get a port nothing listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (state, challenge, authz, _order) = seeded_state(port).await;

        Http01Validator::new(&state, challenge.clone(), authz.clone())
            .validate()
            .await;

        let authz = Authz::get_by_id(&state.db, &authz.id).await.unwrap().unwrap();
        assert_eq!(authz.status, AuthzStatus::Invalid);
        let error = ErrorRecord::get_by_id(&state.db, authz.error_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.error_type.as_deref(), Some("connection"));
    }

    #[test]
    fn test_backoff_delay_doubles() {
        assert_eq!(backoff_delay(0.5, 1), Duration::from_secs_f64(0.5));
        assert_eq!(backoff_delay(0.5, 2), Duration::from_secs_f64(1.0));
        assert_eq!(backoff_delay(0.5, 3), Duration::from_secs_f64(2.0));
    }
}
