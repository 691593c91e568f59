//! ACME authorization and challenge models, plus the error records
//! attached to failed authorizations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::{DbPool, EXPIRY_MINUTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AuthzStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum IdentifierType {
    Dns,
    Ip,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Dns => "dns",
            IdentifierType::Ip => "ip",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Authz {
    pub id: String,
    pub order_id: String,
    pub identifier_type: IdentifierType,
    pub identifier_value: String,
    pub status: AuthzStatus,
    pub wildcard: bool,
    pub expires: String,
    pub error_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Authz {
    pub fn new(order_id: &str, identifier_type: IdentifierType, identifier_value: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            identifier_type,
            identifier_value: identifier_value.to_string(),
            status: AuthzStatus::Pending,
            // Wildcard identifiers are rejected at order time
            wildcard: false,
            expires: (Utc::now() + Duration::minutes(EXPIRY_MINUTES)).to_rfc3339(),
            error_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        DateTime::parse_from_rfc3339(&self.expires)
            .map(|t| t < Utc::now())
            .unwrap_or(false)
    }

    pub async fn get_by_id(db: &DbPool, id: &str) -> Result<Option<Authz>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM authz WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_by_order(db: &DbPool, order_id: &str) -> Result<Vec<Authz>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM authz WHERE order_id = ? ORDER BY created_at")
            .bind(order_id)
            .fetch_all(db)
            .await
    }

    pub async fn insert(&self, db: &DbPool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO authz \
             (id, order_id, identifier_type, identifier_value, status, wildcard, expires) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.order_id)
        .bind(self.identifier_type)
        .bind(&self.identifier_value)
        .bind(self.status)
        .bind(self.wildcard)
        .bind(&self.expires)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn set_status(
        db: &DbPool,
        id: &str,
        status: AuthzStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE authz SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn attach_error(
        db: &DbPool,
        id: &str,
        error_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE authz SET error_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(error_id)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Challenge {
    pub id: String,
    pub authz_id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub key_authorization: String,
    pub status: ChallengeStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl Challenge {
    pub fn new(authz_id: &str, challenge_type: &str, key_authorization: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            authz_id: authz_id.to_string(),
            challenge_type: challenge_type.to_string(),
            key_authorization: key_authorization.to_string(),
            status: ChallengeStatus::Pending,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    /// The public token half of the key authorization.
    pub fn token(&self) -> &str {
        self.key_authorization
            .split('.')
            .next()
            .unwrap_or(&self.key_authorization)
    }

    pub async fn get_by_id(db: &DbPool, id: &str) -> Result<Option<Challenge>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM challenge WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_by_authz(db: &DbPool, authz_id: &str) -> Result<Vec<Challenge>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM challenge WHERE authz_id = ? ORDER BY created_at")
            .bind(authz_id)
            .fetch_all(db)
            .await
    }

    pub async fn insert(&self, db: &DbPool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO challenge (id, authz_id, type, key_authorization, status) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.authz_id)
        .bind(&self.challenge_type)
        .bind(&self.key_authorization)
        .bind(self.status)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn set_status(
        db: &DbPool,
        id: &str,
        status: ChallengeStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE challenge SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ErrorRecord {
    pub id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub title: Option<String>,
    pub detail: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ErrorRecord {
    pub fn new(error_type: &str, title: &str, detail: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            error_type: Some(error_type.to_string()),
            title: Some(title.to_string()),
            detail,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    pub async fn get_by_id(db: &DbPool, id: &str) -> Result<Option<ErrorRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM error WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn insert(&self, db: &DbPool) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO error (id, type, title, detail) VALUES (?, ?, ?, ?)")
            .bind(&self.id)
            .bind(&self.error_type)
            .bind(&self.title)
            .bind(&self.detail)
            .execute(db)
            .await?;
        Ok(())
    }
}
