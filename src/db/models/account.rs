//! ACME account and JWK models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Valid => "valid",
            AccountStatus::Deactivated => "deactivated",
            AccountStatus::Revoked => "revoked",
        }
    }
}

/// A stored account key. Exactly one of the per-kty column groups is
/// populated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JwkRecord {
    pub id: String,
    pub kty: String,
    pub n: Option<String>,
    pub e: Option<String>,
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
    pub k: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JwkRecord {
    pub async fn get_by_id(db: &DbPool, id: &str) -> Result<Option<JwkRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM jwk WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_rsa(db: &DbPool, n: &str, e: &str) -> Result<Option<JwkRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM jwk WHERE kty = 'RSA' AND n = ? AND e = ?")
            .bind(n)
            .bind(e)
            .fetch_optional(db)
            .await
    }

    pub async fn find_ec(
        db: &DbPool,
        crv: &str,
        x: &str,
        y: &str,
    ) -> Result<Option<JwkRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM jwk WHERE kty = 'EC' AND crv = ? AND x = ? AND y = ?")
            .bind(crv)
            .bind(x)
            .bind(y)
            .fetch_optional(db)
            .await
    }

    pub async fn find_oct(db: &DbPool, k: &str) -> Result<Option<JwkRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM jwk WHERE kty = 'oct' AND k = ?")
            .bind(k)
            .fetch_optional(db)
            .await
    }

    pub async fn insert(&self, db: &DbPool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO jwk (id, kty, n, e, crv, x, y, k) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.kty)
        .bind(&self.n)
        .bind(&self.e)
        .bind(&self.crv)
        .bind(&self.x)
        .bind(&self.y)
        .bind(&self.k)
        .execute(db)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: String,
    pub kid: String,
    pub status: AccountStatus,
    pub contact: Option<String>,
    pub jwk_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Account {
    pub fn new(kid: String, jwk_id: String, contact: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kid,
            status: AccountStatus::Valid,
            contact,
            jwk_id,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    pub async fn get_by_kid(db: &DbPool, kid: &str) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM account WHERE kid = ?")
            .bind(kid)
            .fetch_optional(db)
            .await
    }

    pub async fn get_by_jwk_id(db: &DbPool, jwk_id: &str) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM account WHERE jwk_id = ?")
            .bind(jwk_id)
            .fetch_optional(db)
            .await
    }

    pub async fn insert(&self, db: &DbPool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO account (id, kid, status, contact, jwk_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.kid)
        .bind(self.status)
        .bind(&self.contact)
        .bind(&self.jwk_id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn update(&self, db: &DbPool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE account SET status = ?, contact = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?",
        )
        .bind(self.status)
        .bind(&self.contact)
        .bind(&self.id)
        .execute(db)
        .await?;
        Ok(())
    }
}
