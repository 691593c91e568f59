//! ACME order model and its state machine statuses.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::DbPool;

/// Orders and authorizations live this long after creation.
pub const EXPIRY_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Ready,
    Valid,
    Invalid,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub profile_name: String,
    pub status: OrderStatus,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
    pub expires: String,
    pub csr_pem: Option<String>,
    pub crt_pem: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Order {
    pub fn new(
        account_id: &str,
        profile_name: &str,
        not_before: Option<String>,
        not_after: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            profile_name: profile_name.to_string(),
            status: OrderStatus::Pending,
            not_before,
            not_after,
            expires: (Utc::now() + Duration::minutes(EXPIRY_MINUTES)).to_rfc3339(),
            csr_pem: None,
            crt_pem: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        DateTime::parse_from_rfc3339(&self.expires)
            .map(|t| t < Utc::now())
            .unwrap_or(false)
    }

    pub async fn get_by_id(db: &DbPool, id: &str) -> Result<Option<Order>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM \"order\" WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_by_account(db: &DbPool, account_id: &str) -> Result<Vec<Order>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM \"order\" WHERE account_id = ? ORDER BY created_at")
            .bind(account_id)
            .fetch_all(db)
            .await
    }

    pub async fn insert(&self, db: &DbPool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO \"order\" \
             (id, account_id, profile_name, status, not_before, not_after, expires) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.account_id)
        .bind(&self.profile_name)
        .bind(self.status)
        .bind(&self.not_before)
        .bind(&self.not_after)
        .bind(&self.expires)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn set_status(
        db: &DbPool,
        id: &str,
        status: OrderStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE \"order\" SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(status)
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }
}
