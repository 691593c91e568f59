//! CA ledger models: the certificate table and the openssl module's
//! side table of issuance counters.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::DbPool;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Certificate {
    pub id: i64,
    pub name: String,
    pub externally_managed: bool,
    pub module: Option<String>,
    pub crt_pem: Option<String>,
    #[serde(skip_serializing)]
    pub pkey_pem: Option<String>,
    pub pubkey_pem: Option<String>,
    pub csr_pem: Option<String>,
    pub crl_pem: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Certificate {
    pub async fn get_by_name(db: &DbPool, name: &str) -> Result<Option<Certificate>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM certificate WHERE name = ?")
            .bind(name)
            .fetch_optional(db)
            .await
    }

    pub async fn get_by_id(db: &DbPool, id: i64) -> Result<Option<Certificate>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM certificate WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }
}

/// Response DTO for a certificate that excludes the private key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateResponse {
    pub name: String,
    pub crt_pem: Option<String>,
    pub crl_pem: Option<String>,
}

impl From<Certificate> for CertificateResponse {
    fn from(cert: Certificate) -> Self {
        Self {
            name: cert.name,
            crt_pem: cert.crt_pem,
            crl_pem: cert.crl_pem,
        }
    }
}

/// Counters and the flat textual index the external tool maintains for a
/// CA, keyed by certificate name with the issued serial as a secondary
/// lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct OpensslData {
    #[serde(default)]
    pub id: i64,
    pub cert_name: String,
    pub cert_serial: Option<String>,
    pub database: Option<String>,
    pub serial: Option<String>,
    pub crlnumber: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl OpensslData {
    pub fn new(cert_name: &str) -> Self {
        Self {
            cert_name: cert_name.to_string(),
            ..Default::default()
        }
    }

    pub async fn get_by_cert_name(
        db: &DbPool,
        cert_name: &str,
    ) -> Result<Option<OpensslData>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM openssl_data WHERE cert_name = ?")
            .bind(cert_name)
            .fetch_optional(db)
            .await
    }

    pub async fn get_by_cert_serial(
        db: &DbPool,
        cert_serial: &str,
    ) -> Result<Option<OpensslData>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM openssl_data WHERE cert_serial = ?")
            .bind(cert_serial)
            .fetch_optional(db)
            .await
    }

    /// Insert or update the row for `cert_name`. Accepts any executor so
    /// the harvest can ride in the same transaction as the certificate
    /// write.
    pub async fn upsert<'a, E>(&self, db: E) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            "INSERT INTO openssl_data (cert_name, cert_serial, database, serial, crlnumber) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(cert_name) DO UPDATE SET \
                cert_serial = excluded.cert_serial, \
                database = excluded.database, \
                serial = excluded.serial, \
                crlnumber = excluded.crlnumber, \
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&self.cert_name)
        .bind(&self.cert_serial)
        .bind(&self.database)
        .bind(&self.serial)
        .bind(&self.crlnumber)
        .execute(db)
        .await?;
        Ok(())
    }
}
