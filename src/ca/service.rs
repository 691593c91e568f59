//! Orchestrates certificate creation against the ledger: resolves the
//! config, drives the crypto module, chains child CAs onto their parent
//! and persists the PEMs together with the harvested counters in one
//! transaction.

use tracing::{info, warn};
use zeroize::Zeroizing;

use super::{load_module, CaError, CryptoModule, IssueOutput};
use crate::config::{CaConfig, CertificateConfig};
use crate::crypto;
use crate::db::{Certificate, CertificateResponse, DbPool, OpensslData};

pub struct CertificateService {
    config: CaConfig,
    db: DbPool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CertificateStatus {
    pub name: String,
    pub status: &'static str,
}

impl CertificateService {
    pub fn new(config: CaConfig, db: DbPool) -> Self {
        Self { config, db }
    }

    /// Creation status of every configured certificate.
    pub async fn status(&self) -> Result<Vec<CertificateStatus>, CaError> {
        let mut statuses = Vec::new();
        for cert_config in &self.config.x509_certificates {
            let created = Certificate::get_by_name(&self.db, &cert_config.name)
                .await?
                .is_some();
            statuses.push(CertificateStatus {
                name: cert_config.name.clone(),
                status: if created { "created" } else { "not_created" },
            });
        }
        Ok(statuses)
    }

    pub async fn create_certificates(
        &self,
        names: &[String],
    ) -> Result<Vec<CertificateResponse>, CaError> {
        let mut responses = Vec::new();
        for name in names {
            responses.push(self.create_certificate(name).await?);
        }
        Ok(responses)
    }

    /// Create one certificate. The jail is torn down on every exit path,
    /// success or failure.
    pub async fn create_certificate(&self, name: &str) -> Result<CertificateResponse, CaError> {
        let cert_config = self
            .config
            .get_cert_config(name)
            .ok_or_else(|| CaError::CertConfigNotFound(name.to_string()))?;

        info!("Creating certificate '{}'", cert_config.name);

        if let Some(existing) = Certificate::get_by_name(&self.db, &cert_config.name).await? {
            warn!(
                "Certificate '{}' already exists. Skipping.",
                cert_config.name
            );
            return Ok(existing.into());
        }

        if cert_config.externally_managed {
            return self.persist_externally_managed(cert_config).await;
        }

        let module = load_module(&cert_config.module, &cert_config.name, &self.config, &self.db)?;

        let result = self.create_inner(module.as_ref(), cert_config).await;
        if let Err(e) = module.cleanup(true).await {
            warn!("Failed to tear down jail for '{}': {}", cert_config.name, e);
        }
        result
    }

    async fn create_inner(
        &self,
        module: &dyn CryptoModule,
        cert_config: &CertificateConfig,
    ) -> Result<CertificateResponse, CaError> {
        // Resolve the signing side before touching the jail so chained
        // misconfiguration fails fast.
        let signing = match &cert_config.signed_by {
            Some(parent_name) => {
                let signing_config = self
                    .config
                    .get_cert_config(parent_name)
                    .ok_or_else(|| CaError::CertConfigNotFound(parent_name.clone()))?;
                if signing_config.externally_managed {
                    return Err(CaError::GenCert(format!(
                        "Signing certificate '{}' is externally managed. Please sign '{}' manually.",
                        parent_name, cert_config.name
                    )));
                }
                let signing_row = Certificate::get_by_name(&self.db, parent_name)
                    .await?
                    .ok_or_else(|| {
                        CaError::GenCert(format!(
                            "Signing certificate '{parent_name}' not found in database"
                        ))
                    })?;
                Some((signing_config, signing_row))
            }
            None => None,
        };

        module.create_environment().await?;

        let (key_pem, pubkey_pem) = module.generate_private_key(cert_config).await?;
        let csr_pem = module.generate_csr(cert_config, &key_pem).await?;

        let issued = match signing {
            Some((signing_config, signing_row)) => {
                let signing_crt = signing_row.crt_pem.as_deref().ok_or_else(|| {
                    CaError::GenCert(format!(
                        "Signing certificate '{}' has no certificate PEM",
                        signing_config.name
                    ))
                })?;
                let stored_key = signing_row.pkey_pem.as_deref().ok_or_else(|| {
                    CaError::GenCert(format!(
                        "Signing certificate '{}' has no private key",
                        signing_config.name
                    ))
                })?;

                let signing_key = self.load_private_key(stored_key)?;
                module
                    .sign_ca_certificate(
                        cert_config,
                        signing_config,
                        signing_crt,
                        &signing_key,
                        &csr_pem,
                    )
                    .await?
            }
            None => {
                module
                    .generate_ca_certificate(cert_config, &key_pem, &csr_pem)
                    .await?
            }
        };

        let crl = module
            .generate_crl(cert_config, &key_pem, &issued.pem)
            .await?;

        let stored_key = if self.config.security.data_encryption.enabled {
            info!(
                "Encrypting private key for '{}' with aes256.",
                cert_config.name
            );
            crypto::encrypt(&key_pem, &self.config.security.data_encryption.password)
                .map_err(|e| CaError::Module(e.to_string()))?
        } else {
            key_pem.to_string()
        };
        drop(key_pem);

        self.persist_issued(cert_config, &issued, &crl, &csr_pem, &pubkey_pem, &stored_key)
            .await?;

        Ok(CertificateResponse {
            name: cert_config.name.clone(),
            crt_pem: Some(issued.pem),
            crl_pem: Some(crl.pem),
        })
    }

    /// Decrypt a stored private key when the at-rest policy is enabled.
    fn load_private_key(&self, stored: &str) -> Result<Zeroizing<String>, CaError> {
        if self.config.security.data_encryption.enabled && crypto::is_encrypted(stored) {
            crypto::decrypt(stored, &self.config.security.data_encryption.password)
                .map_err(|e| CaError::Module(e.to_string()))
        } else {
            Ok(Zeroizing::new(stored.to_string()))
        }
    }

    async fn persist_externally_managed(
        &self,
        cert_config: &CertificateConfig,
    ) -> Result<CertificateResponse, CaError> {
        info!(
            "Certificate '{}' is externally managed. Adding data directly to database.",
            cert_config.name
        );
        let (Some(crt_pem), Some(crl_pem)) = (&cert_config.certificate_pem, &cert_config.crl_pem)
        else {
            return Err(CaError::GenCert(format!(
                "Externally managed certificate '{}' must have certificate and crl pem defined in the config.",
                cert_config.name
            )));
        };

        sqlx::query(
            "INSERT INTO certificate (name, externally_managed, module, crt_pem, crl_pem) \
             VALUES (?, 1, ?, ?, ?)",
        )
        .bind(&cert_config.name)
        .bind(&cert_config.module)
        .bind(crt_pem)
        .bind(crl_pem)
        .execute(&self.db)
        .await?;

        Ok(CertificateResponse {
            name: cert_config.name.clone(),
            crt_pem: Some(crt_pem.clone()),
            crl_pem: Some(crl_pem.clone()),
        })
    }

    /// The certificate row and every harvested counter row commit or
    /// roll back together.
    async fn persist_issued(
        &self,
        cert_config: &CertificateConfig,
        issued: &IssueOutput,
        crl: &IssueOutput,
        csr_pem: &str,
        pubkey_pem: &str,
        stored_key: &str,
    ) -> Result<(), CaError> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO certificate \
             (name, externally_managed, module, crt_pem, pkey_pem, pubkey_pem, csr_pem, crl_pem) \
             VALUES (?, 0, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cert_config.name)
        .bind(&cert_config.module)
        .bind(&issued.pem)
        .bind(stored_key)
        .bind(pubkey_pem)
        .bind(csr_pem)
        .bind(&crl.pem)
        .execute(&mut *tx)
        .await?;

        // The CRL run re-harvests the same rows; later entries win.
        let mut merged: Vec<&OpensslData> = Vec::new();
        for data in issued.harvest.iter().chain(crl.harvest.iter()) {
            merged.retain(|d| d.cert_name != data.cert_name);
            merged.push(data);
        }
        for data in merged {
            data.upsert(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const YAML: &str = "\
sigil_ca:
  x509_certificates:
    - name: vendor-root
      externally_managed: true
      certificate_pem: |
        -----BEGIN CERTIFICATE-----
        dmVuZG9y
        -----END CERTIFICATE-----
      crl_pem: |
        -----BEGIN X509 CRL-----
        dmVuZG9y
        -----END X509 CRL-----
    - name: broken-external
      externally_managed: true
    - name: orphan
      signed_by: ghost
      module_args:
        profile: root
    - name: child-of-vendor
      signed_by: vendor-root
      module_args:
        profile: root
    - name: child-of-missing
      signed_by: offline-root
      module_args:
        profile: root
    - name: offline-root
      module_args:
        profile: root
sigil_acme:
  profiles:
    - name: internal
      ca: root
      default: true
";

    async fn service() -> CertificateService {
        let config = Config::from_yaml(YAML).unwrap();
        let db = crate::db::test_pool().await;
        CertificateService::new(config.sigil_ca, db)
    }

    #[tokio::test]
    async fn test_unknown_name_is_config_not_found() {
        let service = service().await;
        let err = service.create_certificate("nope").await.unwrap_err();
        assert!(matches!(err, CaError::CertConfigNotFound(_)));
    }

    #[tokio::test]
    async fn test_externally_managed_persists_config_pems() {
        let service = service().await;
        let response = service.create_certificate("vendor-root").await.unwrap();
        assert!(response.crt_pem.unwrap().contains("BEGIN CERTIFICATE"));

        let row = Certificate::get_by_name(&service.db, "vendor-root")
            .await
            .unwrap()
            .unwrap();
        assert!(row.externally_managed);
        assert!(row.pkey_pem.is_none());
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let service = service().await;
        service.create_certificate("vendor-root").await.unwrap();
        // Second run short-circuits on the existing ledger row
        let response = service.create_certificate("vendor-root").await.unwrap();
        assert_eq!(response.name, "vendor-root");

        let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM certificate")
            .fetch_one(&service.db)
            .await
            .unwrap();
        assert_eq!(rows.0, 1);
    }

    #[tokio::test]
    async fn test_externally_managed_requires_both_pems() {
        let service = service().await;
        let err = service
            .create_certificate("broken-external")
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::GenCert(_)));
    }

    #[tokio::test]
    async fn test_chaining_onto_externally_managed_parent_is_refused() {
        let service = service().await;
        service.create_certificate("vendor-root").await.unwrap();

        let err = service
            .create_certificate("child-of-vendor")
            .await
            .unwrap_err();
        match err {
            CaError::GenCert(msg) => assert!(msg.contains("externally managed")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chaining_requires_parent_ledger_row() {
        let service = service().await;
        let err = service
            .create_certificate("child-of-missing")
            .await
            .unwrap_err();
        match err {
            CaError::GenCert(msg) => assert!(msg.contains("not found in database")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chaining_requires_parent_config() {
        let service = service().await;
        let err = service.create_certificate("orphan").await.unwrap_err();
        assert!(matches!(err, CaError::CertConfigNotFound(_)));
    }

    #[tokio::test]
    async fn test_status_reports_creation_state() {
        let service = service().await;
        service.create_certificate("vendor-root").await.unwrap();

        let statuses = service.status().await.unwrap();
        let by_name: std::collections::HashMap<_, _> = statuses
            .iter()
            .map(|s| (s.name.as_str(), s.status))
            .collect();
        assert_eq!(by_name["vendor-root"], "created");
        assert_eq!(by_name["offline-root"], "not_created");
    }
}
