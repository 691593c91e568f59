//! The certificate-issuance engine: the jail, the pluggable crypto
//! modules that drive the external certificate tool inside it, and the
//! service that orchestrates issuance against the ledger.

pub mod jail;
pub mod openssl;
pub mod service;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{CaConfig, CertificateConfig};
use crate::db::{DbPool, OpensslData};

#[derive(Debug, Error)]
pub enum CaError {
    #[error("File already exists in jail: {0}")]
    FileExists(PathBuf),
    #[error("Jail I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to generate private key: {0}")]
    GenPkey(String),
    #[error("Failed to generate csr: {0}")]
    GenCsr(String),
    #[error("Failed to generate certificate: {0}")]
    GenCert(String),
    #[error("Failed to generate crl: {0}")]
    GenCrl(String),
    #[error("Certificate with name '{0}' not found in config")]
    CertConfigNotFound(String),
    #[error("Unknown crypto module '{0}'")]
    UnknownModule(String),
    #[error("Module error: {0}")]
    Module(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// PEM output of an issuance operation together with the counter rows
/// harvested from the jail. The caller persists the harvest and the
/// certificate in one transaction.
#[derive(Debug)]
pub struct IssueOutput {
    pub pem: String,
    pub harvest: Vec<OpensslData>,
}

/// Capability set of a certificate backend. The default implementation
/// drives an openssl-compatible command line tool inside the jail.
#[async_trait]
pub trait CryptoModule: Send + Sync {
    /// Populate the jail with everything the external tool needs to run.
    async fn create_environment(&self) -> Result<(), CaError>;

    /// Generate a key pair, returning (private PEM, public PEM).
    async fn generate_private_key(
        &self,
        cert: &CertificateConfig,
    ) -> Result<(Zeroizing<String>, String), CaError>;

    async fn generate_csr(
        &self,
        cert: &CertificateConfig,
        key_pem: &str,
    ) -> Result<String, CaError>;

    /// Self-sign a root CA certificate.
    async fn generate_ca_certificate(
        &self,
        cert: &CertificateConfig,
        key_pem: &str,
        csr_pem: &str,
    ) -> Result<IssueOutput, CaError>;

    /// Sign a child CA's CSR with its parent's key. The harvest carries
    /// updated counters for both sides.
    async fn sign_ca_certificate(
        &self,
        cert: &CertificateConfig,
        signing_cert: &CertificateConfig,
        signing_crt_pem: &str,
        signing_key_pem: &str,
        csr_pem: &str,
    ) -> Result<IssueOutput, CaError>;

    async fn generate_crl(
        &self,
        cert: &CertificateConfig,
        key_pem: &str,
        crt_pem: &str,
    ) -> Result<IssueOutput, CaError>;

    /// Remove staged state. `full` tears down the whole jail tree.
    async fn cleanup(&self, full: bool) -> Result<(), CaError>;
}

type ModuleFactory = fn(&CaConfig, &str, DbPool) -> Arc<dyn CryptoModule>;

/// Registry of named crypto module factories, resolved at startup.
const MODULES: &[(&str, ModuleFactory)] = &[("openssl", openssl::OpensslModule::factory)];

/// Instantiate the crypto module configured for a certificate. The jail
/// root is derived from the certificate name so concurrent issuance of
/// different names cannot collide.
pub fn load_module(
    module_name: &str,
    cert_name: &str,
    config: &CaConfig,
    db: &DbPool,
) -> Result<Arc<dyn CryptoModule>, CaError> {
    for (name, factory) in MODULES {
        if *name == module_name {
            return Ok(factory(config, cert_name, db.clone()));
        }
    }
    Err(CaError::UnknownModule(module_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_module_by_name() {
        let db = crate::db::test_pool().await;
        let config = CaConfig::default();
        assert!(load_module("openssl", "root", &config, &db).is_ok());
        assert!(matches!(
            load_module("gpg", "root", &config, &db),
            Err(CaError::UnknownModule(_))
        ));
    }
}
