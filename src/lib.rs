pub mod acme;
pub mod api;
pub mod ca;
pub mod config;
pub mod crypto;
pub mod db;
pub mod logging;

pub use db::DbPool;

use acme::nonce::NonceManager;
use config::{AcmeConfig, CaConfig};

/// Shared state of the CA plane's HTTP API.
pub struct CaState {
    pub config: CaConfig,
    pub db: DbPool,
}

impl CaState {
    pub fn new(config: CaConfig, db: DbPool) -> Self {
        Self { config, db }
    }
}

/// Shared state of the ACME server.
pub struct AcmeState {
    pub config: AcmeConfig,
    pub db: DbPool,
    pub nonces: NonceManager,
}

impl AcmeState {
    pub fn new(config: AcmeConfig, db: DbPool) -> Self {
        let nonces = NonceManager::new(config.nonce_ttl_seconds);
        Self { config, db, nonces }
    }
}
