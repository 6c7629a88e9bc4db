//! Shared application state for the API server.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use threshold_orchestrator::{Accepted, Health, Intent, SignatureResponse, SigningService};
use threshold_types::Error;

/// What the routes need from the signing node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    async fn submit(&self, intent: Intent) -> Result<Accepted, Error>;

    async fn unlock(&self, intent: Intent) -> Result<SignatureResponse, Error>;

    async fn status(&self, id: &str) -> Result<Vec<u8>, Error>;

    fn confirmations(&self, chain_id: u64) -> Result<BTreeMap<u64, u64>, Error>;

    async fn health(&self) -> Health;
}

#[async_trait]
impl Signer for SigningService {
    async fn submit(&self, intent: Intent) -> Result<Accepted, Error> {
        SigningService::submit(self, intent).await
    }

    async fn unlock(&self, intent: Intent) -> Result<SignatureResponse, Error> {
        SigningService::unlock(self, intent).await
    }

    async fn status(&self, id: &str) -> Result<Vec<u8>, Error> {
        SigningService::status(self, id).await
    }

    fn confirmations(&self, chain_id: u64) -> Result<BTreeMap<u64, u64>, Error> {
        SigningService::confirmations(self, chain_id)
    }

    async fn health(&self) -> Health {
        SigningService::health(self).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub signer: Arc<dyn Signer>,
}

impl AppState {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }
}
