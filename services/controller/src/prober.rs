//! Provider existence checks.

use std::sync::Arc;

use gcefleet_compute::{ComputeProvider, ProviderResult};
use tracing::debug;

/// Answers whether a provider resource still exists.
#[derive(Clone)]
pub struct ExistenceProber {
    provider: Arc<dyn ComputeProvider>,
}

impl ExistenceProber {
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self { provider }
    }

    /// Returns `Ok(false)` only for a 404. Any other failure is returned as
    /// an error so callers never mistake an outage for a deletion.
    pub async fn exists(&self, url: &str) -> ProviderResult<bool> {
        match self.provider.get(url).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!(url = %url, "Resource not found");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
