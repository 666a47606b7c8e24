//! Network Probe
//!
//! Bounded-time reachability check through the active proxy. Any HTTP
//! response counts as reachable; the status code is not inspected.

use crate::activator::ProxyPlatform;
use async_trait::async_trait;
use fos_network::{HttpClient, HttpError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Well-known endpoint answering `204 No Content`
pub const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";

/// Probe failures
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Proxy not configured")]
    NotConfigured,

    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Probe failed: {0}")]
    Unreachable(#[from] HttpError),
}

/// Reachability check
#[async_trait]
pub trait Probe: Send + Sync {
    /// Succeeds when the endpoint answered within `timeout`
    async fn check(&self, timeout: Duration) -> Result<(), ProbeError>;
}

/// `HEAD` request through the proxy-aware client
pub struct HttpProbe {
    client: HttpClient,
    platform: Arc<dyn ProxyPlatform>,
    url: String,
}

impl HttpProbe {
    pub fn new(client: HttpClient, platform: Arc<dyn ProxyPlatform>) -> Self {
        Self::with_url(client, platform, DEFAULT_PROBE_URL)
    }

    pub fn with_url(client: HttpClient, platform: Arc<dyn ProxyPlatform>, url: impl Into<String>) -> Self {
        Self {
            client,
            platform,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, timeout: Duration) -> Result<(), ProbeError> {
        if !self.platform.mode().await.is_fixed_servers() {
            debug!("Probe skipped: proxy not properly configured");
            return Err(ProbeError::NotConfigured);
        }

        debug!("Probing {} (timeout {:?})", self.url, timeout);
        // The session timeout replaces the client's own request bound
        let response = match self.client.head_with_timeout(&self.url, timeout).await {
            Ok(response) => response,
            Err(HttpError::Timeout) => return Err(ProbeError::Timeout(timeout)),
            Err(e) => return Err(e.into()),
        };

        info!("Probe succeeded (HTTP {}, {:?})", response.status, response.total_time);
        Ok(())
    }
}
