//! Telemetry Pollers
//!
//! Two background loops bound to a connected session:
//!
//! | Poller | Trigger | Writes |
//! |--------|---------|--------|
//! | Egress | immediately, then every 5s until the first success | `telemetry` |
//! | Usage | every completed exchange routed through the proxy | `usage[profile].down` |
//!
//! Both are owned by [`TelemetryPollers`] and aborted together when it is
//! dropped. Failures stay local: a failed lookup stores the sentinel
//! values and the connection is unaffected.

use crate::profile::ProfileId;
use crate::store::{Records, Telemetry};
use async_trait::async_trait;
use fos_network::{CompletedExchange, HttpClient, HttpError};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// IP/geolocation service
pub const DEFAULT_LOOKUP_URL: &str = "https://ipwho.is/";

/// Egress lookup period until the first success
pub const EGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Egress lookup errors
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Lookup service returned HTTP {0}")]
    Status(u16),

    #[error("Invalid lookup response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Lookup service error: {0}")]
    Service(String),
}

/// Public IP and location lookup
#[async_trait]
pub trait EgressLookup: Send + Sync {
    async fn lookup(&self) -> Result<Telemetry, LookupError>;
}

#[derive(Debug, Deserialize)]
struct IpWhoIsResponse {
    #[serde(default)]
    success: bool,
    ip: Option<String>,
    country: Option<String>,
    message: Option<String>,
}

/// ipwho.is lookup through the proxy-aware client
pub struct IpWhoIs {
    client: HttpClient,
    url: String,
}

impl IpWhoIs {
    pub fn new(client: HttpClient) -> Self {
        Self::with_url(client, DEFAULT_LOOKUP_URL)
    }

    pub fn with_url(client: HttpClient, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }

    fn parse(body: &[u8]) -> Result<Telemetry, LookupError> {
        let data: IpWhoIsResponse = serde_json::from_slice(body)?;
        if !data.success {
            return Err(LookupError::Service(
                data.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        Ok(Telemetry {
            public_ip: data.ip.unwrap_or_else(|| "Unknown".to_string()),
            location: data.country.unwrap_or_else(|| "Unknown".to_string()),
        })
    }
}

#[async_trait]
impl EgressLookup for IpWhoIs {
    async fn lookup(&self) -> Result<Telemetry, LookupError> {
        let response = self.client.get(&self.url).await?;
        if !response.is_success() {
            return Err(LookupError::Status(response.status.as_u16()));
        }
        Self::parse(&response.body)
    }
}

/// Exchange feed observed by the usage poller
pub trait UsageSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<CompletedExchange>;
}

impl UsageSource for HttpClient {
    fn subscribe(&self) -> broadcast::Receiver<CompletedExchange> {
        self.subscribe_exchanges()
    }
}

impl UsageSource for broadcast::Sender<CompletedExchange> {
    fn subscribe(&self) -> broadcast::Receiver<CompletedExchange> {
        broadcast::Sender::subscribe(self)
    }
}

/// Run one egress lookup and store the outcome
///
/// Returns whether the lookup succeeded.
pub async fn refresh_egress(lookup: &dyn EgressLookup, records: &Records) -> bool {
    debug!("Fetching public IP");
    let (telemetry, ok) = match lookup.lookup().await {
        Ok(telemetry) => {
            info!("Public IP detected: {} ({})", telemetry.public_ip, telemetry.location);
            (telemetry, true)
        }
        Err(e) => {
            warn!("Egress lookup failed: {}", e);
            (Telemetry::failed(), false)
        }
    };

    if let Err(e) = records.set_telemetry(&telemetry).await {
        warn!("Failed to store telemetry: {}", e);
    }
    ok
}

/// Handles to the pollers of one session
pub struct TelemetryPollers {
    profile: ProfileId,
    lookup: Arc<dyn EgressLookup>,
    records: Records,
    egress: JoinHandle<()>,
    refresh: Option<JoinHandle<()>>,
    usage: JoinHandle<()>,
}

impl TelemetryPollers {
    /// Start both pollers for `profile`
    ///
    /// The exchange feed is subscribed before returning, so nothing
    /// completed after this call is missed.
    pub fn start(
        profile: ProfileId,
        lookup: Arc<dyn EgressLookup>,
        usage: &dyn UsageSource,
        records: Records,
    ) -> Self {
        info!("Starting telemetry for {}", profile);

        let egress = tokio::spawn(Self::egress_loop(lookup.clone(), records.clone()));
        let usage = tokio::spawn(Self::usage_loop(profile, usage.subscribe(), records.clone()));

        Self {
            profile,
            lookup,
            records,
            egress,
            refresh: None,
            usage,
        }
    }

    pub fn profile(&self) -> ProfileId {
        self.profile
    }

    /// Whether the periodic egress lookup is still armed
    pub fn egress_active(&self) -> bool {
        !self.egress.is_finished()
    }

    /// Re-arm a single additional lookup
    pub fn refresh(&mut self) {
        if let Some(previous) = self.refresh.take() {
            previous.abort();
        }
        let lookup = self.lookup.clone();
        let records = self.records.clone();
        self.refresh = Some(tokio::spawn(async move {
            refresh_egress(lookup.as_ref(), &records).await;
        }));
    }

    /// Abort every poller
    pub fn stop(self) {
        debug!("Stopping telemetry for {}", self.profile);
    }

    async fn egress_loop(lookup: Arc<dyn EgressLookup>, records: Records) {
        let mut ticker = tokio::time::interval(EGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if refresh_egress(lookup.as_ref(), &records).await {
                debug!("Egress known, periodic lookup stopped");
                return;
            }
        }
    }

    async fn usage_loop(
        profile: ProfileId,
        mut exchanges: broadcast::Receiver<CompletedExchange>,
        records: Records,
    ) {
        loop {
            let mut bytes = match exchanges.recv().await {
                Ok(exchange) => counted_bytes(&exchange),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Usage poller lagged, {} exchanges not counted", missed);
                    continue;
                }
                Err(RecvError::Closed) => return,
            };

            // Everything already queued goes into the same write
            let mut closed = false;
            loop {
                match exchanges.try_recv() {
                    Ok(exchange) => bytes = bytes.saturating_add(counted_bytes(&exchange)),
                    Err(TryRecvError::Lagged(missed)) => {
                        warn!("Usage poller lagged, {} exchanges not counted", missed);
                    }
                    Err(TryRecvError::Closed) => {
                        closed = true;
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }

            if bytes > 0 {
                match records.add_usage(profile, bytes).await {
                    Ok(total) => debug!("Usage {} += {} ({} total)", profile, bytes, total),
                    Err(e) => warn!("Failed to record usage: {}", e),
                }
            }
            if closed {
                return;
            }
        }
    }
}

/// Downstream bytes an exchange adds to the session's usage
fn counted_bytes(exchange: &CompletedExchange) -> u64 {
    match exchange.content_length {
        Some(bytes) if exchange.proxied => bytes,
        _ => 0,
    }
}

impl Drop for TelemetryPollers {
    fn drop(&mut self) {
        self.egress.abort();
        self.usage.abort();
        if let Some(refresh) = &self.refresh {
            refresh.abort();
        }
    }
}
