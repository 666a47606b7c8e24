//! Shared fakes for lifecycle scenario tests
#![allow(dead_code)]

use async_trait::async_trait;
use fos_network::{CompletedExchange, Method, ProxyScheme};
use fos_proxy::{
    BridgeError, Collaborators, ConnectionManager, EgressLookup, HelperConnector, HelperPort,
    LookupError, MemoryStore, Probe, ProbeError, ProxyProfile, Records, SessionPlatform, Settings,
    StatusEvent, Telemetry,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const EGRESS_IP: &str = "203.0.113.7";

/// Probe that fails for configured proxy hosts and records every attempt
pub struct HostProbe {
    platform: SessionPlatform,
    failing: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<(String, Instant)>>,
}

impl HostProbe {
    pub fn new(platform: SessionPlatform) -> Self {
        Self {
            platform,
            failing: Mutex::new(HashSet::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(&self, host: &str) {
        self.failing.lock().unwrap().insert(host.to_string());
    }

    pub fn heal(&self, host: &str) {
        self.failing.lock().unwrap().remove(host);
    }

    pub fn attempts(&self) -> Vec<(String, Instant)> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.attempts().into_iter().map(|(host, _)| host).collect()
    }
}

#[async_trait]
impl Probe for HostProbe {
    async fn check(&self, timeout: Duration) -> Result<(), ProbeError> {
        let mode = self.platform.settings().mode();
        let Some(rule) = mode.rule() else {
            self.attempts.lock().unwrap().push((String::new(), Instant::now()));
            return Err(ProbeError::NotConfigured);
        };

        let host = rule.server.host.clone();
        self.attempts.lock().unwrap().push((host.clone(), Instant::now()));
        if self.failing.lock().unwrap().contains(&host) {
            Err(ProbeError::Timeout(timeout))
        } else {
            Ok(())
        }
    }
}

/// Egress lookup with a switchable outcome
pub struct FakeLookup {
    calls: AtomicUsize,
    succeed: AtomicBool,
}

impl FakeLookup {
    pub fn new(succeed: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            succeed: AtomicBool::new(succeed),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }
}

#[async_trait]
impl EgressLookup for FakeLookup {
    async fn lookup(&self) -> Result<Telemetry, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed.load(Ordering::SeqCst) {
            Ok(Telemetry {
                public_ip: EGRESS_IP.to_string(),
                location: "Netherlands".to_string(),
            })
        } else {
            Err(LookupError::Service("unavailable".to_string()))
        }
    }
}

/// Helper that is never installed
pub struct NoHelper;

#[async_trait]
impl HelperConnector for NoHelper {
    async fn connect(&self) -> Result<Box<dyn HelperPort>, BridgeError> {
        Err(BridgeError::Spawn(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "helper not installed",
        )))
    }
}

pub struct Harness {
    pub manager: ConnectionManager,
    pub store: Arc<MemoryStore>,
    pub records: Records,
    pub platform: SessionPlatform,
    pub probe: Arc<HostProbe>,
    pub lookup: Arc<FakeLookup>,
    pub feed: broadcast::Sender<CompletedExchange>,
}

impl Harness {
    pub async fn start(settings: Settings) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), settings).await
    }

    /// Start on a pre-populated store
    pub async fn with_store(store: Arc<MemoryStore>, settings: Settings) -> Self {
        let records = Records::new(store.clone());
        records.set_settings(&settings).await.unwrap();

        let platform = SessionPlatform::default();
        let probe = Arc::new(HostProbe::new(platform.clone()));
        let lookup = Arc::new(FakeLookup::new(true));
        let feed = broadcast::channel(64).0;

        let manager = ConnectionManager::start(Collaborators {
            store: store.clone(),
            platform: Arc::new(platform.clone()),
            probe: probe.clone(),
            lookup: lookup.clone(),
            usage: Arc::new(feed.clone()),
            helper: Arc::new(NoHelper),
        })
        .await
        .unwrap();

        Self {
            manager,
            store,
            records,
            platform,
            probe,
            lookup,
            feed,
        }
    }

    /// Whether a fixed proxy rule is currently applied
    pub fn proxy_applied(&self) -> bool {
        self.platform.settings().mode().is_fixed_servers()
    }
}

pub fn settings(max_retries: u32) -> Settings {
    Settings {
        max_retries,
        ..Settings::default()
    }
}

pub fn profile(name: &str, host: &str) -> ProxyProfile {
    let mut profile = ProxyProfile::new(name, ProxyScheme::Http, host, 8080);
    profile.ensure_id();
    profile
}

pub fn exchange(bytes: u64) -> CompletedExchange {
    CompletedExchange {
        url: "https://example.com/".to_string(),
        method: Method::GET,
        status: 200,
        content_length: Some(bytes),
        proxied: true,
    }
}

/// Everything published so far
pub fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn toasts(events: &[StatusEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Toast { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn states(events: &[StatusEvent]) -> Vec<fos_proxy::ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::StatusUpdate { state } => Some(*state),
            _ => None,
        })
        .collect()
}

/// Let spawned tasks run without moving the paused clock far
pub async fn settle_tasks() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
