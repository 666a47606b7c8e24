//! Proxy Routing Settings
//!
//! The in-process equivalent of a platform proxy setting. A single
//! [`NetworkSettings`] value is shared by everything that opens
//! connections; whoever owns the proxy lifecycle applies or clears a
//! [`ProxyRule`] on it and every client picks the change up on its next
//! request.
//!
//! # Modes
//!
//! | Mode | Behavior |
//! |------|----------|
//! | `Direct` | No proxy, connect straight to the target |
//! | `FixedServers` | One proxy for everything outside the bypass list |

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Bypass entry matching loopback addresses and dotless host names
pub const LOCAL_BYPASS: &str = "<local>";

/// Proxy protocol spoken by the upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    /// HTTP proxy (`CONNECT` for TLS, absolute-form for plain HTTP)
    Http,
    /// SOCKS5 proxy
    Socks5,
}

impl ProxyScheme {
    /// Scheme as written in proxy URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProxyScheme {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyScheme::Http),
            "socks5" => Ok(ProxyScheme::Socks5),
            _ => Err(RouteError::UnsupportedScheme(s.to_string())),
        }
    }
}

/// Upstream proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyServer {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

impl ProxyServer {
    /// Create a new proxy endpoint
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// A single fixed proxy plus the hosts that skip it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRule {
    pub server: ProxyServer,
    pub bypass_list: Vec<String>,
}

impl ProxyRule {
    /// Route everything through `server` except local addresses
    pub fn single(server: ProxyServer) -> Self {
        Self {
            server,
            bypass_list: vec![LOCAL_BYPASS.to_string()],
        }
    }

    /// Check whether a target host skips the proxy
    pub fn bypasses(&self, host: &str) -> bool {
        self.bypass_list.iter().any(|entry| {
            if entry == LOCAL_BYPASS {
                is_local_host(host)
            } else if let Some(suffix) = entry.strip_prefix("*.") {
                host.len() > suffix.len()
                    && host.to_ascii_lowercase().ends_with(&format!(".{}", suffix.to_ascii_lowercase()))
            } else {
                host.eq_ignore_ascii_case(entry)
            }
        })
    }

    fn validate(&self) -> Result<(), RouteError> {
        if self.server.host.trim().is_empty() {
            return Err(RouteError::InvalidValue("empty proxy host".into()));
        }
        if self.server.port == 0 {
            return Err(RouteError::InvalidValue("proxy port 0".into()));
        }
        Ok(())
    }
}

/// Loopback addresses, `localhost` and plain host names without a dot
fn is_local_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }
    !host.contains('.')
}

/// Active proxy mode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxyMode {
    /// No proxy configured
    #[default]
    Direct,
    /// All traffic through a single proxy
    FixedServers(ProxyRule),
}

impl ProxyMode {
    pub fn is_fixed_servers(&self) -> bool {
        matches!(self, ProxyMode::FixedServers(_))
    }

    /// The active rule, if any
    pub fn rule(&self) -> Option<&ProxyRule> {
        match self {
            ProxyMode::Direct => None,
            ProxyMode::FixedServers(rule) => Some(rule),
        }
    }
}

/// How a single request reaches its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy(ProxyServer),
}

/// Routing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid proxy value: {0}")]
    InvalidValue(String),

    #[error("Permission denied: proxy settings are controlled elsewhere")]
    PermissionDenied,
}

#[derive(Debug, Default)]
struct SettingsInner {
    mode: ProxyMode,
    locked: bool,
}

/// Shared routing state
///
/// Cloning is cheap; all clones observe the same mode.
#[derive(Debug, Clone, Default)]
pub struct NetworkSettings {
    inner: Arc<RwLock<SettingsInner>>,
}

impl NetworkSettings {
    /// Create settings in direct mode
    pub fn new() -> Self {
        Self::default()
    }

    /// Route all traffic through `rule`
    pub fn apply(&self, rule: ProxyRule) -> Result<(), RouteError> {
        rule.validate()?;

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.locked {
            warn!("Refusing proxy change to {}: settings locked", rule.server);
            return Err(RouteError::PermissionDenied);
        }

        info!("Proxy rule applied: {} (bypass: {:?})", rule.server, rule.bypass_list);
        inner.mode = ProxyMode::FixedServers(rule);
        Ok(())
    }

    /// Return to direct mode
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.mode.is_fixed_servers() {
            info!("Proxy rule cleared");
        }
        inner.mode = ProxyMode::Direct;
    }

    /// Snapshot of the current mode
    pub fn mode(&self) -> ProxyMode {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).mode.clone()
    }

    /// Decide the route for a target host
    pub fn route_for(&self, host: &str) -> Route {
        match self.mode() {
            ProxyMode::FixedServers(rule) if !rule.bypasses(host) => Route::Proxy(rule.server),
            _ => Route::Direct,
        }
    }

    /// Lock or unlock the settings (a policy-controlled setting rejects changes)
    pub fn set_locked(&self, locked: bool) {
        debug!("Network settings locked: {}", locked);
        self.inner.write().unwrap_or_else(|e| e.into_inner()).locked = locked;
    }
}
