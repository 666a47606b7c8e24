//! Proxy Profiles
//!
//! A profile is a named upstream proxy definition. Profiles are created
//! and edited elsewhere; the lifecycle only reads them, validates them at
//! connect time and, if one arrives without an identifier, assigns one.
//!
//! # Stored form
//!
//! ```json
//! { "uuid": "cbf4b43a-...", "name": "LocalProxy", "scheme": "socks5",
//!   "host": "127.0.0.1", "port": "10828", "username": "", "password": "" }
//! ```
//!
//! The port is accepted either as a number or as a numeric string, and
//! empty strings count as absent.

use fos_network::{Credentials, ProxyScheme, ProxyServer};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable profile identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub Uuid);

impl ProfileId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ProfileId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Profile validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile has no scheme")]
    MissingScheme,

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Profile has no host")]
    MissingHost,

    #[error("Profile has no port")]
    MissingPort,

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid proxy URL: {0}")]
    InvalidUrl(String),
}

/// A named upstream proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyProfile {
    /// Assigned lazily; immutable once set
    #[serde(rename = "uuid", default, deserialize_with = "id_from_any")]
    pub id: Option<ProfileId>,
    #[serde(default)]
    pub name: String,
    /// Raw scheme; checked by [`ProxyProfile::validate`]
    #[serde(default, deserialize_with = "string_from_any")]
    pub scheme: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default, deserialize_with = "port_from_any")]
    pub port: Option<u16>,
    #[serde(default, deserialize_with = "string_from_any", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "string_from_any", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyProfile {
    /// Create an unauthenticated profile
    pub fn new(name: impl Into<String>, scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: None,
            name: name.into(),
            scheme: Some(scheme.as_str().to_string()),
            host: host.into(),
            port: Some(port),
            username: None,
            password: None,
        }
    }

    /// Attach credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// The bundled local SOCKS5 profile, seeded when no profiles exist
    pub fn default_local() -> Self {
        let id = "cbf4b43a-1a71-40bd-a9de-ef13836d82b0"
            .parse()
            .ok();
        Self {
            id,
            ..Self::new("LocalProxy", ProxyScheme::Socks5, "127.0.0.1", 10828)
        }
    }

    /// Parse the `scheme://[user:pass@]host:port` form used for import
    pub fn parse_url(input: &str) -> Result<Self, ProfileError> {
        let url = url::Url::parse(input.trim()).map_err(|e| ProfileError::InvalidUrl(e.to_string()))?;
        let scheme: ProxyScheme = url
            .scheme()
            .parse()
            .map_err(|_| ProfileError::UnsupportedScheme(url.scheme().to_string()))?;
        let host = url.host_str().ok_or(ProfileError::MissingHost)?.to_string();
        let port = url.port_or_known_default().ok_or(ProfileError::MissingPort)?;

        let mut profile = Self::new(format!("{}-{}", host, port), scheme, host, port);
        profile.id = Some(ProfileId::generate());
        if !url.username().is_empty() {
            profile.username = Some(url.username().to_string());
            profile.password = url.password().map(str::to_string);
        }
        Ok(profile)
    }

    /// Identifier, assigning one on first use
    pub fn ensure_id(&mut self) -> ProfileId {
        *self.id.get_or_insert_with(ProfileId::generate)
    }

    /// Name for messages; falls back to the host
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.host
        } else {
            &self.name
        }
    }

    /// Check required fields and build the upstream endpoint
    pub fn validate(&self) -> Result<ProxyServer, ProfileError> {
        let raw = self
            .scheme
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ProfileError::MissingScheme)?;
        let scheme: ProxyScheme = raw
            .parse()
            .map_err(|_| ProfileError::UnsupportedScheme(raw.to_string()))?;

        let host = self.host.trim();
        if host.is_empty() {
            return Err(ProfileError::MissingHost);
        }

        let port = self.port.ok_or(ProfileError::MissingPort)?;
        if port == 0 {
            return Err(ProfileError::InvalidPort("0".into()));
        }

        Ok(ProxyServer::new(scheme, host, port))
    }

    /// Credentials, when both username and password are set
    pub fn credentials(&self) -> Option<Credentials> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some(Credentials::new(user, pass))
            }
            _ => None,
        }
    }

    /// Whether the profile carries any credential material
    pub fn has_auth(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            || self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Accepts strings and numbers; empty strings become `None`
fn string_from_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts `10828` or `"10828"`; anything unusable is treated as absent
fn port_from_any<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Empty or malformed identifiers are treated as unassigned
fn id_from_any<'de, D>(deserializer: D) -> Result<Option<ProfileId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.and_then(|s| s.trim().parse().ok()))
}
