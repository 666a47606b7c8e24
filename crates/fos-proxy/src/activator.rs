//! Proxy Activator
//!
//! Applies and clears the proxy rule on the routing platform and answers
//! authentication challenges with the credentials of the active profile.
//!
//! The activator never advances the state machine itself: a rejected rule
//! is returned to the caller, which treats it like a failed probe.

use crate::event::Notifier;
use crate::profile::{ProfileError, ProxyProfile};
use async_trait::async_trait;
use fos_network::{
    AuthChallenge, AuthHandler, CookieJar, Credentials, NetworkSettings, ProxyMode, ProxyRule,
    ProxyServer, RouteError,
};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Toast raised when a challenge cannot be answered
pub const NO_CREDENTIALS_NOTICE: &str = "Proxy requires authentication but no credentials provided";

/// Activation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivationError {
    #[error("Invalid proxy configuration: {0}")]
    Invalid(#[from] ProfileError),

    #[error("Failed to configure proxy: {0}")]
    Rejected(#[from] RouteError),
}

/// The routing mechanism the activator configures
#[async_trait]
pub trait ProxyPlatform: Send + Sync {
    /// Route traffic through `rule`
    async fn apply(&self, rule: ProxyRule) -> Result<(), RouteError>;

    /// Return to direct routing
    async fn clear(&self);

    /// Currently effective mode
    async fn mode(&self) -> ProxyMode;

    /// Purge stored cookies, returning how many were removed
    async fn clear_cookies(&self) -> usize;
}

/// [`ProxyPlatform`] over the in-process network layer
#[derive(Debug, Clone, Default)]
pub struct SessionPlatform {
    settings: NetworkSettings,
    cookies: CookieJar,
}

impl SessionPlatform {
    pub fn new(settings: NetworkSettings, cookies: CookieJar) -> Self {
        Self { settings, cookies }
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }
}

#[async_trait]
impl ProxyPlatform for SessionPlatform {
    async fn apply(&self, rule: ProxyRule) -> Result<(), RouteError> {
        self.settings.apply(rule)
    }

    async fn clear(&self) {
        self.settings.clear();
    }

    async fn mode(&self) -> ProxyMode {
        self.settings.mode()
    }

    async fn clear_cookies(&self) -> usize {
        self.cookies.clear()
    }
}

/// Credentials of the profile being activated
#[derive(Debug, Clone)]
struct ActiveCredentials {
    profile: String,
    credentials: Option<Credentials>,
}

/// Applies profiles to a [`ProxyPlatform`]
pub struct ProxyActivator {
    platform: Arc<dyn ProxyPlatform>,
    notifier: Notifier,
    active: RwLock<Option<ActiveCredentials>>,
}

impl ProxyActivator {
    pub fn new(platform: Arc<dyn ProxyPlatform>, notifier: Notifier) -> Self {
        Self {
            platform,
            notifier,
            active: RwLock::new(None),
        }
    }

    pub fn platform(&self) -> &Arc<dyn ProxyPlatform> {
        &self.platform
    }

    /// Validate `profile` and apply a single fixed proxy rule for it
    ///
    /// Local addresses bypass the proxy.
    pub async fn activate(&self, profile: &ProxyProfile) -> Result<ProxyServer, ActivationError> {
        let server = profile.validate()?;
        info!("Applying proxy configuration for {}", profile.display_name());

        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(ActiveCredentials {
            profile: profile.display_name().to_string(),
            credentials: profile.credentials(),
        });

        if let Err(e) = self.platform.apply(ProxyRule::single(server.clone())).await {
            warn!("Failed to set proxy {}: {}", server, e);
            let error = ActivationError::from(e);
            self.notifier.toast(error.to_string());
            return Err(error);
        }

        debug!("Proxy configuration applied: {}", server);
        Ok(server)
    }

    /// Clear the rule, purging cookies when asked
    pub async fn deactivate(&self, clear_cookies: bool) {
        self.active.write().unwrap_or_else(|e| e.into_inner()).take();
        self.platform.clear().await;

        if clear_cookies {
            let purged = self.platform.clear_cookies().await;
            debug!("Purged {} cookies", purged);
        }
    }

    /// Credentials for a challenge from the active proxy
    pub fn supply_credentials(&self, challenge: &AuthChallenge) -> Option<Credentials> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());

        match active.as_ref().and_then(|a| a.credentials.clone().map(|c| (&a.profile, c))) {
            Some((profile, credentials)) => {
                info!(
                    "Providing credentials for user {} ({}) to {}",
                    credentials.username, profile, challenge.proxy
                );
                Some(credentials)
            }
            None => {
                warn!(
                    "Authentication required by {} (realm {:?}), no credentials available",
                    challenge.proxy, challenge.realm
                );
                self.notifier.toast(NO_CREDENTIALS_NOTICE);
                None
            }
        }
    }
}

impl AuthHandler for ProxyActivator {
    fn credentials(&self, challenge: &AuthChallenge) -> Option<Credentials> {
        self.supply_credentials(challenge)
    }
}
