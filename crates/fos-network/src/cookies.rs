//! Cookie Jar
//!
//! Minimal per-host cookie storage. Only `name=value` pairs are kept;
//! attributes (`Path`, `Expires`, ...) are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Shared cookie storage keyed by host
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    inner: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the cookie carried by a `Set-Cookie` header value
    pub fn record(&self, host: &str, set_cookie: &str) {
        let pair = set_cookie.split(';').next().unwrap_or("").trim();
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        if name.trim().is_empty() {
            return;
        }

        let mut jar = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        jar.entry(host.to_ascii_lowercase())
            .or_default()
            .insert(name.trim().to_string(), value.trim().to_string());
    }

    /// `Cookie` header value for a host, if any cookies are stored
    pub fn header_for(&self, host: &str) -> Option<String> {
        let jar = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cookies = jar.get(&host.to_ascii_lowercase())?;
        if cookies.is_empty() {
            return None;
        }

        let mut pairs: Vec<String> = cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        pairs.sort();
        Some(pairs.join("; "))
    }

    /// Number of stored cookies across all hosts
    pub fn len(&self) -> usize {
        let jar = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        jar.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every cookie, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut jar = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let removed = jar.values().map(HashMap::len).sum();
        jar.clear();
        debug!("Cookie jar cleared ({} cookies)", removed);
        removed
    }
}
