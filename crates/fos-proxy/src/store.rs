//! Config Store
//!
//! Key/value persistence for profiles, settings and session bookkeeping.
//! The store itself is an external collaborator; the lifecycle sees it
//! only through the [`ConfigStore`] trait and the typed [`Records`]
//! facade over the named keys.
//!
//! # Keys
//!
//! | Key | Value |
//! |-----|-------|
//! | `profiles` | ordered list of [`ProxyProfile`] |
//! | `settings` | [`Settings`] |
//! | `connectedState` | [`ConnectionState`] |
//! | `connectedProfileId` / `connectingProfileId` | [`ProfileId`] |
//! | `sessionStart` | unix millis of the live session |
//! | `usage` | `{profileId: UsageRecord}` |
//! | `lastUsed` | `{profileId: LastUsed}` |
//! | `totalConnected` | `{profileId: millis}` |
//! | `telemetry` | [`Telemetry`] |
//!
//! Change notifications carry only the key. Consumers re-read the full
//! value, so duplicated or reordered notifications are harmless.

use crate::lifecycle::ConnectionState;
use crate::profile::{ProfileId, ProxyProfile};
use crate::settings::Settings;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Named keys
pub mod keys {
    pub const PROFILES: &str = "profiles";
    pub const SETTINGS: &str = "settings";
    pub const CONNECTED_STATE: &str = "connectedState";
    pub const CONNECTED_PROFILE_ID: &str = "connectedProfileId";
    pub const CONNECTING_PROFILE_ID: &str = "connectingProfileId";
    pub const SESSION_START: &str = "sessionStart";
    pub const USAGE: &str = "usage";
    pub const LAST_USED: &str = "lastUsed";
    pub const TOTAL_CONNECTED: &str = "totalConnected";
    pub const TELEMETRY: &str = "telemetry";
}

/// Placeholder shown while the first egress lookup is in flight
pub const TELEMETRY_PENDING: &str = "Fetching...";

/// Sentinel stored when an egress lookup fails
pub const TELEMETRY_FAILED: &str = "Fetching failed...";

/// Capacity of the change feed
const CHANGE_FEED_CAPACITY: usize = 64;

/// Milliseconds since the unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store file is not a JSON object: {0}")]
    NotAnObject(PathBuf),
}

/// A key was written or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
}

/// Abstract key/value store
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write a key
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Delete a key (absent keys are fine)
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<StoreChange>;
}

/// In-memory store
pub struct MemoryStore {
    values: RwLock<Map<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_values(Map::new())
    }

    /// Create pre-populated
    pub fn with_values(values: Map<String, Value>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            values: RwLock::new(values),
            changes,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of `set`/`remove` calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Copy of everything stored
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn notify(&self, key: &str) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        // Nobody listening is fine
        let _ = self.changes.send(StoreChange { key: key.to_string() });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        self.notify(key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.write().unwrap_or_else(|e| e.into_inner()).remove(key);
        self.notify(key);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// Store persisted as a single JSON document
///
/// Every write rewrites the whole file through a temporary sibling.
pub struct JsonFileStore {
    path: PathBuf,
    memory: MemoryStore,
    flush: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let values = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Map::new(),
            Ok(content) => match serde_json::from_str::<Value>(&content)? {
                Value::Object(map) => map,
                _ => return Err(StoreError::NotAnObject(path)),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };

        info!("Opened store {} ({} keys)", path.display(), values.len());
        Ok(Self {
            path,
            memory: MemoryStore::with_values(values),
            flush: tokio::sync::Mutex::new(()),
        })
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.flush.lock().await;
        let content = serde_json::to_string_pretty(&Value::Object(self.memory.snapshot()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Store flushed to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.memory.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.memory.set(key, value).await?;
        self.persist().await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.memory.remove(key).await?;
        self.persist().await
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.memory.watch()
    }
}

/// Downstream bytes observed for one profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub down: u64,
}

/// "Last used" metadata for one profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastUsed {
    /// Unix millis of the last successful connect or disconnect
    pub timestamp: u64,
    /// Accumulated connected time across sessions
    pub total_connected_ms: u64,
}

/// Egress information of the live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub public_ip: String,
    pub location: String,
}

impl Telemetry {
    /// Placeholder while a lookup is outstanding
    pub fn pending() -> Self {
        Self {
            public_ip: TELEMETRY_PENDING.to_string(),
            location: TELEMETRY_PENDING.to_string(),
        }
    }

    /// Sentinel after a failed lookup
    pub fn failed() -> Self {
        Self {
            public_ip: TELEMETRY_FAILED.to_string(),
            location: TELEMETRY_FAILED.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.public_ip == TELEMETRY_FAILED
    }
}

/// Typed access to the named keys
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn ConfigStore>,
}

impl Records {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key).await? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.store.set(key, serde_json::to_value(value)?).await
    }

    // ===== Profiles & settings =====

    pub async fn profiles(&self) -> Result<Vec<ProxyProfile>, StoreError> {
        Ok(self.read(keys::PROFILES).await?.unwrap_or_default())
    }

    pub async fn set_profiles(&self, profiles: &[ProxyProfile]) -> Result<(), StoreError> {
        self.write(keys::PROFILES, profiles).await
    }

    /// Current settings; defaults when absent
    pub async fn settings(&self) -> Result<Settings, StoreError> {
        Ok(self.read(keys::SETTINGS).await?.unwrap_or_default())
    }

    pub async fn set_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.write(keys::SETTINGS, settings).await
    }

    // ===== Connection bookkeeping =====

    pub async fn connection_state(&self) -> Result<ConnectionState, StoreError> {
        Ok(self.read(keys::CONNECTED_STATE).await?.unwrap_or_default())
    }

    pub async fn set_connection_state(&self, state: ConnectionState) -> Result<(), StoreError> {
        self.write(keys::CONNECTED_STATE, &state).await
    }

    pub async fn connecting_profile_id(&self) -> Result<Option<ProfileId>, StoreError> {
        self.read(keys::CONNECTING_PROFILE_ID).await
    }

    /// Record (or clear) the pending connection target
    pub async fn set_connecting(&self, id: Option<ProfileId>) -> Result<(), StoreError> {
        match id {
            Some(id) => self.write(keys::CONNECTING_PROFILE_ID, &id).await,
            None => self.store.remove(keys::CONNECTING_PROFILE_ID).await,
        }
    }

    pub async fn connected_profile_id(&self) -> Result<Option<ProfileId>, StoreError> {
        self.read(keys::CONNECTED_PROFILE_ID).await
    }

    pub async fn session_start(&self) -> Result<Option<u64>, StoreError> {
        self.read(keys::SESSION_START).await
    }

    /// Persist a verified session
    pub async fn set_connected(&self, id: ProfileId, started_at_ms: u64) -> Result<(), StoreError> {
        self.write(keys::CONNECTED_PROFILE_ID, &id).await?;
        self.write(keys::SESSION_START, &started_at_ms).await?;
        self.store.remove(keys::CONNECTING_PROFILE_ID).await
    }

    /// Forget the connected and pending profile
    pub async fn clear_connected(&self) -> Result<(), StoreError> {
        self.store.remove(keys::CONNECTED_PROFILE_ID).await?;
        self.store.remove(keys::SESSION_START).await?;
        self.store.remove(keys::CONNECTING_PROFILE_ID).await
    }

    // ===== Usage & history =====

    pub async fn usage(&self) -> Result<HashMap<ProfileId, UsageRecord>, StoreError> {
        Ok(self.read(keys::USAGE).await?.unwrap_or_default())
    }

    /// Add downstream bytes, returning the new total for the profile
    pub async fn add_usage(&self, id: ProfileId, bytes: u64) -> Result<u64, StoreError> {
        let mut usage = self.usage().await?;
        let record = usage.entry(id).or_default();
        record.down = record.down.saturating_add(bytes);
        let total = record.down;
        self.write(keys::USAGE, &usage).await?;
        Ok(total)
    }

    pub async fn last_used(&self) -> Result<HashMap<ProfileId, LastUsed>, StoreError> {
        Ok(self.read(keys::LAST_USED).await?.unwrap_or_default())
    }

    pub async fn total_connected(&self) -> Result<HashMap<ProfileId, u64>, StoreError> {
        Ok(self.read(keys::TOTAL_CONNECTED).await?.unwrap_or_default())
    }

    /// Stamp "last used" without changing the accumulated time
    pub async fn touch_last_used(&self, id: ProfileId, now_ms: u64) -> Result<LastUsed, StoreError> {
        let total = self.total_connected().await?.get(&id).copied().unwrap_or(0);
        self.record_last_used(id, now_ms, total).await
    }

    /// Accumulate a finished session into the profile's connected time
    pub async fn add_connected_time(
        &self,
        id: ProfileId,
        duration_ms: u64,
        now_ms: u64,
    ) -> Result<LastUsed, StoreError> {
        let mut totals = self.total_connected().await?;
        let total = totals.entry(id).or_insert(0);
        *total = total.saturating_add(duration_ms);
        let total = *total;
        self.write(keys::TOTAL_CONNECTED, &totals).await?;
        self.record_last_used(id, now_ms, total).await
    }

    async fn record_last_used(&self, id: ProfileId, now_ms: u64, total: u64) -> Result<LastUsed, StoreError> {
        let mut last_used = self.last_used().await?;
        let entry = LastUsed {
            timestamp: now_ms,
            total_connected_ms: total,
        };
        last_used.insert(id, entry);
        self.write(keys::LAST_USED, &last_used).await?;
        Ok(entry)
    }

    // ===== Telemetry =====

    pub async fn telemetry(&self) -> Result<Option<Telemetry>, StoreError> {
        self.read(keys::TELEMETRY).await
    }

    pub async fn set_telemetry(&self, telemetry: &Telemetry) -> Result<(), StoreError> {
        self.write(keys::TELEMETRY, telemetry).await
    }

    pub async fn clear_telemetry(&self) -> Result<(), StoreError> {
        self.store.remove(keys::TELEMETRY).await
    }

    // ===== Startup maintenance =====

    /// Assign missing identifiers and seed the local profile into an empty list
    pub async fn migrate_profiles(&self) -> Result<Vec<ProxyProfile>, StoreError> {
        let mut profiles = self.profiles().await?;

        if profiles.is_empty() {
            info!("No profiles stored, seeding default local profile");
            profiles.push(ProxyProfile::default_local());
            self.set_profiles(&profiles).await?;
            return Ok(profiles);
        }

        let missing = profiles.iter().filter(|p| p.id.is_none()).count();
        if missing > 0 {
            for profile in &mut profiles {
                profile.ensure_id();
            }
            info!("Assigned identifiers to {} profiles", missing);
            self.set_profiles(&profiles).await?;
        }

        Ok(profiles)
    }

    /// Reset state left behind by an unclean shutdown
    ///
    /// A fresh process has no live session, so any persisted state other
    /// than `disconnected` is stale. Returns whether anything was reset.
    pub async fn recover_stale_state(&self) -> Result<bool, StoreError> {
        let state = match self.connection_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Unreadable connection state ({}), resetting", e);
                ConnectionState::Connecting
            }
        };
        if state == ConnectionState::Disconnected {
            return Ok(false);
        }

        info!("Cleaning up stale {} state", state);
        self.set_connection_state(ConnectionState::Disconnected).await?;
        self.clear_connected().await?;
        self.clear_telemetry().await?;
        Ok(true)
    }

    /// Profile with the most recent "last used" stamp
    pub async fn most_recent_profile(&self) -> Result<Option<ProxyProfile>, StoreError> {
        let last_used = self.last_used().await?;
        let profiles = self.profiles().await?;

        Ok(profiles
            .into_iter()
            .filter_map(|p| {
                let stamp = last_used.get(&p.id?)?.timestamp;
                Some((stamp, p))
            })
            .max_by_key(|(stamp, _)| *stamp)
            .map(|(_, p)| p))
    }
}
