//! Connection Lifecycle Manager
//!
//! Drives a profile from "requested" to "connected" or "failed".
//!
//! # Architecture
//!
//! ```text
//!  ConnectionManager (handle, Clone)
//!        │ Command (mpsc)
//!        ▼
//!  ┌────────────── driver task ───────────────┐
//!  │ Machine ──transition()──▶ Effects         │
//!  │ ConnectionSession (profile, pollers)      │
//!  │ pending: settle │ probe │ retry timer     │
//!  └───────────────────────────────────────────┘
//!        │ watch::Sender<Machine>    │ StatusEvent (broadcast)
//!        ▼                           ▼
//!     state()                    subscribe()
//! ```
//!
//! The driver task is the only owner of the machine and the session, so
//! transitions are serialized. At most one suspension (settle delay,
//! probe, retry delay) is pending at a time; a superseding request drops
//! it, which cancels it with no further side effects.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::start(collaborators).await?;
//! let outcome = manager.request_connect(profile).await?;
//! if outcome.success {
//!     manager.request_ip_refresh().await?;
//! }
//! manager.request_disconnect().await?;
//! ```

use crate::activator::{ProxyActivator, ProxyPlatform};
use crate::bridge::{BridgeError, HelperConnector, LocalServiceBridge, LocalServiceConfig};
use crate::event::{EventBus, Notifier, StatusEvent};
use crate::lifecycle::{
    transition, ConnectionState, Effect, Event, Machine, Notice, RETRY_DELAY, SETTLE_DELAY,
};
use crate::probe::{Probe, ProbeError};
use crate::profile::{ProfileError, ProfileId, ProxyProfile};
use crate::settings::Settings;
use crate::store::{keys, unix_millis, ConfigStore, Records, StoreChange, StoreError, Telemetry};
use crate::telemetry::{EgressLookup, TelemetryPollers, UsageSource};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Toast for a profile that fails validation
pub const INVALID_PROFILE_NOTICE: &str = "Invalid proxy configuration";

/// Command queue depth
const COMMAND_CAPACITY: usize = 32;

/// Lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ProfileError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Connection manager stopped")]
    Stopped,
}

/// Completion of a connect or disconnect request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub success: bool,
}

/// External collaborators of the lifecycle
pub struct Collaborators {
    pub store: Arc<dyn ConfigStore>,
    pub platform: Arc<dyn ProxyPlatform>,
    pub probe: Arc<dyn Probe>,
    pub lookup: Arc<dyn EgressLookup>,
    pub usage: Arc<dyn UsageSource>,
    pub helper: Arc<dyn HelperConnector>,
}

enum Command {
    Connect {
        profile: ProxyProfile,
        reply: Option<oneshot::Sender<bool>>,
    },
    Disconnect {
        reply: oneshot::Sender<bool>,
    },
    RefreshIp {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Handle to the lifecycle driver
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    machine: watch::Receiver<Machine>,
    notifier: Notifier,
    records: Records,
    activator: Arc<ProxyActivator>,
    bridge: LocalServiceBridge,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Run startup maintenance and spawn the driver
    ///
    /// 1. Assigns missing profile identifiers (seeding the default profile)
    /// 2. Resets state left behind by an unclean shutdown
    /// 3. Reconnects the most recently used profile when configured to
    pub async fn start(parts: Collaborators) -> Result<Self, LifecycleError> {
        let records = Records::new(parts.store.clone());

        let settings = records.settings().await.unwrap_or_else(|e| {
            warn!("Unreadable settings ({}), using defaults", e);
            Settings::default()
        });

        let notifier = Notifier::new(EventBus::new());
        notifier.set_enabled(settings.notifications_enabled);

        let profiles = records.migrate_profiles().await?;
        if records.recover_stale_state().await? {
            info!("Stale connection state cleaned up");
        }

        let activator = Arc::new(ProxyActivator::new(parts.platform, notifier.clone()));
        let bridge = LocalServiceBridge::new(parts.helper, notifier.clone());

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (machine_tx, machine) = watch::channel(Machine::new());
        let store_changes = parts.store.watch();

        let driver = Driver {
            machine: Machine::new(),
            records: records.clone(),
            activator: activator.clone(),
            probe: parts.probe,
            lookup: parts.lookup,
            usage: parts.usage,
            notifier: notifier.clone(),
            settings: settings.clone(),
            session: None,
            staged: None,
            reply: None,
            pending: None,
            published: machine_tx,
        };
        let handle = tokio::spawn(driver.run(command_rx, store_changes));

        info!("Connection manager started ({} profiles)", profiles.len());

        let manager = Self {
            commands,
            machine,
            notifier,
            records,
            activator,
            bridge,
            driver: Arc::new(Mutex::new(Some(handle))),
        };

        if settings.auto_connect_last_used {
            manager.auto_connect().await?;
        }

        Ok(manager)
    }

    async fn auto_connect(&self) -> Result<(), LifecycleError> {
        let Some(profile) = self.records.most_recent_profile().await? else {
            debug!("Auto-connect enabled but no profile has been used yet");
            return Ok(());
        };

        if let Err(e) = profile.validate() {
            warn!("Skipping auto-connect to {}: {}", profile.display_name(), e);
            return Ok(());
        }

        info!("Auto-connecting to last used profile {}", profile.display_name());
        self.send(Command::Connect { profile, reply: None }).await
    }

    async fn send(&self, command: Command) -> Result<(), LifecycleError> {
        self.commands.send(command).await.map_err(|_| LifecycleError::Stopped)
    }

    /// Connect to `profile`, resolving once it is verified or abandoned
    ///
    /// A malformed profile fails immediately with
    /// [`LifecycleError::Configuration`] and leaves the state untouched. A
    /// request superseded by a later connect or disconnect completes with
    /// `success: false`.
    pub async fn request_connect(&self, profile: ProxyProfile) -> Result<Completion, LifecycleError> {
        if let Err(e) = profile.validate() {
            error!("Invalid proxy configuration for {}: {}", profile.display_name(), e);
            self.notifier.toast(INVALID_PROFILE_NOTICE);
            return Err(e.into());
        }

        let (reply, done) = oneshot::channel();
        self.send(Command::Connect {
            profile,
            reply: Some(reply),
        })
        .await?;

        let success = done.await.map_err(|_| LifecycleError::Stopped)?;
        Ok(Completion { success })
    }

    /// Tear down the current session or attempt
    ///
    /// Succeeds immediately when already disconnected.
    pub async fn request_disconnect(&self) -> Result<Completion, LifecycleError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Disconnect { reply }).await?;

        let success = done.await.map_err(|_| LifecycleError::Stopped)?;
        Ok(Completion { success })
    }

    /// Re-arm one egress lookup; returns `false` when not connected
    pub async fn request_ip_refresh(&self) -> Result<bool, LifecycleError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::RefreshIp { reply }).await?;
        done.await.map_err(|_| LifecycleError::Stopped)
    }

    /// Ask the local helper to start its service
    ///
    /// Independent of the connection state.
    pub async fn request_local_service_start(&self, config: LocalServiceConfig) -> Result<(), LifecycleError> {
        self.bridge.start(config).await?;
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.machine.borrow().state
    }

    /// Current machine (state, retry counter, target)
    pub fn machine(&self) -> Machine {
        *self.machine.borrow()
    }

    /// Follow machine changes
    pub fn watch(&self) -> watch::Receiver<Machine> {
        self.machine.clone()
    }

    /// Subscribe to status and toast events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.notifier.bus().subscribe()
    }

    /// Typed store access
    pub fn records(&self) -> &Records {
        &self.records
    }

    /// Credential hook to install on the network layer
    pub fn activator(&self) -> Arc<ProxyActivator> {
        self.activator.clone()
    }

    pub fn bridge(&self) -> &LocalServiceBridge {
        &self.bridge
    }

    /// Disconnect, stop the driver and drop the helper connection
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;

        let handle = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Driver task failed: {}", e);
            }
        }

        self.bridge.disconnect().await;
        info!("Connection manager stopped");
    }
}

/// What a pending suspension resolves to
enum Wake {
    Settled,
    Probed(Result<(), ProbeError>),
    RetryElapsed,
}

type Pending = Pin<Box<dyn Future<Output = Wake> + Send>>;

/// Ephemeral state of one connect request
struct ConnectionSession {
    id: ProfileId,
    profile: ProxyProfile,
    /// Set once the connection is verified
    started: Option<Instant>,
    telemetry: Option<TelemetryPollers>,
}

/// Profile (and caller) waiting to become the session
struct Staged {
    profile: ProxyProfile,
    reply: Option<oneshot::Sender<bool>>,
}

struct Driver {
    machine: Machine,
    records: Records,
    activator: Arc<ProxyActivator>,
    probe: Arc<dyn Probe>,
    lookup: Arc<dyn EgressLookup>,
    usage: Arc<dyn UsageSource>,
    notifier: Notifier,
    settings: Settings,
    session: Option<ConnectionSession>,
    staged: Option<Staged>,
    reply: Option<oneshot::Sender<bool>>,
    pending: Option<Pending>,
    published: watch::Sender<Machine>,
}

async fn wait_pending(pending: &mut Option<Pending>) -> Wake {
    match pending {
        Some(future) => future.as_mut().await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut store_changes: broadcast::Receiver<StoreChange>,
    ) {
        debug!("Lifecycle driver running");
        let mut watching = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.dispatch(Event::Disconnect).await;
                        break;
                    }
                    Some(command) => self.handle(command).await,
                },
                wake = wait_pending(&mut self.pending) => {
                    self.pending = None;
                    let event = self.wake_event(wake);
                    self.dispatch(event).await;
                }
                change = store_changes.recv(), if watching => match change {
                    Ok(change) if change.key == keys::SETTINGS => self.reload_settings().await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        debug!("Store feed lagged by {}, re-reading settings", missed);
                        self.reload_settings().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Store change feed closed, settings will only be read at connect time");
                        watching = false;
                    }
                },
            }
        }

        debug!("Lifecycle driver stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { mut profile, reply } => {
                // Retry and timeout bounds come from a fresh read
                self.reload_settings().await;

                let id = profile.ensure_id();
                info!("Connecting to {} ({})", profile.display_name(), id);
                self.staged = Some(Staged { profile, reply });
                self.dispatch(Event::Connect(id)).await;
            }
            Command::Disconnect { reply } => {
                if self.machine.state == ConnectionState::Disconnected {
                    debug!("Disconnect requested while already disconnected");
                }
                self.dispatch(Event::Disconnect).await;
                let _ = reply.send(true);
            }
            Command::RefreshIp { reply } => {
                let refreshed = match self.session.as_mut().and_then(|s| s.telemetry.as_mut()) {
                    Some(telemetry) => {
                        info!("IP refresh requested");
                        telemetry.refresh();
                        true
                    }
                    None => {
                        debug!("IP refresh ignored: not connected");
                        false
                    }
                };
                let _ = reply.send(refreshed);
            }
            Command::Shutdown => {}
        }
    }

    fn wake_event(&self, wake: Wake) -> Event {
        match wake {
            Wake::Settled => Event::Settled,
            Wake::RetryElapsed => Event::RetryElapsed,
            Wake::Probed(Ok(())) => Event::ProbeSucceeded,
            Wake::Probed(Err(e)) => {
                warn!("Connection test failed: {}", e);
                Event::ProbeFailed {
                    max_retries: self.settings.max_retries,
                }
            }
        }
    }

    async fn reload_settings(&mut self) {
        match self.records.settings().await {
            Ok(settings) => {
                if settings != self.settings {
                    debug!("Settings updated: {:?}", settings);
                }
                self.notifier.set_enabled(settings.notifications_enabled);
                self.settings = settings;
            }
            Err(e) => warn!("Unreadable settings ({}), keeping previous", e),
        }
    }

    /// Run an event and any follow-ups raised by its effects
    async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let (next, effects) = transition(&self.machine, event);
            if next != self.machine {
                debug!("{:?}: {:?} -> {:?}", event, self.machine, next);
            }
            self.machine = next;

            for effect in effects {
                if let Some(follow_up) = self.apply(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }

        self.published.send_replace(self.machine);
    }

    async fn apply(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::CancelPending => {
                if self.pending.take().is_some() {
                    debug!("Pending step cancelled");
                }
            }
            Effect::Complete(success) => {
                if let Some(reply) = self.reply.take() {
                    let _ = reply.send(success);
                }
            }
            Effect::StopTelemetry => {
                if let Some(telemetry) = self.session.as_mut().and_then(|s| s.telemetry.take()) {
                    telemetry.stop();
                }
            }
            Effect::CloseSession => self.close_session().await,
            Effect::BeginSession(id) => {
                if let Some(Staged { profile, reply }) = self.staged.take() {
                    self.session = Some(ConnectionSession {
                        id,
                        profile,
                        started: None,
                        telemetry: None,
                    });
                    self.reply = reply;
                }
            }
            Effect::MarkPending(id) => {
                Self::store_write(self.records.set_connecting(Some(id)).await);
            }
            Effect::ClearPending => {
                Self::store_write(self.records.clear_connected().await);
                Self::store_write(self.records.clear_telemetry().await);
            }
            Effect::Publish(state) => {
                Self::store_write(self.records.set_connection_state(state).await);
                self.notifier.status(state);
            }
            Effect::Notify(notice) => self.notify(notice),
            Effect::Activate => return self.activate().await,
            Effect::Deactivate => {
                self.activator
                    .deactivate(self.settings.clear_cookies_on_disconnect)
                    .await;
            }
            Effect::RunProbe => {
                let probe = self.probe.clone();
                let timeout = self.settings.probe_timeout();
                debug!("Starting connection test (timeout {:?})", timeout);
                self.pending = Some(Box::pin(async move { Wake::Probed(probe.check(timeout).await) }));
            }
            Effect::ScheduleRetry => {
                debug!("Retrying in {:?}", RETRY_DELAY);
                self.pending = Some(Box::pin(async {
                    tokio::time::sleep(RETRY_DELAY).await;
                    Wake::RetryElapsed
                }));
            }
            Effect::OpenSession => self.open_session().await,
            Effect::StartTelemetry => {
                if let Some(session) = self.session.as_mut() {
                    session.telemetry = Some(TelemetryPollers::start(
                        session.id,
                        self.lookup.clone(),
                        self.usage.as_ref(),
                        self.records.clone(),
                    ));
                }
            }
        }
        None
    }

    /// Clear the old rule, apply the session profile and arm the settle timer
    async fn activate(&mut self) -> Option<Event> {
        let profile = self.session.as_ref()?.profile.clone();

        self.activator
            .deactivate(self.settings.clear_cookies_on_disconnect)
            .await;

        match self.activator.activate(&profile).await {
            Ok(server) => {
                debug!("Waiting {:?} for {} to settle", SETTLE_DELAY, server);
                self.pending = Some(Box::pin(async {
                    tokio::time::sleep(SETTLE_DELAY).await;
                    Wake::Settled
                }));
                None
            }
            Err(e) => {
                warn!("Activation of {} failed: {}", profile.display_name(), e);
                Some(Event::ActivationFailed {
                    max_retries: self.settings.max_retries,
                })
            }
        }
    }

    async fn open_session(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let now = unix_millis();
        session.started = Some(Instant::now());
        let id = session.id;
        info!("Connected to {} ({})", session.profile.display_name(), id);

        Self::store_write(self.records.set_connected(id, now).await);
        if let Err(e) = self.records.touch_last_used(id, now).await {
            warn!("Failed to record last use of {}: {}", id, e);
        }
        Self::store_write(self.records.set_telemetry(&Telemetry::pending()).await);
    }

    async fn close_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(telemetry) = session.telemetry.take() {
            telemetry.stop();
        }

        if let Some(started) = session.started {
            let duration = started.elapsed();
            info!(
                "Session with {} ended after {:?}",
                session.profile.display_name(),
                duration
            );
            match self
                .records
                .add_connected_time(session.id, duration.as_millis() as u64, unix_millis())
                .await
            {
                Ok(entry) => debug!("Total connected time for {}: {}ms", session.id, entry.total_connected_ms),
                Err(e) => warn!("Failed to record session time for {}: {}", session.id, e),
            }
        }
    }

    fn notify(&self, notice: Notice) {
        match notice {
            Notice::Connecting => {
                let name = self
                    .session
                    .as_ref()
                    .map(|s| s.profile.display_name().to_string())
                    .unwrap_or_default();
                self.notifier.toast(format!("Connecting to {}...", name));
            }
            Notice::Retrying { attempt, max_retries } => {
                info!("Connection attempt failed ({}/{})", attempt, max_retries);
                self.notifier.toast(format!(
                    "Connection failed. Retrying ({}/{})...",
                    attempt, max_retries
                ));
            }
            Notice::GaveUp => {
                warn!("Giving up after {} retries", self.settings.max_retries);
                self.notifier.toast("Could not connect to proxy after multiple attempts");
            }
            Notice::Connected => self.notifier.announce("Proxy connected successfully!"),
            Notice::Disconnected => self.notifier.toast("Disconnected"),
        }
    }

    fn store_write(result: Result<(), StoreError>) {
        if let Err(e) = result {
            warn!("Store write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::SessionPlatform;
    use crate::probe::HttpProbe;
    use crate::store::MemoryStore;
    use crate::telemetry::IpWhoIs;
    use fos_network::HttpClient;

    fn require_send<T: Send>(_: &T) {}

    #[test]
    fn test_driver_future_is_send() {
        let store = Arc::new(MemoryStore::new());
        let platform = Arc::new(SessionPlatform::default());
        let client = HttpClient::with_defaults();
        let notifier = Notifier::new(EventBus::new());
        let (_commands, command_rx) = mpsc::channel(1);

        let driver = Driver {
            machine: Machine::new(),
            records: Records::new(store.clone()),
            activator: Arc::new(ProxyActivator::new(platform.clone(), notifier.clone())),
            probe: Arc::new(HttpProbe::new(client.clone(), platform)),
            lookup: Arc::new(IpWhoIs::new(client.clone())),
            usage: Arc::new(client),
            notifier,
            settings: Settings::default(),
            session: None,
            staged: None,
            reply: None,
            pending: None,
            published: watch::channel(Machine::new()).0,
        };

        let run = driver.run(command_rx, store.watch());
        require_send(&run);
    }
}
