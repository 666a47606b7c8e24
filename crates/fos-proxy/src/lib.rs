//! fOS Proxy - Connection Lifecycle Manager
//!
//! Manages a single active proxy connection: activating a profile on the
//! network layer, verifying it works, retrying with a fixed delay, and
//! reporting health (egress IP, data volume) while connected.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── ConnectionManager ────────────────────────┐
//! │                                                                   │
//! │  request_connect ──▶ ┌──────────┐  activate   ┌────────────────┐   │
//! │  request_disconnect  │  driver  │───────────▶ │ ProxyActivator │───┼──▶ ProxyPlatform
//! │                      │ (machine)│  probe      ├────────────────┤   │
//! │                      │          │───────────▶ │     Probe      │───┼──▶ HEAD generate_204
//! │                      └────┬─────┘             └────────────────┘   │
//! │                           │ connected                             │
//! │                           ▼                                       │
//! │                ┌──────────────────────┐                           │
//! │                │   TelemetryPollers   │──▶ egress lookup, usage   │
//! │                └──────────────────────┘                           │
//! │                                                                   │
//! │  request_local_service_start ──▶ LocalServiceBridge ──▶ helper    │
//! └───────────────────────────────────────────────────────────────────┘
//!          │ Records (ConfigStore)            │ StatusEvent feed
//! ```
//!
//! # Features
//!
//! - **Verified connects**: a profile only counts as connected after a
//!   reachability probe through it succeeds
//! - **Bounded retries**: fixed 5 second delay, at most `maxRetries` times
//! - **Supersession**: a new request cancels whatever is pending
//! - **Crash recovery**: stale non-terminal state is reset at startup

mod activator;
mod bridge;
mod event;
mod lifecycle;
mod manager;
mod probe;
mod profile;
mod settings;
mod store;
mod telemetry;

pub use activator::{ActivationError, ProxyActivator, ProxyPlatform, SessionPlatform, NO_CREDENTIALS_NOTICE};
pub use bridge::{
    read_frame, write_frame, BridgeError, HelperCommand, HelperConnector, HelperPort, HelperReply,
    LocalServiceBridge, LocalServiceConfig, NativeHostConnector, LOCAL_SERVICE_PORT, STARTED_NOTICE,
    STARTING_NOTICE, UNREACHABLE_NOTICE,
};
pub use event::{EventBus, Notifier, StatusEvent};
pub use lifecycle::{
    transition, ConnectionState, Effect, Event, Machine, Notice, RETRY_DELAY, SETTLE_DELAY,
};
pub use manager::{Collaborators, Completion, ConnectionManager, LifecycleError, INVALID_PROFILE_NOTICE};
pub use probe::{HttpProbe, Probe, ProbeError, DEFAULT_PROBE_URL};
pub use profile::{ProfileError, ProfileId, ProxyProfile};
pub use settings::Settings;
pub use store::{
    keys, unix_millis, ConfigStore, JsonFileStore, LastUsed, MemoryStore, Records, StoreChange,
    StoreError, Telemetry, UsageRecord, TELEMETRY_FAILED, TELEMETRY_PENDING,
};
pub use telemetry::{
    refresh_egress, EgressLookup, IpWhoIs, LookupError, TelemetryPollers, UsageSource,
    DEFAULT_LOOKUP_URL, EGRESS_INTERVAL,
};
