//! Connection Lifecycle
//!
//! The transition table of the connection state machine, kept free of
//! I/O: [`transition`] maps `(machine, event)` to the next machine and the
//! list of [`Effect`]s the driver must carry out, in order.
//!
//! ```text
//!                connect                 probe ok
//!  Disconnected ─────────▶ Connecting ─────────────▶ Connected
//!       ▲                      │ probe failed            │
//!       │ retries exhausted    ▼                         │ disconnect
//!       └──────────────── Reconnecting ◀─┐               │
//!       ▲                      │ 5s      │ probe failed  │
//!       │                      └─────────┘               │
//!       └────────────────────────────────────────────────┘
//! ```
//!
//! Every attempt (first or retry) clears the previous proxy rule, applies
//! the target, waits the settle delay and probes. Any connect request
//! restarts this pipeline from scratch with a fresh retry counter.

use crate::profile::ProfileId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Pause between applying a rule and probing it
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Fixed pause before a retry attempt
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Authoritative connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Reconnecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Connected => "connected",
        }
    }

    /// An attempt is in flight
    pub fn is_pending(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Explicit connect request for an already validated profile
    Connect(ProfileId),
    /// Explicit disconnect request
    Disconnect,
    /// The platform rejected the proxy rule
    ActivationFailed { max_retries: u32 },
    /// Settle delay elapsed
    Settled,
    ProbeSucceeded,
    ProbeFailed { max_retries: u32 },
    /// Retry delay elapsed
    RetryElapsed,
}

/// User-facing notifications raised by transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Connecting,
    Retrying { attempt: u32, max_retries: u32 },
    GaveUp,
    Connected,
    Disconnected,
}

/// Side effects, executed by the driver in the order given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Drop whichever suspension (settle, probe, retry timer) is pending
    CancelPending,
    /// Resolve the outstanding connect request, if any
    Complete(bool),
    /// Abort both telemetry pollers
    StopTelemetry,
    /// Account the current session (if it was verified) and drop it
    CloseSession,
    /// Install the staged profile as the session
    BeginSession(ProfileId),
    /// Persist the pending target
    MarkPending(ProfileId),
    /// Clear the persisted connected/pending keys
    ClearPending,
    /// Persist the state and broadcast a status update
    Publish(ConnectionState),
    Notify(Notice),
    /// Clear the previous rule, apply the session profile and arm the
    /// settle timer
    Activate,
    /// Clear the rule (and cookies, per settings)
    Deactivate,
    RunProbe,
    ScheduleRetry,
    /// Persist the verified session and its start timestamp
    OpenSession,
    StartTelemetry,
}

/// Machine state carried between transitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Machine {
    pub state: ConnectionState,
    /// Failed attempts of the current connect request
    pub retry_count: u32,
    pub target: Option<ProfileId>,
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Compute the next machine and its effects
///
/// Events that do not apply to the current state (a late probe result
/// after a disconnect, say) yield the unchanged machine and no effects.
pub fn transition(machine: &Machine, event: Event) -> (Machine, Vec<Effect>) {
    use ConnectionState::*;

    let mut next = *machine;
    let mut effects = Vec::new();

    match (machine.state, event) {
        (_, Event::Connect(id)) => {
            effects.push(Effect::CancelPending);
            leave(machine.state, &mut effects);

            next = Machine {
                state: Connecting,
                retry_count: 0,
                target: Some(id),
            };
            effects.extend([
                Effect::BeginSession(id),
                Effect::MarkPending(id),
                Effect::Publish(Connecting),
                Effect::Notify(Notice::Connecting),
                Effect::Activate,
            ]);
        }

        (Disconnected, Event::Disconnect) => {}

        (_, Event::Disconnect) => {
            effects.push(Effect::CancelPending);
            leave(machine.state, &mut effects);

            next = Machine::new();
            effects.extend([
                Effect::Deactivate,
                Effect::ClearPending,
                Effect::Publish(Disconnected),
                Effect::Notify(Notice::Disconnected),
            ]);
        }

        (Connecting | Reconnecting, Event::Settled) => {
            effects.push(Effect::RunProbe);
        }

        (Connecting | Reconnecting, Event::ProbeSucceeded) => {
            next.state = Connected;
            next.retry_count = 0;
            effects.extend([
                Effect::OpenSession,
                Effect::Publish(Connected),
                Effect::StartTelemetry,
                Effect::Notify(Notice::Connected),
                Effect::Complete(true),
            ]);
        }

        (
            Connecting | Reconnecting,
            Event::ProbeFailed { max_retries } | Event::ActivationFailed { max_retries },
        ) => {
            next.retry_count = machine.retry_count.saturating_add(1);

            if next.retry_count <= max_retries {
                next.state = Reconnecting;
                effects.extend([
                    Effect::Publish(Reconnecting),
                    Effect::Notify(Notice::Retrying {
                        attempt: next.retry_count,
                        max_retries,
                    }),
                    Effect::ScheduleRetry,
                ]);
            } else {
                next = Machine::new();
                effects.extend([
                    Effect::Publish(Disconnected),
                    Effect::ClearPending,
                    Effect::CloseSession,
                    Effect::Deactivate,
                    Effect::Notify(Notice::GaveUp),
                    Effect::Complete(false),
                ]);
            }
        }

        (Reconnecting, Event::RetryElapsed) => {
            effects.push(Effect::Activate);
        }

        _ => {}
    }

    (next, effects)
}

/// Teardown when a request supersedes the current state
fn leave(state: ConnectionState, effects: &mut Vec<Effect>) {
    match state {
        ConnectionState::Connected => {
            effects.extend([Effect::StopTelemetry, Effect::CloseSession]);
        }
        ConnectionState::Connecting | ConnectionState::Reconnecting => {
            effects.extend([Effect::Complete(false), Effect::CloseSession]);
        }
        ConnectionState::Disconnected => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ProfileId {
        ProfileId::generate()
    }

    fn run(machine: Machine, events: &[Event]) -> (Machine, Vec<Vec<Effect>>) {
        let mut machine = machine;
        let mut all = Vec::new();
        for event in events {
            let (next, effects) = transition(&machine, *event);
            machine = next;
            all.push(effects);
        }
        (machine, all)
    }

    #[test]
    fn test_connect_from_disconnected() {
        let target = id();
        let (machine, effects) = transition(&Machine::new(), Event::Connect(target));

        assert_eq!(machine.state, ConnectionState::Connecting);
        assert_eq!(machine.retry_count, 0);
        assert_eq!(machine.target, Some(target));
        assert_eq!(
            effects,
            vec![
                Effect::CancelPending,
                Effect::BeginSession(target),
                Effect::MarkPending(target),
                Effect::Publish(ConnectionState::Connecting),
                Effect::Notify(Notice::Connecting),
                Effect::Activate,
            ]
        );
    }

    #[test]
    fn test_settle_then_probe_success() {
        let (machine, effects) = run(
            Machine::new(),
            &[Event::Connect(id()), Event::Settled, Event::ProbeSucceeded],
        );

        assert_eq!(machine.state, ConnectionState::Connected);
        assert_eq!(machine.retry_count, 0);
        assert_eq!(effects[1], vec![Effect::RunProbe]);
        assert!(effects[2].contains(&Effect::StartTelemetry));
        assert_eq!(effects[2].last(), Some(&Effect::Complete(true)));
    }

    #[test]
    fn test_retries_until_exhausted() {
        let fail = Event::ProbeFailed { max_retries: 2 };
        let mut machine = transition(&Machine::new(), Event::Connect(id())).0;

        for attempt in 1..=2 {
            let (next, effects) = transition(&machine, fail);
            assert_eq!(next.state, ConnectionState::Reconnecting);
            assert_eq!(next.retry_count, attempt);
            assert!(effects.contains(&Effect::ScheduleRetry));

            let (next, effects) = transition(&next, Event::RetryElapsed);
            assert_eq!(effects, vec![Effect::Activate]);
            machine = next;
        }

        let (machine, effects) = transition(&machine, fail);
        assert_eq!(machine, Machine::new());
        assert!(effects.contains(&Effect::Deactivate));
        assert!(effects.contains(&Effect::Notify(Notice::GaveUp)));
        assert_eq!(effects.last(), Some(&Effect::Complete(false)));
    }

    #[test]
    fn test_zero_retries_fails_on_first_probe() {
        let (machine, effects) = run(
            Machine::new(),
            &[Event::Connect(id()), Event::ProbeFailed { max_retries: 0 }],
        );
        assert_eq!(machine.state, ConnectionState::Disconnected);
        assert!(effects[1].contains(&Effect::Complete(false)));
    }

    #[test]
    fn test_activation_failure_consumes_retry() {
        let (machine, _) = run(
            Machine::new(),
            &[Event::Connect(id()), Event::ActivationFailed { max_retries: 3 }],
        );
        assert_eq!(machine.state, ConnectionState::Reconnecting);
        assert_eq!(machine.retry_count, 1);
    }

    #[test]
    fn test_reconnect_superseded_by_new_connect() {
        let b = id();
        let (reconnecting, _) = run(
            Machine::new(),
            &[Event::Connect(id()), Event::ProbeFailed { max_retries: 5 }],
        );

        let (machine, effects) = transition(&reconnecting, Event::Connect(b));
        assert_eq!(machine.state, ConnectionState::Connecting);
        assert_eq!(machine.retry_count, 0);
        assert_eq!(machine.target, Some(b));
        assert_eq!(effects[0], Effect::CancelPending);
        assert_eq!(effects[1], Effect::Complete(false));
    }

    #[test]
    fn test_disconnect_from_connected() {
        let (connected, _) = run(
            Machine::new(),
            &[Event::Connect(id()), Event::Settled, Event::ProbeSucceeded],
        );

        let (machine, effects) = transition(&connected, Event::Disconnect);
        assert_eq!(machine.state, ConnectionState::Disconnected);
        assert_eq!(
            effects,
            vec![
                Effect::CancelPending,
                Effect::StopTelemetry,
                Effect::CloseSession,
                Effect::Deactivate,
                Effect::ClearPending,
                Effect::Publish(ConnectionState::Disconnected),
                Effect::Notify(Notice::Disconnected),
            ]
        );
    }

    #[test]
    fn test_disconnect_when_disconnected_is_noop() {
        let (machine, effects) = transition(&Machine::new(), Event::Disconnect);
        assert_eq!(machine, Machine::new());
        assert!(effects.is_empty());
    }

    #[test]
    fn test_late_events_ignored() {
        for event in [
            Event::Settled,
            Event::ProbeSucceeded,
            Event::ProbeFailed { max_retries: 1 },
            Event::RetryElapsed,
        ] {
            let (machine, effects) = transition(&Machine::new(), event);
            assert_eq!(machine, Machine::new());
            assert!(effects.is_empty());
        }

        let (connected, _) = run(
            Machine::new(),
            &[Event::Connect(id()), Event::Settled, Event::ProbeSucceeded],
        );
        let (machine, effects) = transition(&connected, Event::ProbeFailed { max_retries: 1 });
        assert_eq!(machine, connected);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
