//! Connect, retry, supersede and disconnect scenarios on a paused clock

mod common;

use common::*;
use fos_proxy::{
    unix_millis, ConnectionState, LifecycleError, LocalServiceConfig, ProfileError, Settings,
    INVALID_PROFILE_NOTICE, RETRY_DELAY, SETTLE_DELAY, TELEMETRY_FAILED, UNREACHABLE_NOTICE,
};
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[tokio::test(start_paused = true)]
async fn test_connect_success() {
    let h = Harness::start(settings(5)).await;
    let mut events = h.manager.subscribe();
    let office = profile("Office", "a.example");
    let id = office.id.unwrap();

    let begin = Instant::now();
    let outcome = h.manager.request_connect(office).await.unwrap();
    assert!(outcome.success);
    settle_tasks().await;

    let machine = h.manager.machine();
    assert_eq!(machine.state, ConnectionState::Connected);
    assert_eq!(machine.retry_count, 0);
    assert_eq!(machine.target, Some(id));
    assert!(h.proxy_applied());

    // Probe only runs after the settle delay
    let attempts = h.probe.attempts();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].1 - begin >= SETTLE_DELAY);

    assert_eq!(h.records.connection_state().await.unwrap(), ConnectionState::Connected);
    assert_eq!(h.records.connected_profile_id().await.unwrap(), Some(id));
    assert_eq!(h.records.connecting_profile_id().await.unwrap(), None);
    assert!(h.records.session_start().await.unwrap().unwrap() <= unix_millis());
    assert!(h.records.last_used().await.unwrap().contains_key(&id));

    let events = drain(&mut events);
    assert_eq!(states(&events), [ConnectionState::Connecting, ConnectionState::Connected]);
    assert_eq!(
        toasts(&events),
        ["Connecting to Office...", "Proxy connected successfully!"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_retries() {
    let h = Harness::start(settings(2)).await;
    h.probe.fail("a.example");
    let mut events = h.manager.subscribe();

    let outcome = h.manager.request_connect(profile("Office", "a.example")).await.unwrap();
    assert!(!outcome.success);
    settle_tasks().await;

    // One initial attempt plus two retries
    let attempts = h.probe.attempts();
    assert_eq!(attempts.len(), 3);
    for pair in attempts.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= RETRY_DELAY);
    }

    let machine = h.manager.machine();
    assert_eq!(machine.state, ConnectionState::Disconnected);
    assert_eq!(machine.retry_count, 0);
    assert!(!h.proxy_applied());
    assert_eq!(h.records.connection_state().await.unwrap(), ConnectionState::Disconnected);
    assert_eq!(h.records.connecting_profile_id().await.unwrap(), None);

    let events = drain(&mut events);
    assert_eq!(
        states(&events),
        [
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Reconnecting,
            ConnectionState::Disconnected,
        ]
    );
    assert_eq!(
        toasts(&events),
        [
            "Connecting to Office...",
            "Connection failed. Retrying (1/2)...",
            "Connection failed. Retrying (2/2)...",
            "Could not connect to proxy after multiple attempts",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_recovers_on_retry() {
    let h = Harness::start(settings(3)).await;
    h.probe.fail("a.example");

    let connect = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.request_connect(profile("Office", "a.example")).await })
    };

    let mut machine = h.manager.watch();
    machine
        .wait_for(|m| m.state == ConnectionState::Reconnecting)
        .await
        .unwrap();
    assert_eq!(h.manager.machine().retry_count, 1);
    h.probe.heal("a.example");

    assert!(connect.await.unwrap().unwrap().success);
    assert_eq!(h.probe.attempts().len(), 2);
    assert_eq!(h.manager.machine().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_fails_on_first_attempt() {
    let h = Harness::start(settings(0)).await;
    h.probe.fail("a.example");
    let mut events = h.manager.subscribe();

    let outcome = h.manager.request_connect(profile("Office", "a.example")).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(h.probe.attempts().len(), 1);
    assert_eq!(
        states(&drain(&mut events)),
        [ConnectionState::Connecting, ConnectionState::Disconnected]
    );
}

#[tokio::test(start_paused = true)]
async fn test_new_connect_supersedes_retry() {
    let h = Harness::start(settings(5)).await;
    h.probe.fail("a.example");
    let home = profile("Home", "b.example");
    let home_id = home.id.unwrap();

    let first = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.request_connect(profile("Office", "a.example")).await })
    };

    let mut machine = h.manager.watch();
    machine
        .wait_for(|m| m.state == ConnectionState::Reconnecting)
        .await
        .unwrap();

    let second = h.manager.request_connect(home).await.unwrap();
    assert!(second.success);
    assert!(!first.await.unwrap().unwrap().success);

    // The superseded retry timer never fires
    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.probe.hosts(), ["a.example", "b.example"]);
    assert_eq!(h.manager.state(), ConnectionState::Connected);
    assert_eq!(h.records.connected_profile_id().await.unwrap(), Some(home_id));
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_switches_profile() {
    let h = Harness::start(settings(5)).await;
    let office = profile("Office", "a.example");
    let office_id = office.id.unwrap();

    assert!(h.manager.request_connect(office).await.unwrap().success);
    sleep(Duration::from_secs(10)).await;

    let home = profile("Home", "b.example");
    let home_id = home.id.unwrap();
    assert!(h.manager.request_connect(home).await.unwrap().success);

    assert_eq!(h.records.connected_profile_id().await.unwrap(), Some(home_id));
    let last_used = h.records.last_used().await.unwrap();
    assert!(last_used[&office_id].total_connected_ms >= 10_000);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_when_idle_is_noop() {
    let h = Harness::start(settings(5)).await;
    let mut events = h.manager.subscribe();
    let writes = h.store.write_count();

    let outcome = h.manager.request_disconnect().await.unwrap();
    assert!(outcome.success);

    assert_eq!(h.store.write_count(), writes);
    assert!(drain(&mut events).is_empty());
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_ends_session() {
    let h = Harness::start(settings(5)).await;
    h.lookup.set_succeed(false);
    let office = profile("Office", "a.example");
    let id = office.id.unwrap();

    assert!(h.manager.request_connect(office).await.unwrap().success);
    sleep(Duration::from_secs(12)).await;

    // Failed lookups keep polling while connected
    let calls = h.lookup.calls();
    assert!(calls >= 3);
    let telemetry = h.records.telemetry().await.unwrap().unwrap();
    assert_eq!(telemetry.public_ip, TELEMETRY_FAILED);

    let mut events = h.manager.subscribe();
    assert!(h.manager.request_disconnect().await.unwrap().success);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.lookup.calls(), calls);

    assert!(!h.proxy_applied());
    assert_eq!(h.records.connection_state().await.unwrap(), ConnectionState::Disconnected);
    assert_eq!(h.records.connected_profile_id().await.unwrap(), None);
    assert_eq!(h.records.session_start().await.unwrap(), None);
    assert_eq!(h.records.telemetry().await.unwrap(), None);

    let last_used = h.records.last_used().await.unwrap();
    assert!(last_used[&id].total_connected_ms >= 12_000);

    let events = drain(&mut events);
    assert_eq!(states(&events), [ConnectionState::Disconnected]);
    assert_eq!(toasts(&events), ["Disconnected"]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_attempt() {
    let h = Harness::start(settings(5)).await;
    h.probe.fail("a.example");

    let connect = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.request_connect(profile("Office", "a.example")).await })
    };

    let mut machine = h.manager.watch();
    machine
        .wait_for(|m| m.state == ConnectionState::Reconnecting)
        .await
        .unwrap();

    assert!(h.manager.request_disconnect().await.unwrap().success);
    assert!(!connect.await.unwrap().unwrap().success);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.probe.attempts().len(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert!(!h.proxy_applied());
}

#[tokio::test(start_paused = true)]
async fn test_egress_lookup_stops_after_success() {
    let h = Harness::start(settings(5)).await;
    assert!(!h.manager.request_ip_refresh().await.unwrap());

    assert!(h.manager.request_connect(profile("Office", "a.example")).await.unwrap().success);
    settle_tasks().await;

    assert_eq!(h.lookup.calls(), 1);
    let telemetry = h.records.telemetry().await.unwrap().unwrap();
    assert_eq!(telemetry.public_ip, EGRESS_IP);
    assert_eq!(telemetry.location, "Netherlands");

    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.lookup.calls(), 1);

    assert!(h.manager.request_ip_refresh().await.unwrap());
    settle_tasks().await;
    assert_eq!(h.lookup.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_profile_rejected() {
    let h = Harness::start(settings(5)).await;
    let mut events = h.manager.subscribe();
    let writes = h.store.write_count();

    let mut broken = profile("Broken", "c.example");
    broken.port = None;

    let err = h.manager.request_connect(broken).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Configuration(ProfileError::MissingPort)));

    settle_tasks().await;
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert_eq!(h.store.write_count(), writes);
    assert!(h.probe.attempts().is_empty());
    assert_eq!(toasts(&drain(&mut events)), [INVALID_PROFILE_NOTICE]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_activation_consumes_retries() {
    let h = Harness::start(settings(1)).await;
    h.platform.settings().set_locked(true);
    let mut events = h.manager.subscribe();

    let begin = Instant::now();
    let outcome = h.manager.request_connect(profile("Office", "a.example")).await.unwrap();
    assert!(!outcome.success);
    assert!(begin.elapsed() >= RETRY_DELAY);

    assert!(h.probe.attempts().is_empty());
    assert!(!h.proxy_applied());

    let events = drain(&mut events);
    assert_eq!(
        states(&events),
        [
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Disconnected,
        ]
    );
    assert_eq!(
        toasts(&events).last().map(String::as_str),
        Some("Could not connect to proxy after multiple attempts")
    );
}

#[tokio::test(start_paused = true)]
async fn test_muted_notifications_keep_success_notice() {
    let muted = Settings {
        notifications_enabled: false,
        ..Settings::default()
    };
    let h = Harness::start(muted).await;
    let mut events = h.manager.subscribe();

    assert!(h.manager.request_connect(profile("Office", "a.example")).await.unwrap().success);

    let events = drain(&mut events);
    assert_eq!(states(&events), [ConnectionState::Connecting, ConnectionState::Connected]);
    assert_eq!(toasts(&events), ["Proxy connected successfully!"]);
}

#[tokio::test(start_paused = true)]
async fn test_settings_change_applies_live() {
    let h = Harness::start(settings(5)).await;
    assert!(h.manager.request_connect(profile("Office", "a.example")).await.unwrap().success);

    let muted = Settings {
        notifications_enabled: false,
        ..Settings::default()
    };
    h.records.set_settings(&muted).await.unwrap();
    settle_tasks().await;

    let mut events = h.manager.subscribe();
    assert!(h.manager.request_disconnect().await.unwrap().success);

    let events = drain(&mut events);
    assert_eq!(states(&events), [ConnectionState::Disconnected]);
    assert!(toasts(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_usage_counts_proxied_bytes() {
    let h = Harness::start(settings(5)).await;
    let office = profile("Office", "a.example");
    let id = office.id.unwrap();

    // Traffic before the session is not attributed
    let _ = h.feed.send(exchange(4096));
    assert!(h.manager.request_connect(office).await.unwrap().success);

    let _ = h.feed.send(exchange(1500));
    let _ = h.feed.send(exchange(500));
    let mut direct = exchange(999);
    direct.proxied = false;
    let _ = h.feed.send(direct);
    let mut head = exchange(0);
    head.content_length = None;
    let _ = h.feed.send(head);
    settle_tasks().await;

    let usage = h.records.usage().await.unwrap();
    assert_eq!(usage[&id].down, 2000);
}

#[tokio::test(start_paused = true)]
async fn test_local_service_without_helper() {
    let h = Harness::start(settings(5)).await;
    let mut events = h.manager.subscribe();

    let config = LocalServiceConfig::vless("edge.example", "token").unwrap();
    let err = h.manager.request_local_service_start(config).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Bridge(_)));

    assert!(!h.manager.bridge().is_connected().await);
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert_eq!(toasts(&drain(&mut events)), [UNREACHABLE_NOTICE]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects() {
    let h = Harness::start(settings(5)).await;
    assert!(h.manager.request_connect(profile("Office", "a.example")).await.unwrap().success);

    h.manager.shutdown().await;

    assert!(!h.proxy_applied());
    assert_eq!(h.records.connection_state().await.unwrap(), ConnectionState::Disconnected);
    assert!(matches!(
        h.manager.request_connect(profile("Home", "b.example")).await,
        Err(LifecycleError::Stopped)
    ));
}
