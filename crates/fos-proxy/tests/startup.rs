//! Startup maintenance: migration, stale state recovery and auto-connect

mod common;

use common::*;
use fos_proxy::{ConnectionState, MemoryStore, Records, Settings, Telemetry};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn auto_connect() -> Settings {
    Settings {
        auto_connect_last_used: true,
        ..Settings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_empty_store_seeds_default_profile() {
    let h = Harness::start(settings(5)).await;

    let profiles = h.records.profiles().await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert!(profiles[0].id.is_some());
    assert_eq!(profiles[0].port, Some(10828));
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_missing_ids_assigned() {
    let store = Arc::new(MemoryStore::new());
    let records = Records::new(store.clone());
    let mut office = profile("Office", "a.example");
    office.id = None;
    let mut home = profile("Home", "b.example");
    home.id = None;
    records.set_profiles(&[office, home]).await.unwrap();

    let h = Harness::with_store(store, settings(5)).await;

    let profiles = h.records.profiles().await.unwrap();
    assert_eq!(profiles.len(), 2);
    assert!(profiles.iter().all(|p| p.id.is_some()));
    assert_ne!(profiles[0].id, profiles[1].id);
}

#[tokio::test(start_paused = true)]
async fn test_stale_session_cleared() {
    let store = Arc::new(MemoryStore::new());
    let records = Records::new(store.clone());
    let office = profile("Office", "a.example");
    let id = office.id.unwrap();
    records.set_profiles(&[office]).await.unwrap();
    records.set_connection_state(ConnectionState::Connected).await.unwrap();
    records.set_connected(id, 1_000).await.unwrap();
    records.set_telemetry(&Telemetry::pending()).await.unwrap();

    let h = Harness::with_store(store, settings(5)).await;

    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert_eq!(h.records.connection_state().await.unwrap(), ConnectionState::Disconnected);
    assert_eq!(h.records.connected_profile_id().await.unwrap(), None);
    assert_eq!(h.records.session_start().await.unwrap(), None);
    assert_eq!(h.records.telemetry().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_stale_attempt_cleared() {
    let store = Arc::new(MemoryStore::new());
    let records = Records::new(store.clone());
    let office = profile("Office", "a.example");
    let id = office.id.unwrap();
    records.set_profiles(&[office]).await.unwrap();
    records.set_connection_state(ConnectionState::Reconnecting).await.unwrap();
    records.set_connecting(Some(id)).await.unwrap();

    let h = Harness::with_store(store, settings(5)).await;

    assert_eq!(h.records.connection_state().await.unwrap(), ConnectionState::Disconnected);
    assert_eq!(h.records.connecting_profile_id().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_auto_connect_most_recent() {
    let store = Arc::new(MemoryStore::new());
    let records = Records::new(store.clone());
    let office = profile("Office", "a.example");
    let home = profile("Home", "b.example");
    let home_id = home.id.unwrap();
    records.touch_last_used(office.id.unwrap(), 100).await.unwrap();
    records.touch_last_used(home_id, 200).await.unwrap();
    records.set_profiles(&[office, home]).await.unwrap();

    let h = Harness::with_store(store, auto_connect()).await;

    let mut machine = h.manager.watch();
    machine
        .wait_for(|m| m.state == ConnectionState::Connected)
        .await
        .unwrap();

    assert_eq!(h.probe.hosts(), ["b.example"]);
    assert_eq!(h.records.connected_profile_id().await.unwrap(), Some(home_id));
}

#[tokio::test(start_paused = true)]
async fn test_auto_connect_skips_invalid_profile() {
    let store = Arc::new(MemoryStore::new());
    let records = Records::new(store.clone());
    let mut broken = profile("Broken", "c.example");
    broken.port = None;
    records.touch_last_used(broken.id.unwrap(), 100).await.unwrap();
    records.set_profiles(&[broken]).await.unwrap();

    let h = Harness::with_store(store, auto_connect()).await;

    sleep(Duration::from_secs(10)).await;
    assert!(h.probe.attempts().is_empty());
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_auto_connect_without_history() {
    let h = Harness::start(auto_connect()).await;

    sleep(Duration::from_secs(10)).await;
    assert!(h.probe.attempts().is_empty());
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}
