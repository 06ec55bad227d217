//! Fixture loading and per-test isolation, end to end

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Map};
use tempfile::TempDir;
use testfleet::{FixtureRef, FixtureStore, IsolationEngine, LabConfig, Platform, TestCoordinator, TestSpec};

fn fixture_root() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("users.json"),
        json!({
            "users": {
                "valid": [
                    {"username": "alice", "email": "alice@shop.test", "profile": {"username": "alice.p"}},
                    {"username": "bob", "email": "bob@shop.test"}
                ],
                "locked": [{"username": "mallory", "email": "mallory@shop.test", "locked": true}]
            }
        })
        .to_string(),
    )
    .unwrap();
    dir
}

#[test]
fn test_fixture_record_lookup() {
    let dir = fixture_root();
    let store = FixtureStore::new(dir.path());

    let first = store.load_record("users", "valid", None);
    assert_eq!(first["username"], json!("alice"));
    assert_eq!(store.load_record("users", "valid", Some(0)), first);
    assert_eq!(store.load_category("users", "locked").len(), 1);
    assert!(store.load("nonexistent_type").categories.is_empty());
}

#[test]
fn test_concurrent_initializations_are_disjoint() {
    let dir = fixture_root();
    let store = FixtureStore::new(dir.path());
    let base = store.load_record("users", "valid", None);
    let engine = Arc::new(IsolationEngine::default());

    let handles: Vec<_> = (0..32)
        .map(|n| {
            let engine = Arc::clone(&engine);
            let base = base.clone();
            std::thread::spawn(move || engine.initialize_test_data(&format!("t{}", n), &base))
        })
        .collect();
    let records: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let contexts: HashSet<_> = records.iter().map(|r| r.context_id.clone().unwrap()).collect();
    let emails: HashSet<_> = records.iter().map(|r| r.get_str("email").unwrap().to_string()).collect();
    let nested: HashSet<_> = records
        .iter()
        .map(|r| r.data["profile"]["username"].as_str().unwrap().to_string())
        .collect();

    assert_eq!(contexts.len(), 32);
    assert_eq!(emails.len(), 32);
    assert_eq!(nested.len(), 32);
    assert_eq!(engine.active_count(), 32);

    for record in &records {
        let ctx = record.context_id.as_deref().unwrap();
        assert_eq!(record.get_str("email").unwrap(), format!("alice+{}@shop.test", ctx));
    }
}

#[test]
fn test_mutation_stays_private() {
    let engine = IsolationEngine::default();
    let base: Map<_, _> = json!({"username": "carol", "cart": ["sku-1"]})
        .as_object()
        .cloned()
        .unwrap();

    engine.initialize_test_data("a", &base);
    engine.initialize_test_data("b", &base);

    let mut patch = Map::new();
    patch.insert("cart".into(), json!(["sku-1", "sku-2"]));
    engine.update_test_data("a", patch).unwrap();

    assert_eq!(engine.get_test_data("a").data["cart"], json!(["sku-1", "sku-2"]));
    assert_eq!(engine.get_test_data("b").data["cart"], json!(["sku-1"]));
}

#[tokio::test]
async fn test_coordinator_runs_parallel_tests() {
    let dir = fixture_root();
    let config = LabConfig::from_toml(&format!(
        r#"
[pool]
lock_table = "{locks}"
local_endpoint = "http://10.0.2.2:4723/wd/hub"

[[pool.devices]]
id = "emulator-5554"
platform = "android"
device_name = "Pixel 7"
platform_version = "14"

[[pool.devices]]
id = "emulator-5556"
platform = "android"

[fixtures]
root = "{root}"
"#,
        locks = dir.path().join("locks.json").display(),
        root = dir.path().display(),
    ))
    .unwrap();
    let coordinator = TestCoordinator::from_config(&config).unwrap();

    let fixture = FixtureRef::new("users", "valid");
    let a = coordinator
        .setup(TestSpec::new("cart_a", Platform::Android).with_fixture(fixture.clone()))
        .await
        .unwrap();
    let b = coordinator
        .setup(TestSpec::new("cart_b", Platform::Android).with_fixture(fixture.at(1)))
        .await
        .unwrap();

    assert_ne!(a.allocation.device_id, b.allocation.device_id);
    assert_eq!(a.handoff.target.url(), "http://10.0.2.2:4723/wd/hub");
    assert_eq!(a.handoff.capabilities["deviceName"], json!("Pixel 7"));
    assert!(b.handoff.capabilities.get("deviceName").is_none());
    assert!(a.data.get_str("username").unwrap().starts_with("alice_"));
    assert!(b.data.get_str("username").unwrap().starts_with("bob_"));

    assert!(coordinator.teardown("cart_a").await);
    assert!(coordinator.teardown("cart_b").await);
    assert_eq!(coordinator.isolation().active_count(), 0);
}

#[tokio::test]
async fn test_concurrent_setups_get_distinct_devices() {
    let dir = fixture_root();
    let config = LabConfig::from_toml(&format!(
        r#"
[pool]
lock_table = "{locks}"

[[pool.devices]]
id = "emulator-5554"
platform = "android"

[[pool.devices]]
id = "emulator-5556"
platform = "android"

[fixtures]
root = "{root}"
"#,
        locks = dir.path().join("locks.json").display(),
        root = dir.path().display(),
    ))
    .unwrap();
    let coordinator = TestCoordinator::from_config(&config).unwrap();

    let fixture = FixtureRef::new("users", "valid");
    let sessions = futures::future::join_all(["checkout_a", "checkout_b"].map(|test_id| {
        coordinator.setup(TestSpec::new(test_id, Platform::Android).with_fixture(fixture.clone()))
    }))
    .await
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .unwrap();

    let devices: HashSet<_> = sessions.iter().map(|s| s.allocation.device_id.clone()).collect();
    assert_eq!(devices.len(), 2);
    assert_ne!(sessions[0].data.context_id, sessions[1].data.context_id);
    assert!(coordinator
        .setup(TestSpec::new("checkout_c", Platform::Android))
        .await
        .is_err());

    let released = futures::future::join_all(
        ["checkout_a", "checkout_b"].map(|test_id| coordinator.teardown(test_id)),
    )
    .await;
    assert!(released.into_iter().all(|ok| ok));
    assert_eq!(coordinator.isolation().active_count(), 0);
}
