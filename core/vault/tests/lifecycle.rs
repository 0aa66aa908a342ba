use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use memvault_common::{Error, SensitiveBytes};
use memvault_storage::{KeyValueStore, LocalStore, MemoryStore};
use memvault_vault::records::SESSION_KEY;
use memvault_vault::{
    Capsule, CapsuleStore, DeviceProfile, EnvironmentProbe, KeyringState, SessionStateManager,
    StaticProbe, VaultConfig, VaultController, VaultEvent, VaultOperations,
};

const PASSPHRASE: &str = "correct horse battery staple";

fn probe() -> Arc<dyn EnvironmentProbe> {
    Arc::new(StaticProbe(DeviceProfile {
        os: Some("linux".into()),
        arch: Some("x86_64".into()),
        family: Some("unix".into()),
        cpu_count: Some(8),
        hostname: Some("family-desktop".into()),
        locale: Some("en_US.UTF-8".into()),
    }))
}

fn config() -> VaultConfig {
    VaultConfig {
        status_cache_ttl_ms: 0,
        ..VaultConfig::for_testing()
    }
}

async fn started(store: Arc<dyn KeyValueStore>) -> Arc<SessionStateManager> {
    started_with(config(), store, probe()).await
}

async fn started_with(
    config: VaultConfig,
    store: Arc<dyn KeyValueStore>,
    probe: Arc<dyn EnvironmentProbe>,
) -> Arc<SessionStateManager> {
    let manager = Arc::new(SessionStateManager::with_probe(config, store, probe));
    manager.initialize().await.unwrap();
    manager
}

fn cached_config() -> VaultConfig {
    VaultConfig {
        status_cache_ttl_ms: 60_000,
        ..VaultConfig::for_testing()
    }
}

/// Wait until the manager has handled another context's change to `key`.
async fn external_change(events: &mut broadcast::Receiver<VaultEvent>, key: &str) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(VaultEvent::ExternalChange { key: changed }) if changed == key => return,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("no external change observed");
}

fn pass(s: &str) -> SensitiveBytes {
    SensitiveBytes::from(s)
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_first_setup_unlocks() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;

    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();

    let status = manager.get_status().await;
    assert!(status.initialized);
    assert!(status.has_settings);
    assert!(status.is_unlocked);
    assert!(status.has_valid_session);
    assert!(status.last_unlocked_at.is_some());
}

#[tokio::test]
async fn test_wrong_passphrase_stays_locked() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    manager.lock().await.unwrap();

    let err = manager.unlock(&pass("correct horse battery stapler")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidPassphrase));
    assert_eq!(err.user_message(), memvault_common::error::GENERIC_AUTH_MESSAGE);

    let status = manager.get_status().await;
    assert!(!status.is_unlocked);
    assert!(!status.has_valid_session);
}

#[tokio::test]
async fn test_unlock_before_setup_not_initialized() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;

    assert!(matches!(
        manager.unlock(&pass(PASSPHRASE)).await,
        Err(Error::VaultNotInitialized)
    ));
}

#[tokio::test]
async fn test_restart_restores_session() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    drop(manager);

    let restarted = started(Arc::new(store.new_context())).await;
    let status = restarted.get_status().await;

    assert!(status.is_unlocked);
    assert!(status.has_valid_session);
    assert_eq!(status.keyring_state, KeyringState::SessionOnly);
}

#[tokio::test]
async fn test_restart_on_local_store() {
    let dir = tempfile::tempdir().unwrap();
    let manager = started(Arc::new(LocalStore::new(dir.path()).unwrap())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    drop(manager);

    let restarted = started(Arc::new(LocalStore::new(dir.path()).unwrap())).await;
    assert!(restarted.is_unlocked());

    restarted.unlock(&pass(PASSPHRASE)).await.unwrap();
    assert_eq!(restarted.keyring().state(), KeyringState::KeyHeld);
}

#[tokio::test]
async fn test_old_session_rejected_after_restart() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    drop(manager);

    let raw = store.get(SESSION_KEY).await.unwrap().unwrap();
    let mut record: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    record["createdAt"] = serde_json::to_value(Utc::now() - ChronoDuration::days(31)).unwrap();
    store
        .set(SESSION_KEY, serde_json::to_vec(&record).unwrap())
        .await
        .unwrap();

    let restarted = started(Arc::new(store.new_context())).await;
    assert!(!restarted.is_unlocked());
    assert!(!restarted.get_status().await.has_valid_session);
    assert!(store.get(SESSION_KEY).await.unwrap().is_none());
}

#[tokio::test]
async fn test_session_from_other_device_rejected() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    drop(manager);

    let elsewhere: Arc<dyn EnvironmentProbe> = Arc::new(StaticProbe(DeviceProfile {
        os: Some("linux".into()),
        arch: Some("x86_64".into()),
        family: Some("unix".into()),
        cpu_count: Some(8),
        hostname: Some("stolen-laptop".into()),
        locale: Some("en_US.UTF-8".into()),
    }));
    let restarted = Arc::new(SessionStateManager::with_probe(
        config(),
        Arc::new(store.new_context()),
        elsewhere,
    ));
    restarted.initialize().await.unwrap();

    assert!(!restarted.is_unlocked());
}

#[tokio::test]
async fn test_unavailable_store_reports_degraded_status() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();

    store.set_available(false);
    let status = manager.get_status().await;

    assert!(status.error.is_some());
    assert!(!status.has_valid_session);
    assert!(!status.is_unlocked);
    assert_eq!(status.keyring_state, KeyringState::KeyHeld);

    let fresh = started(Arc::new(store.new_context())).await;
    let status = fresh.get_status().await;
    assert!(status.error.is_some());
    assert!(!status.is_unlocked);
}

#[tokio::test]
async fn test_lock_is_idempotent() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();

    manager.lock().await.unwrap();
    manager.lock().await.unwrap();

    let status = manager.get_status().await;
    assert!(!status.is_unlocked);
    assert!(status.initialized);
    assert!(store.get(SESSION_KEY).await.unwrap().is_none());
}

#[tokio::test]
async fn test_lock_propagates_across_contexts() {
    let store = MemoryStore::new();
    let background = started(Arc::new(store.new_context())).await;
    background.initialize_vault(&pass(PASSPHRASE)).await.unwrap();

    let foreground = started(Arc::new(store.new_context())).await;
    foreground.unlock(&pass(PASSPHRASE)).await.unwrap();
    assert!(background.is_unlocked());

    foreground.lock().await.unwrap();

    let background_ref = background.clone();
    assert!(eventually(move || !background_ref.is_unlocked()).await);
}

#[tokio::test]
async fn test_unlock_elsewhere_is_adopted() {
    let store = MemoryStore::new();
    let background = started(Arc::new(store.new_context())).await;
    background.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    background.lock().await.unwrap();

    let foreground = started(Arc::new(store.new_context())).await;
    assert!(!foreground.is_unlocked());

    background.unlock(&pass(PASSPHRASE)).await.unwrap();

    let foreground_ref = foreground.clone();
    assert!(eventually(move || foreground_ref.is_unlocked()).await);
    assert_eq!(foreground.keyring().state(), KeyringState::SessionOnly);
}

#[tokio::test]
async fn test_cached_status_follows_lock_in_other_context() {
    let store = MemoryStore::new();
    let background = started_with(cached_config(), Arc::new(store.new_context()), probe()).await;
    background.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    let foreground = started_with(cached_config(), Arc::new(store.new_context()), probe()).await;

    assert!(background.get_status().await.is_unlocked);
    assert!(foreground.get_status().await.is_unlocked);

    let mut events = background.subscribe();
    foreground.lock().await.unwrap();
    assert!(!foreground.get_status().await.is_unlocked);

    external_change(&mut events, SESSION_KEY).await;
    let status = background.get_status().await;
    assert!(!status.is_unlocked);
    assert!(!status.has_valid_session);
}

#[tokio::test]
async fn test_cached_status_follows_unlock_in_other_context() {
    let store = MemoryStore::new();
    let background = started_with(cached_config(), Arc::new(store.new_context()), probe()).await;
    background.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    background.lock().await.unwrap();
    let foreground = started_with(cached_config(), Arc::new(store.new_context()), probe()).await;
    assert!(!foreground.get_status().await.is_unlocked);

    let mut events = foreground.subscribe();
    background.unlock(&pass(PASSPHRASE)).await.unwrap();

    external_change(&mut events, SESSION_KEY).await;
    let status = foreground.get_status().await;
    assert!(status.is_unlocked);
    assert!(status.has_valid_session);
}

#[tokio::test]
async fn test_unadoptable_session_left_for_its_owner() {
    let store = MemoryStore::new();
    let owner = started(Arc::new(store.new_context())).await;
    owner.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    owner.lock().await.unwrap();

    let elsewhere: Arc<dyn EnvironmentProbe> = Arc::new(StaticProbe(DeviceProfile {
        hostname: Some("another-host".into()),
        ..probe().profile()
    }));
    let observer = started_with(config(), Arc::new(store.new_context()), elsewhere).await;
    let mut events = observer.subscribe();

    owner.unlock(&pass(PASSPHRASE)).await.unwrap();
    external_change(&mut events, SESSION_KEY).await;

    assert!(!observer.is_unlocked());
    assert!(owner.is_unlocked());
    assert!(store.get(SESSION_KEY).await.unwrap().is_some());
    assert!(owner.get_status().await.has_valid_session);
}

#[tokio::test]
async fn test_import_across_kdf_configurations() {
    let strong = started_with(
        VaultConfig {
            kdf_iterations: 20_000,
            ..config()
        },
        Arc::new(MemoryStore::new()),
        probe(),
    )
    .await;
    strong.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    let capsules = CapsuleStore::new(strong.clone());
    capsules.put(Capsule::text("Wedding", "June, in the rain")).await.unwrap();
    let container = VaultOperations::new(strong.clone(), capsules)
        .export(&pass(PASSPHRASE))
        .await
        .unwrap();

    let light = started_with(
        VaultConfig {
            kdf_iterations: 10_000,
            ..config()
        },
        Arc::new(MemoryStore::new()),
        probe(),
    )
    .await;
    light.initialize_vault(&pass("another passphrase")).await.unwrap();
    let operations = VaultOperations::new(light.clone(), CapsuleStore::new(light.clone()));

    let summary = operations.import(&container, &pass(PASSPHRASE)).await.unwrap();
    assert_eq!(summary.added, 1);
}

#[tokio::test]
async fn test_export_import_between_vaults() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();

    let capsules = CapsuleStore::new(manager.clone());
    let operations = VaultOperations::new(manager.clone(), capsules.clone());
    capsules
        .put(Capsule::text("First day of school", "She wore the red coat.").with_tags(["family"]))
        .await
        .unwrap();
    capsules.put(Capsule::text("Recipe", "Soup")).await.unwrap();

    let container = operations.export(&pass(PASSPHRASE)).await.unwrap();
    assert_eq!(&container[..4], b"MVC1");

    let other = started(Arc::new(MemoryStore::new())).await;
    other.initialize_vault(&pass("different vault passphrase")).await.unwrap();
    let other_operations = VaultOperations::new(other.clone(), CapsuleStore::new(other.clone()));

    let summary = other_operations.import(&container, &pass(PASSPHRASE)).await.unwrap();
    assert_eq!((summary.added, summary.skipped), (2, 0));

    let again = other_operations.import(&container, &pass(PASSPHRASE)).await.unwrap();
    assert_eq!((again.added, again.skipped), (0, 2));
}

#[tokio::test]
async fn test_import_failures() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    let operations = VaultOperations::new(manager.clone(), CapsuleStore::new(manager.clone()));

    let container = operations.export(&pass(PASSPHRASE)).await.unwrap();
    assert!(matches!(
        operations.import(&container, &pass("nope")).await,
        Err(Error::InvalidPassphrase)
    ));
    assert!(matches!(
        operations.import(b"PK\x03\x04not a container", &pass(PASSPHRASE)).await,
        Err(Error::CorruptContainer(_))
    ));

    manager.lock().await.unwrap();
    assert!(matches!(
        operations.import(&container, &pass(PASSPHRASE)).await,
        Err(Error::VaultLocked)
    ));
}

#[tokio::test]
async fn test_export_needs_live_key() {
    let store = MemoryStore::new();
    let manager = started(Arc::new(store.new_context())).await;
    manager.initialize_vault(&pass(PASSPHRASE)).await.unwrap();
    drop(manager);

    let restarted = started(Arc::new(store.new_context())).await;
    let operations = VaultOperations::new(restarted.clone(), CapsuleStore::new(restarted.clone()));
    assert!(restarted.is_unlocked());
    assert!(matches!(
        operations.export(&pass(PASSPHRASE)).await,
        Err(Error::VaultLocked)
    ));

    restarted.unlock(&pass(PASSPHRASE)).await.unwrap();
    assert!(matches!(
        operations.export(&pass("wrong")).await,
        Err(Error::InvalidPassphrase)
    ));
    assert!(operations.export(&pass(PASSPHRASE)).await.is_ok());
}

#[tokio::test]
async fn test_controller_round_trip() {
    let store = MemoryStore::new();
    let manager = Arc::new(SessionStateManager::with_probe(
        config(),
        Arc::new(store.new_context()),
        probe(),
    ));
    let (controller, client) = VaultController::new(manager);
    let running = tokio::spawn(controller.run());

    assert!(!client.status().await.initialized);
    client.initialize_vault(pass(PASSPHRASE)).await.unwrap();

    let capsule = Capsule::text("Garden", "Planted the apple tree");
    let id = capsule.id;
    client.put_capsule(capsule).await.unwrap();
    assert_eq!(client.get_capsule(id).await.unwrap().title, "Garden");

    let container = client.export(pass(PASSPHRASE)).await.unwrap();

    client.lock().await.unwrap();
    assert!(matches!(client.list_capsules().await, Err(Error::VaultLocked)));

    client.unlock(pass(PASSPHRASE)).await.unwrap();
    assert!(client.list_capsules().await.unwrap().is_empty());

    let summary = client.import(container, pass(PASSPHRASE)).await.unwrap();
    assert_eq!(summary.added, 1);

    client.shutdown().await;
    running.await.unwrap().unwrap();

    let status = client.status().await;
    assert!(status.error.is_some());
    assert!(!status.is_unlocked);
}
