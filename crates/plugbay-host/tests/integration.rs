//! End-to-end tests driving real plugins (tiny hand-assembled Wasm modules)
//! through the full host: registration, priority scheduling, retries,
//! hotplug routing, and unload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use plugbay_host::{
    HostConfig, HostError, HostEvent, LoadPriority, PluginHost, RetryPolicy, UsbAction,
};

/// Smallest valid module: header only.  Loads fine, handles nothing.
fn minimal_wasm() -> Vec<u8> {
    vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00]
}

/// Exports a `handle_hook` that spins forever on every hook, the load hook
/// included, so the plugin's load runs until its wall-clock deadline.
fn spinning_wasm() -> Vec<u8> {
    let mut m = minimal_wasm();
    // type: (i32, i32, i32) -> i32
    m.extend_from_slice(&[0x01, 0x08, 0x01, 0x60, 0x03, 0x7F, 0x7F, 0x7F, 0x01, 0x7F]);
    // one func of type 0
    m.extend_from_slice(&[0x03, 0x02, 0x01, 0x00]);
    // export "handle_hook" -> func 0
    m.extend_from_slice(&[
        0x07, 0x0F, 0x01, 0x0B, b'h', b'a', b'n', b'd', b'l', b'e', b'_', b'h', b'o', b'o', b'k',
        0x00, 0x00,
    ]);
    // code: loop(void) br 0 end; unreachable
    m.extend_from_slice(&[
        0x0A, 0x0A, 0x01, 0x08, 0x00, 0x03, 0x40, 0x0C, 0x00, 0x0B, 0x00, 0x0B,
    ]);
    m
}

/// Write a plugin directory: descriptor plus entry module.
fn write_plugin(
    root: &Path,
    name: &str,
    wasm: &[u8],
    hooks: serde_json::Value,
    timeout_ms: u64,
) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("plugin dir must be creatable in tests");
    std::fs::write(dir.join("plugin.wasm"), wasm).expect("entry module must be writable");

    let manifest = serde_json::json!({
        "name": name,
        "version": "1.0.0",
        "entry": "plugin.wasm",
        "permissions": {
            "fs": [],
            "network": false,
            "maxHeapBytes": 16 * 1024 * 1024,
            "maxCpuMs": 60_000,
            "timeoutMs": timeout_ms,
        },
        "hooks": hooks,
    });
    std::fs::write(
        dir.join("plugin.json"),
        serde_json::to_vec_pretty(&manifest).expect("manifest must serialize"),
    )
    .expect("manifest must be writable");
    dir
}

async fn next_event(rx: &mut broadcast::Receiver<Arc<HostEvent>>) -> Arc<HostEvent> {
    tokio::time::timeout(Duration::from_secs(20), rx.recv())
        .await
        .expect("event wait timed out")
        .expect("event bus closed")
}

async fn next_loaded(rx: &mut broadcast::Receiver<Arc<HostEvent>>) -> (String, LoadPriority) {
    loop {
        let event = next_event(rx).await;
        if let HostEvent::PluginLoaded { name, priority, .. } = event.as_ref() {
            return (name.clone(), *priority);
        }
    }
}

#[tokio::test]
async fn priority_precedence_with_fifo_within_a_tier() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");

    // One load lane, no retries: the blocker occupies the lane while the
    // real contenders queue up behind it, then drops out.
    let host = PluginHost::new(
        HostConfig::new()
            .with_max_concurrent_loads(1)
            .with_retry(RetryPolicy::new().with_max_attempts(1)),
    )
    .expect("host must start");
    let mut events = host.subscribe();

    let blocker = host
        .register_plugin(&write_plugin(
            tmp.path(),
            "blocker",
            &spinning_wasm(),
            serde_json::json!({}),
            1500,
        ))
        .await
        .expect("register must succeed");
    host.enqueue(
        blocker.manifest().clone(),
        blocker.entry_path().to_path_buf(),
        LoadPriority::Critical,
    )
    .await
    .expect("enqueue must succeed");

    // Queue A(Critical), B(Normal), C(Critical) behind the blocker.
    for (name, priority) in [
        ("a", LoadPriority::Critical),
        ("b", LoadPriority::Normal),
        ("c", LoadPriority::Critical),
    ] {
        let handle = host
            .register_plugin(&write_plugin(
                tmp.path(),
                name,
                &minimal_wasm(),
                serde_json::json!({}),
                2000,
            ))
            .await
            .expect("register must succeed");
        host.enqueue(
            handle.manifest().clone(),
            handle.entry_path().to_path_buf(),
            priority,
        )
        .await
        .expect("enqueue must succeed");
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(next_loaded(&mut events).await.0);
    }
    assert_eq!(order, vec!["a", "c", "b"]);
}

#[tokio::test]
async fn failed_load_is_dropped_after_three_attempts() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");
    let host = PluginHost::new(HostConfig::default()).expect("host must start");
    let mut events = host.subscribe();

    // Garbage bytes: every load attempt fails at compilation.
    let dir = write_plugin(tmp.path(), "broken", b"not wasm", serde_json::json!({}), 2000);
    let handle = host
        .register_plugin(&dir)
        .await
        .expect("register must succeed");

    let err = host
        .load_now(
            handle.manifest().clone(),
            handle.entry_path().to_path_buf(),
            LoadPriority::Normal,
        )
        .await
        .unwrap_err();
    match err {
        HostError::LoadFailed { name, attempts, .. } => {
            assert_eq!(name, "broken");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected LoadFailed, got {other}"),
    }

    // Exactly one LoadFailed event, carrying the final attempt count.
    let event = next_event(&mut events).await;
    assert!(matches!(
        event.as_ref(),
        HostEvent::PluginLoadFailed { name, attempts: 3, .. } if name == "broken"
    ));

    let metrics = host.metrics().await.expect("metrics must be readable");
    assert_eq!(metrics.total_loads, 3);
    assert_eq!(metrics.failed_loads, 1);
    assert_eq!(metrics.loaded_count, 0);
    assert_eq!(metrics.queued_count, 0);
}

#[tokio::test]
async fn duplicate_enqueue_raises_priority_without_duplicating() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");
    let host = PluginHost::new(
        HostConfig::new()
            .with_max_concurrent_loads(1)
            .with_retry(RetryPolicy::new().with_max_attempts(1)),
    )
    .expect("host must start");

    let blocker = host
        .register_plugin(&write_plugin(
            tmp.path(),
            "blocker",
            &spinning_wasm(),
            serde_json::json!({}),
            1500,
        ))
        .await
        .expect("register must succeed");
    host.enqueue(
        blocker.manifest().clone(),
        blocker.entry_path().to_path_buf(),
        LoadPriority::Critical,
    )
    .await
    .expect("enqueue must succeed");

    let handle = host
        .register_plugin(&write_plugin(
            tmp.path(),
            "dup",
            &minimal_wasm(),
            serde_json::json!({}),
            2000,
        ))
        .await
        .expect("register must succeed");
    for priority in [LoadPriority::Normal, LoadPriority::Critical] {
        host.enqueue(
            handle.manifest().clone(),
            handle.entry_path().to_path_buf(),
            priority,
        )
        .await
        .expect("enqueue must succeed");
    }

    let status = host.status().await.expect("status must be readable");
    let queued: Vec<_> = status.queued.iter().filter(|t| t.name == "dup").collect();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].priority, LoadPriority::Critical);
}

#[tokio::test]
async fn unloading_an_absent_plugin_has_no_side_effects() {
    let host = PluginHost::new(HostConfig::default()).expect("host must start");

    let err = host.unload("ghost").await.unwrap_err();
    assert!(matches!(err, HostError::NotLoaded { name } if name == "ghost"));

    let status = host.status().await.expect("status must be readable");
    assert!(status.loaded.is_empty());
    assert!(status.queued.is_empty());
    assert!(status.loading.is_empty());
}

#[tokio::test]
async fn hotplug_event_triggers_one_high_priority_lazy_load() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");
    let host = PluginHost::new(HostConfig::default()).expect("host must start");
    let mut events = host.subscribe();

    // Registered, declares onUSBAttach, never explicitly loaded.
    host.register_plugin(&write_plugin(
        tmp.path(),
        "badge",
        &minimal_wasm(),
        serde_json::json!({ "onUSBAttach": "handleAttach" }),
        2000,
    ))
    .await
    .expect("register must succeed");

    let device = serde_json::json!({ "vendorId": 0x1234, "productId": 0x5678 });
    host.dispatch_usb_event(UsbAction::Attach, device.clone())
        .await
        .expect("dispatch must succeed");
    // A second event before the load completes replaces the buffered one
    // and must not trigger a second load.
    host.dispatch_usb_event(UsbAction::Attach, device)
        .await
        .expect("dispatch must succeed");

    let (name, priority) = next_loaded(&mut events).await;
    assert_eq!(name, "badge");
    assert_eq!(priority, LoadPriority::High);

    let metrics = host.metrics().await.expect("metrics must be readable");
    assert_eq!(metrics.total_loads, 1);
    assert_eq!(metrics.loaded_count, 1);
}

#[tokio::test]
async fn reload_after_unload_gets_a_fresh_worker() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");
    let host = PluginHost::new(HostConfig::default()).expect("host must start");

    let dir = write_plugin(
        tmp.path(),
        "cycled",
        &minimal_wasm(),
        serde_json::json!({}),
        2000,
    );
    let handle = host
        .register_plugin(&dir)
        .await
        .expect("register must succeed");

    let first = host
        .load_now(
            handle.manifest().clone(),
            handle.entry_path().to_path_buf(),
            LoadPriority::Normal,
        )
        .await
        .expect("first load must succeed");

    host.unload("cycled").await.expect("unload must succeed");
    assert!(host
        .status()
        .await
        .expect("status must be readable")
        .loaded
        .is_empty());

    let second = host
        .load_now(
            handle.manifest().clone(),
            handle.entry_path().to_path_buf(),
            LoadPriority::Normal,
        )
        .await
        .expect("second load must succeed");

    assert_ne!(first.worker_id, second.worker_id);
}

#[tokio::test]
async fn unload_reclaims_the_worker_before_announcing() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");
    let host = PluginHost::new(HostConfig::default()).expect("host must start");
    let mut events = host.subscribe();

    let dir = write_plugin(
        tmp.path(),
        "cycle",
        &minimal_wasm(),
        serde_json::json!({}),
        2000,
    );
    let handle = host
        .register_plugin(&dir)
        .await
        .expect("register must succeed");
    let first = host
        .load_now(
            handle.manifest().clone(),
            handle.entry_path().to_path_buf(),
            LoadPriority::Normal,
        )
        .await
        .expect("first load must succeed");

    host.unload("cycle").await.expect("unload must succeed");

    // The unloaded event only fires once the worker is back in the pool.
    loop {
        let event = next_event(&mut events).await;
        if let HostEvent::PluginUnloaded { name } = event.as_ref() {
            assert_eq!(name, "cycle");
            break;
        }
    }
    let status = host.status().await.expect("status must be readable");
    assert_eq!(status.pool.ready, 0);
    assert_eq!(status.pool.executing, 0);

    // The name is free again: a reload lands on a fresh worker.
    let second = host
        .load_now(
            handle.manifest().clone(),
            handle.entry_path().to_path_buf(),
            LoadPriority::Normal,
        )
        .await
        .expect("reload must succeed");
    assert_ne!(first.worker_id, second.worker_id);
}

#[tokio::test]
async fn shutdown_stops_the_coordinator() {
    let host = PluginHost::new(HostConfig::default()).expect("host must start");
    host.shutdown().await.expect("shutdown must succeed");

    let err = host.status().await.unwrap_err();
    assert!(matches!(err, HostError::Shutdown));
}

#[tokio::test]
async fn lazy_handles_are_idempotent_and_resolve_once() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");
    let host = PluginHost::new(HostConfig::default()).expect("host must start");

    let dir = write_plugin(
        tmp.path(),
        "lazy",
        &minimal_wasm(),
        serde_json::json!({}),
        2000,
    );
    let first = host
        .register_plugin(&dir)
        .await
        .expect("register must succeed");
    let second = host
        .register_plugin(&dir)
        .await
        .expect("register must succeed");
    assert_eq!(first.name(), second.name());

    first.resolve().await.expect("resolve must succeed");
    second.resolve().await.expect("resolve must succeed");

    let metrics = host.metrics().await.expect("metrics must be readable");
    assert_eq!(metrics.total_loads, 1);
    assert_eq!(metrics.loaded_count, 1);
}

#[tokio::test]
async fn load_now_times_out_without_cancelling_the_load() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");
    // The spinning plugin's load outlives the caller's patience.
    let host = PluginHost::new(HostConfig::new().with_load_timeout_ms(200))
        .expect("host must start");

    let handle = host
        .register_plugin(&write_plugin(
            tmp.path(),
            "slow",
            &spinning_wasm(),
            serde_json::json!({}),
            3000,
        ))
        .await
        .expect("register must succeed");

    let err = host
        .load_now(
            handle.manifest().clone(),
            handle.entry_path().to_path_buf(),
            LoadPriority::Normal,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::LoadTimeout { name, .. } if name == "slow"));

    // The dispatched load is still in flight.
    let status = host.status().await.expect("status must be readable");
    assert!(status.loading.contains(&"slow".to_string()));
}

#[tokio::test]
async fn jobs_require_a_loaded_instance() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");
    let host = PluginHost::new(HostConfig::default()).expect("host must start");

    let err = host
        .dispatch_job("absent", serde_json::json!({ "work": 1 }))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::NotLoaded { .. }));

    let handle = host
        .register_plugin(&write_plugin(
            tmp.path(),
            "worker",
            &minimal_wasm(),
            serde_json::json!({ "onJobReceived": "work" }),
            2000,
        ))
        .await
        .expect("register must succeed");
    handle.resolve().await.expect("resolve must succeed");

    host.dispatch_job("worker", serde_json::json!({ "work": 1 }))
        .await
        .expect("job dispatch must succeed");
}

#[tokio::test]
async fn set_priority_on_unknown_task_is_not_found() {
    let host = PluginHost::new(HostConfig::default()).expect("host must start");
    let err = host
        .set_priority("nobody", LoadPriority::Critical)
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::NotFound { .. }));
}

#[tokio::test]
async fn rejected_manifest_surfaces_the_offending_field() {
    let tmp = tempfile::tempdir().expect("tempdir must be creatable in tests");
    let dir = tmp.path().join("escapee");
    std::fs::create_dir_all(&dir).expect("plugin dir must be creatable");
    std::fs::write(
        dir.join("plugin.json"),
        serde_json::json!({
            "name": "escapee",
            "version": "1.0.0",
            "entry": "../outside.wasm",
        })
        .to_string(),
    )
    .expect("manifest must be writable");

    let host = PluginHost::new(HostConfig::default()).expect("host must start");
    let err = host.register_plugin(&dir).await.unwrap_err();
    assert!(matches!(err, HostError::ManifestInvalid(_)));
}
