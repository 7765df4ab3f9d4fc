use std::env;
use std::sync::Arc;
use std::time::Duration;

use sensibo_sync::{
    spawn_device, ChannelSink, DeviceConfig, DeviceKind, MemoryStore, SchedulerOptions,
    SensiboClient,
};

fn live_client() -> SensiboClient {
    let key = env::var("SENSIBO_API_KEY").expect("SENSIBO_API_KEY must be set");
    SensiboClient::builder(key).build().expect("client should build")
}

/// Run with: SENSIBO_API_KEY=... cargo test --test integration -- --ignored
/// Read-only against the real cloud API.
#[tokio::test]
#[ignore]
async fn list_and_snapshot() {
    let client = live_client();
    let pods = client.list_devices().await.expect("listing failed");
    assert!(!pods.is_empty(), "account should have at least one pod");

    for pod in &pods {
        let snapshot = client
            .fetch_snapshot(&pod.id)
            .await
            .unwrap_or_else(|e| panic!("snapshot of {} failed: {e}", pod.id));
        println!("{}: {:?}", pod.id, snapshot.ac_state);
    }
}

#[tokio::test]
#[ignore]
async fn first_poll_populates_store() {
    let client = live_client();
    let pods = client.list_devices().await.expect("listing failed");
    let pod = pods
        .iter()
        .find(|p| {
            p.product_model
                .as_deref()
                .and_then(DeviceKind::from_product_model)
                .is_some()
        })
        .expect("no supported pod");
    let kind = pod
        .product_model
        .as_deref()
        .and_then(DeviceKind::from_product_model)
        .unwrap();

    let (sink, _events) = ChannelSink::new();
    let store = Arc::new(MemoryStore::new());
    let options = SchedulerOptions {
        initial_delay: Duration::from_millis(100),
        ..Default::default()
    };
    let handle = spawn_device(
        DeviceConfig::new(&pod.id, kind),
        client.clone(),
        Arc::new(sink),
        store.clone(),
        options,
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    let values = store.snapshot(&pod.id);
    println!("{values:#?}");
    assert!(!values.is_empty(), "first poll should write capabilities");
    handle.remove();
}
