//! Account-wide bulk polling.
//!
//! Devices registered with [`PollMode::Fleet`] do not poll their own pod.
//! Instead one request per credential fetches every pod of the account and
//! the results are handed to the matching device tasks. The grouping is
//! rebuilt from the registry on every tick.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::SensiboClient;
use crate::config::{FleetConfig, PollMode};
use crate::scheduler::DeviceHandle;
use crate::Result;

/// Source of the currently registered devices.
pub trait DeviceRegistry: Send + Sync {
    fn devices(&self) -> Vec<DeviceHandle>;
}

/// Shared, cloneable device list.
#[derive(Debug, Clone, Default)]
pub struct DeviceSet {
    devices: Arc<RwLock<Vec<DeviceHandle>>>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a handle registered under the same id.
    pub fn insert(&self, handle: DeviceHandle) {
        let mut devices = self.devices.write();
        if let Some(old) = devices
            .iter()
            .position(|d| d.device_id() == handle.device_id())
        {
            devices.swap_remove(old).remove();
        }
        devices.push(handle);
    }

    /// Unregister and stop a device.
    pub fn remove(&self, device_id: &str) -> Option<DeviceHandle> {
        let mut devices = self.devices.write();
        let pos = devices.iter().position(|d| d.device_id() == device_id)?;
        let handle = devices.remove(pos);
        handle.remove();
        Some(handle)
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceHandle> {
        self.devices
            .read()
            .iter()
            .find(|d| d.device_id() == device_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl DeviceRegistry for DeviceSet {
    fn devices(&self) -> Vec<DeviceHandle> {
        self.devices
            .read()
            .iter()
            .filter(|d| !d.is_removed())
            .cloned()
            .collect()
    }
}

/// Fleet devices sharing one credential.
#[derive(Debug, Clone)]
pub struct FleetGroup {
    client: SensiboClient,
    /// Shortest polling interval among the members.
    pub interval: Duration,
    pub members: Vec<DeviceHandle>,
}

impl FleetGroup {
    pub fn api_key(&self) -> &str {
        self.client.api_key()
    }

    fn member(&self, device_id: &str) -> Option<&DeviceHandle> {
        self.members.iter().find(|m| m.device_id() == device_id)
    }
}

/// Credential → fleet group snapshot of a registry.
#[derive(Debug, Clone, Default)]
pub struct FleetIndex {
    groups: BTreeMap<String, FleetGroup>,
}

impl FleetIndex {
    pub fn build(devices: impl IntoIterator<Item = DeviceHandle>) -> Self {
        let mut groups: BTreeMap<String, FleetGroup> = BTreeMap::new();
        for device in devices {
            if device.mode() != PollMode::Fleet || device.is_removed() {
                continue;
            }
            let interval = device.settings().polling_interval();
            match groups.get_mut(device.api_key()) {
                Some(group) => {
                    group.interval = group.interval.min(interval);
                    group.members.push(device);
                }
                None => {
                    groups.insert(
                        device.api_key().to_string(),
                        FleetGroup {
                            client: device.client().clone(),
                            interval,
                            members: vec![device],
                        },
                    );
                }
            }
        }
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> impl Iterator<Item = &FleetGroup> {
        self.groups.values()
    }

    pub fn group(&self, api_key: &str) -> Option<&FleetGroup> {
        self.groups.get(api_key)
    }
}

/// Fetch every pod of the group's account and hand each snapshot, and each
/// room sensor reported inside it, to its device. Returns the number of
/// deliveries.
pub async fn poll_group(group: &FleetGroup) -> Result<usize> {
    let snapshots = group.client.fetch_fleet_snapshot().await?;
    let mut delivered = 0;
    for snapshot in snapshots {
        let sensors: Vec<_> = snapshot
            .motion_sensors
            .iter()
            .flatten()
            .map(|s| s.to_snapshot())
            .collect();
        for snapshot in std::iter::once(snapshot).chain(sensors) {
            let Some(member) = group.member(&snapshot.id) else {
                trace!(device = %snapshot.id, "not registered, skipping");
                continue;
            };
            match member.deliver(snapshot).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(device = %member.device_id(), error = %e, "delivery failed"),
            }
        }
    }
    Ok(delivered)
}

/// Background task driving [`poll_group`] for every credential.
#[derive(Debug)]
pub struct FleetPoller {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FleetPoller {
    pub fn spawn(registry: Arc<dyn DeviceRegistry>, config: FleetConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(registry, config, cancel.clone()));
        Self { cancel, task }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for FleetPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(registry: Arc<dyn DeviceRegistry>, config: FleetConfig, cancel: CancellationToken) {
    let mut last_polled: HashMap<String, Instant> = HashMap::new();

    loop {
        let index = FleetIndex::build(registry.devices());
        let wait = if index.is_empty() {
            config.idle_interval
        } else {
            let now = Instant::now();
            index
                .groups()
                .map(|g| match last_polled.get(g.api_key()) {
                    Some(at) => (*at + g.interval).saturating_duration_since(now),
                    None => Duration::ZERO,
                })
                .min()
                .unwrap_or(config.idle_interval)
        };
        let delay = wait + jitter(&config.jitter);
        trace!(delay = ?delay, "next fleet poll");

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = sleep(delay) => {}
        }

        // devices may have come or gone while sleeping
        let index = FleetIndex::build(registry.devices());
        let now = Instant::now();
        for group in index.groups() {
            let due = last_polled
                .get(group.api_key())
                .is_none_or(|at| now >= *at + group.interval);
            if !due {
                continue;
            }
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                r = poll_group(group) => r,
            };
            last_polled.insert(group.api_key().to_string(), Instant::now());
            match result {
                Ok(n) => debug!(devices = group.members.len(), delivered = n, "fleet poll done"),
                Err(e) => warn!(error = %e, "fleet poll failed"),
            }
        }
        last_polled.retain(|key, _| index.group(key).is_some());
    }
    debug!("fleet poller stopped");
}

fn jitter(range: &RangeInclusive<Duration>) -> Duration {
    let (lo, hi) = (range.start().as_millis() as u64, range.end().as_millis() as u64);
    if hi <= lo {
        return Duration::from_millis(lo);
    }
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::timeout;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::capability::{
        Capability, CapabilityStore, CapabilityValue, DeviceKind, MemoryStore,
    };
    use crate::config::{DeviceConfig, DeviceSettings, SchedulerOptions};
    use crate::protocol::FLEET_FIELDS;
    use crate::scheduler::spawn_device;
    use crate::sink::ChannelSink;
    use crate::types::Event;

    fn client(server: &MockServer, key: &str) -> SensiboClient {
        SensiboClient::builder(key)
            .base_url(server.uri())
            .build()
            .unwrap()
    }

    fn spawn(
        client: &SensiboClient,
        id: &str,
        kind: DeviceKind,
        interval: u64,
        sink: &ChannelSink,
        store: &Arc<MemoryStore>,
    ) -> DeviceHandle {
        let config = DeviceConfig::new(id, kind)
            .mode(PollMode::Fleet)
            .settings(DeviceSettings::new(
                Duration::from_secs(interval),
                Duration::from_secs(300),
            ));
        spawn_device(
            config,
            client.clone(),
            Arc::new(sink.clone()),
            store.clone(),
            SchedulerOptions::default(),
        )
    }

    #[tokio::test]
    async fn index_groups_by_credential_with_min_interval() {
        let server = MockServer::start().await;
        let (sink, _events) = ChannelSink::new();
        let store = Arc::new(MemoryStore::new());
        let a = client(&server, "key-a");
        let b = client(&server, "key-b");

        let set = DeviceSet::new();
        set.insert(spawn(&a, "a1", DeviceKind::AirConditioner, 60, &sink, &store));
        set.insert(spawn(&a, "a2", DeviceKind::AirConditioner, 20, &sink, &store));
        set.insert(spawn(&b, "b1", DeviceKind::Pure, 45, &sink, &store));

        let index = FleetIndex::build(set.devices());
        let group_a = index.group("key-a").unwrap();
        assert_eq!(group_a.members.len(), 2);
        assert_eq!(group_a.interval, Duration::from_secs(20));
        assert_eq!(index.group("key-b").unwrap().interval, Duration::from_secs(45));

        set.remove("a2");
        let index = FleetIndex::build(set.devices());
        assert_eq!(index.group("key-a").unwrap().interval, Duration::from_secs(60));
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn bulk_poll_reaches_pods_and_room_sensors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/users/me/pods"))
            .and(query_param("fields", FLEET_FIELDS))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "result": [
                    {
                        "id": "pod1",
                        "acState": {"on": true, "mode": "heat"},
                        "motionSensors": [
                            {"id": "sensor1", "measurements": {"temperature": 19.5}}
                        ]
                    },
                    {"id": "unregistered", "acState": {"on": true}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (sink, mut events) = ChannelSink::new();
        let store = Arc::new(MemoryStore::new());
        let c = client(&server, "key");
        let set = DeviceSet::new();
        set.insert(spawn(&c, "pod1", DeviceKind::AirConditioner, 30, &sink, &store));
        set.insert(spawn(&c, "sensor1", DeviceKind::RoomSensor, 30, &sink, &store));

        let index = FleetIndex::build(set.devices());
        let delivered = poll_group(index.group("key").unwrap()).await.unwrap();
        assert_eq!(delivered, 2);

        let (device, event) = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((device.as_str(), event), ("pod1", Event::TurnedOn));

        timeout(Duration::from_secs(5), async {
            while store.get("sensor1", Capability::Temperature).is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            store.get("sensor1", Capability::Temperature),
            Some(CapabilityValue::Number(19.5))
        );
    }

    #[tokio::test]
    async fn bulk_polled_pods_report_new_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/users/me/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "result": [{"id": "pod1", "acState": {"on": true, "mode": "cool"}}]
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/pods/pod1/acStates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "result": [{"id": "1", "status": "Success"}]
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/pods/pod1/acStates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "result": [
                    {"id": "2", "status": "Success", "reason": "UserRequest"},
                    {"id": "1", "status": "Success"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (sink, mut events) = ChannelSink::new();
        let store = Arc::new(MemoryStore::new());
        let c = client(&server, "key");
        let set = DeviceSet::new();
        set.insert(spawn(&c, "pod1", DeviceKind::AirConditioner, 30, &sink, &store));
        let index = FleetIndex::build(set.devices());
        let group = index.group("key").unwrap();

        assert_eq!(poll_group(group).await.unwrap(), 1);
        let (_, first) = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, Event::TurnedOn);

        assert_eq!(poll_group(group).await.unwrap(), 1);
        let (device, event) = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device, "pod1");
        match event {
            Event::AcStateChanged { id, reason, .. } => {
                assert_eq!(id, "2");
                assert_eq!(reason.as_deref(), Some("UserRequest"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn poller_stops_on_shutdown() {
        let set = DeviceSet::new();
        let poller = FleetPoller::spawn(
            Arc::new(set),
            FleetConfig {
                jitter: Duration::ZERO..=Duration::ZERO,
                idle_interval: Duration::from_millis(10),
            },
        );
        poller.shutdown();
        timeout(Duration::from_secs(5), async {
            while !poller.is_finished() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn jitter_stays_in_range() {
        let range = Duration::from_secs(2)..=Duration::from_secs(10);
        for _ in 0..100 {
            let d = jitter(&range);
            assert!(range.contains(&d));
        }
        assert_eq!(jitter(&(Duration::ZERO..=Duration::ZERO)), Duration::ZERO);
    }
}
