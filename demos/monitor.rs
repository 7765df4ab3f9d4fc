use std::env;
use std::sync::Arc;

use sensibo_sync::{
    spawn_device, ChannelSink, DeviceConfig, DeviceKind, DeviceSet, FleetConfig, FleetPoller,
    MemoryStore, PollMode, SchedulerOptions, SensiboClient,
};

#[tokio::main]
async fn main() -> sensibo_sync::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let Ok(api_key) = env::var("SENSIBO_API_KEY") else {
        eprintln!("usage: SENSIBO_API_KEY=... monitor [--fleet]");
        return Ok(());
    };
    let mode = if args.iter().any(|a| a == "--fleet") {
        PollMode::Fleet
    } else {
        PollMode::Device
    };

    let client = SensiboClient::builder(api_key).build()?;
    let (sink, mut events) = ChannelSink::new();
    let sink = Arc::new(sink);
    let store = Arc::new(MemoryStore::new());
    let devices = DeviceSet::new();

    for pod in client.list_devices().await? {
        let Some(kind) = pod.product_model.as_deref().and_then(DeviceKind::from_product_model)
        else {
            println!("Skipping {} ({:?})", pod.id, pod.product_model);
            continue;
        };
        let room = pod.room.as_ref().map_or("?", |r| r.name.as_str());
        println!("Watching {} [{room}] as {kind:?}", pod.id);
        let config = DeviceConfig::new(&pod.id, kind)
            .name(format!("{} {room}", kind.display_prefix()))
            .mode(mode);
        devices.insert(spawn_device(
            config,
            client.clone(),
            sink.clone(),
            store.clone(),
            SchedulerOptions::default(),
        ));

        for sensor in pod.motion_sensors.iter().flatten() {
            println!("Watching room sensor {} [{room}]", sensor.id);
            devices.insert(spawn_device(
                DeviceConfig::new(&sensor.id, DeviceKind::RoomSensor),
                client.clone(),
                sink.clone(),
                store.clone(),
                SchedulerOptions::default(),
            ));
        }
    }

    // room sensors always need the fleet poller
    let _poller = FleetPoller::spawn(Arc::new(devices.clone()), FleetConfig::default());

    while let Some((device, event)) = events.recv().await {
        println!("[{device}] {event:?}");
        for (capability, value) in store.snapshot(&device) {
            println!("    {capability} = {value:?}");
        }
    }
    Ok(())
}
