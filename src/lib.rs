mod capability;
mod client;
mod config;
mod device;
mod error;
mod fleet;
mod logger;
mod model;
mod protocol;
mod reconcile;
mod scheduler;
mod sink;
mod types;

pub use capability::{
    discovered_capabilities, Capability, CapabilityStore, CapabilityValue, DeviceKind,
    DeviceTraits, MemoryStore,
};
pub use client::{SensiboClient, SensiboClientBuilder};
pub use config::{
    DeviceConfig, DeviceSettings, FleetConfig, PollMode, SchedulerOptions,
    DEFAULT_OFFLINE_DELAY, DEFAULT_POLLING_INTERVAL, MIN_POLLING_INTERVAL,
};
pub use device::{Command, TimerRequest};
pub use error::{Error, RemoteError, RemoteErrorKind, Result};
pub use fleet::{poll_group, DeviceRegistry, DeviceSet, FleetGroup, FleetIndex, FleetPoller};
pub use logger::MessageLogMode;
pub use model::{CapabilityModel, Choice, ChoiceKind};
pub use protocol::{DEFAULT_BASE_URL, MAX_TIMER_MINUTES};
pub use reconcile::{
    reconcile, CapabilityUpdate, PollState, ReconcileContext, Reconciliation, TimerAction,
};
pub use scheduler::{spawn_device, DeviceHandle, PollPhase};
pub use sink::{ChannelSink, EventSink, SinkError};
pub use types::*;
