//! Per-device poll loop.
//!
//! Every registered device runs as one task that owns its [`Device`] and
//! serializes everything that touches it: polls, fleet deliveries, user
//! commands and the local countdown. The next poll is only armed once the
//! current one has been fully processed, so polls never overlap.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityStore, DeviceKind};
use crate::client::SensiboClient;
use crate::config::{DeviceConfig, DeviceSettings, PollMode, SchedulerOptions};
use crate::device::{Command, Device};
use crate::model::{Choice, ChoiceKind};
use crate::reconcile::TimerAction;
use crate::sink::EventSink;
use crate::types::DeviceSnapshot;
use crate::{Error, Result};

const MAILBOX_CAPACITY: usize = 32;

/// Where a device is in its poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// Waiting for the next poll or delivery.
    Idle,
    Polling,
    /// The last poll failed; the next one runs at the normal interval.
    Backoff,
    Stopped,
}

enum Message {
    Snapshot(Box<DeviceSnapshot>),
    Settings(DeviceSettings),
    Command(Command, oneshot::Sender<Result<()>>),
    IsTimerEnabled(oneshot::Sender<Result<bool>>),
    IsLightOn(oneshot::Sender<Result<bool>>),
    Choices(ChoiceKind, String, oneshot::Sender<Vec<Choice>>),
}

/// Cloneable handle to a running device task.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    device_id: String,
    client: SensiboClient,
    kind: DeviceKind,
    mode: PollMode,
    tx: mpsc::Sender<Message>,
    phase: watch::Receiver<PollPhase>,
    settings: watch::Receiver<DeviceSettings>,
    cancel: CancellationToken,
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Credential the device polls with; devices sharing it form a fleet.
    pub fn api_key(&self) -> &str {
        self.client.api_key()
    }

    pub(crate) fn client(&self) -> &SensiboClient {
        &self.client
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn settings(&self) -> DeviceSettings {
        *self.settings.borrow()
    }

    pub fn phase(&self) -> PollPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<PollPhase> {
        self.phase.clone()
    }

    pub fn is_removed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the device. Pending timers are dropped and a poll still in flight
    /// is discarded when it returns.
    pub fn remove(&self) {
        if !self.cancel.is_cancelled() {
            info!(device = %self.device_id, "removing device");
            self.cancel.cancel();
        }
    }

    pub async fn execute(&self, command: Command) -> Result<()> {
        self.request(|reply| Message::Command(command, reply))
            .await?
    }

    pub async fn is_timer_enabled(&self) -> Result<bool> {
        self.request(Message::IsTimerEnabled).await?
    }

    pub async fn is_light_on(&self) -> Result<bool> {
        self.request(Message::IsLightOn).await?
    }

    pub async fn choices(&self, kind: ChoiceKind, query: &str) -> Result<Vec<Choice>> {
        let query = query.to_string();
        self.request(|reply| Message::Choices(kind, query, reply))
            .await
    }

    /// Hand over a snapshot fetched elsewhere (fleet polling).
    pub async fn deliver(&self, snapshot: DeviceSnapshot) -> Result<()> {
        self.send(Message::Snapshot(Box::new(snapshot))).await
    }

    /// Apply new settings; the next poll is rescheduled with the new interval.
    pub async fn update_settings(&self, settings: DeviceSettings) -> Result<()> {
        self.send(Message::Settings(settings)).await
    }

    async fn send(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::DeviceRemoved);
        }
        self.tx.send(message).await.map_err(|_| Error::DeviceRemoved)
    }

    async fn request<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(message(reply)).await?;
        rx.await.map_err(|_| Error::DeviceRemoved)
    }
}

/// Start the task for one device and return its handle.
///
/// Room sensors have no endpoint of their own and always take fleet
/// deliveries.
pub fn spawn_device(
    mut config: DeviceConfig,
    client: SensiboClient,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn CapabilityStore>,
    options: SchedulerOptions,
) -> DeviceHandle {
    if config.kind == DeviceKind::RoomSensor && config.mode != PollMode::Fleet {
        debug!(device = %config.device_id, "room sensor switched to fleet polling");
        config.mode = PollMode::Fleet;
    }

    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (phase_tx, phase) = watch::channel(PollPhase::Idle);
    let (settings_tx, settings) = watch::channel(config.settings);
    let cancel = CancellationToken::new();

    let handle = DeviceHandle {
        device_id: config.device_id.clone(),
        client: client.clone(),
        kind: config.kind,
        mode: config.mode,
        tx,
        phase,
        settings,
        cancel: cancel.clone(),
    };

    let device = Device::new(config, client, sink, store, options.history_limit);
    let task = DeviceTask {
        device,
        rx,
        cancel,
        phase: phase_tx,
        settings: settings_tx,
        countdown: None,
    };
    tokio::spawn(task.run(options));
    handle
}

struct DeviceTask {
    device: Device,
    rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    phase: watch::Sender<PollPhase>,
    settings: watch::Sender<DeviceSettings>,
    countdown: Option<Pin<Box<Sleep>>>,
}

impl DeviceTask {
    async fn run(mut self, options: SchedulerOptions) {
        self.device.initialize().await;

        let polls_itself = self.device.config().mode == PollMode::Device;
        let next_poll = sleep(options.initial_delay);
        tokio::pin!(next_poll);

        while !self.cancel.is_cancelled() {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle(msg).await {
                        next_poll.as_mut().reset(Instant::now() + self.interval());
                    }
                }
                () = &mut next_poll, if polls_itself => {
                    self.poll().await;
                    next_poll.as_mut().reset(Instant::now() + self.interval());
                }
                () = wait(&mut self.countdown) => {
                    self.countdown = None;
                    self.device.timer_fired();
                }
            }
        }

        self.countdown = None;
        self.phase.send_replace(PollPhase::Stopped);
        debug!(device = %self.device.id(), "device task stopped");
    }

    fn interval(&self) -> std::time::Duration {
        self.device.settings().polling_interval()
    }

    async fn poll(&mut self) {
        self.phase.send_replace(PollPhase::Polling);
        let result = self.device.fetch().await;
        if self.cancel.is_cancelled() {
            debug!(device = %self.device.id(), "discarding poll result of removed device");
            return;
        }
        match result {
            Ok(snapshot) => {
                self.process(&snapshot);
                self.phase.send_replace(PollPhase::Idle);
            }
            Err(e) => {
                warn!(device = %self.device.id(), error = %e, "poll failed");
                self.phase.send_replace(PollPhase::Backoff);
            }
        }
    }

    fn process(&mut self, snapshot: &DeviceSnapshot) {
        let action = self.device.process(snapshot);
        self.apply(action);
    }

    fn apply(&mut self, action: TimerAction) {
        self.countdown = match action {
            TimerAction::Schedule(after) => Some(Box::pin(sleep(after))),
            TimerAction::Cancel => None,
        };
    }

    /// Returns whether the next poll should be pushed back a full interval.
    async fn handle(&mut self, msg: Message) -> bool {
        match msg {
            Message::Snapshot(mut snapshot) => {
                self.device.fill_history(&mut snapshot).await;
                if self.cancel.is_cancelled() {
                    debug!(device = %self.device.id(), "discarding snapshot of removed device");
                } else {
                    self.process(&snapshot);
                }
                false
            }
            Message::Settings(settings) => {
                debug!(
                    device = %self.device.id(),
                    interval = ?settings.polling_interval(),
                    "settings updated"
                );
                self.device.update_settings(settings);
                self.settings.send_replace(settings);
                true
            }
            Message::Command(command, reply) => {
                let deletes_timer = command == Command::DeleteTimer;
                let result = self.device.execute(command).await;
                if let Err(e) = &result {
                    warn!(device = %self.device.id(), error = %e, "command failed");
                } else if deletes_timer {
                    self.apply(TimerAction::Cancel);
                }
                let _ = reply.send(result);
                true
            }
            Message::IsTimerEnabled(reply) => {
                let _ = reply.send(self.device.is_timer_enabled().await);
                false
            }
            Message::IsLightOn(reply) => {
                let _ = reply.send(self.device.is_light_on());
                false
            }
            Message::Choices(kind, query, reply) => {
                let _ = reply.send(self.device.choices(kind, &query));
                false
            }
        }
    }
}

async fn wait(countdown: &mut Option<Pin<Box<Sleep>>>) {
    match countdown {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
