use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::types::Event;

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Destination of the events the reconciler and commands produce.
///
/// Delivery is fire-and-forget: a failing sink is logged and never aborts
/// the poll cycle that produced the event.
pub trait EventSink: Send + Sync {
    fn emit(&self, device_id: &str, event: &Event) -> Result<(), SinkError>;
}

impl<F> EventSink for F
where
    F: Fn(&str, &Event) + Send + Sync,
{
    fn emit(&self, device_id: &str, event: &Event) -> Result<(), SinkError> {
        self(device_id, event);
        Ok(())
    }
}

/// Hands events to an async consumer over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(String, Event)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Event)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, device_id: &str, event: &Event) -> Result<(), SinkError> {
        self.tx
            .send((device_id.to_string(), event.clone()))
            .map_err(|_| "event receiver dropped".into())
    }
}

pub(crate) fn dispatch(sink: &dyn EventSink, device_id: &str, event: &Event) {
    match sink.emit(device_id, event) {
        Ok(()) => trace!(device = %device_id, event = event.name(), "event emitted"),
        Err(e) => warn!(device = %device_id, event = event.name(), error = %e, "event delivery failed"),
    }
}
