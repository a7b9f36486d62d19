//! Observability collaborator. Every error is recorded here before it is
//! returned to the host.

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{ErrorPayload, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    Trace(String),
    Warn(String),
    Error(ErrorPayload),
}

impl StorageEvent {
    pub fn trace(message: impl Into<String>) -> Self {
        StorageEvent::Trace(message.into())
    }

    pub fn warn(message: impl Into<String>) -> Self {
        StorageEvent::Warn(message.into())
    }

    pub fn error(err: &StorageError) -> Self {
        StorageEvent::Error(err.payload())
    }
}

pub trait Observer: Send + Sync {
    fn record(&self, event: StorageEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record(&self, event: StorageEvent) {
        match event {
            StorageEvent::Trace(message) => debug!("{message}"),
            StorageEvent::Warn(message) => warn!("{message}"),
            StorageEvent::Error(payload) => error!(
                code = %payload.code,
                details = payload.details.as_deref().unwrap_or(""),
                "{}",
                payload.message
            ),
        }
    }
}

/// Logs like [`TracingObserver`] and mirrors every event to the host over a channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StorageEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StorageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn record(&self, event: StorageEvent) {
        TracingObserver.record(event.clone());
        // A host that stopped listening is not an error for the engine.
        let _ = self.tx.send(event);
    }
}
