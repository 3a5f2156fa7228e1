//! Lifecycle event emitters.
//!
//! The aggregator emits [`Event::FileUploaded`] after each delivery and
//! [`Event::CutoffCompleted`] at the end of each cycle. Emitting is best
//! effort: a failing emitter is logged and never fails the cycle.

use std::sync::{Mutex, PoisonError};

use achgate_core::envelope::{self, Event, FileUploaded};
use achgate_core::transform::Transformer;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A sink for lifecycle events.
#[async_trait]
pub trait EventEmitter: Send + Sync + std::fmt::Debug {
    /// Publishes one event.
    async fn emit(&self, event: Event) -> Result<()>;
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct InMemoryEmitter {
    events: Mutex<Vec<Event>>,
}

impl InMemoryEmitter {
    /// Creates an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Only the `FileUploaded` events.
    #[must_use]
    pub fn file_uploaded(&self) -> Vec<FileUploaded> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::FileUploaded(uploaded) => Some(uploaded),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventEmitter for InMemoryEmitter {
    async fn emit(&self, event: Event) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEmitter;

#[async_trait]
impl EventEmitter for LoggingEmitter {
    async fn emit(&self, event: Event) -> Result<()> {
        let body = envelope::encode(&event)?;
        tracing::info!(
            event_type = event.type_name(),
            event = %String::from_utf8_lossy(&body),
            "lifecycle event"
        );
        Ok(())
    }
}

/// Publishes concealed envelopes on a channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::Sender<Vec<u8>>,
    transformer: Transformer,
}

impl ChannelEmitter {
    /// Creates an emitter publishing to `tx`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Vec<u8>>, transformer: Transformer) -> Self {
        Self { tx, transformer }
    }
}

#[async_trait]
impl EventEmitter for ChannelEmitter {
    async fn emit(&self, event: Event) -> Result<()> {
        let payload = self.transformer.conceal(envelope::encode(&event)?)?;
        self.tx
            .send(payload)
            .await
            .map_err(|_| Error::ChannelClosed("event channel"))
    }
}
