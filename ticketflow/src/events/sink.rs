//! Event sink trait and implementations.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{EventLevel, StructuredEvent};

/// Trait for event sinks that can receive structured events.
///
/// Sinks are shared by every stage of a run and by the recovery engine, so
/// they must be cheap to call and must never fail the caller.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: StructuredEvent);

    /// Emits an event without blocking.
    ///
    /// This method should never panic. Errors are logged but suppressed.
    fn try_emit(&self, event: StructuredEvent);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: StructuredEvent) {}

    fn try_emit(&self, _event: StructuredEvent) {}
}

/// An event sink that forwards events to `tracing` at their own level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl TracingEventSink {
    /// Creates a tracing sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn log_event(event: &StructuredEvent) {
        let fields = serde_json::Value::Object(event.fields.clone());
        match event.level {
            EventLevel::Debug => {
                debug!(event = %event.event, component = %event.component, fields = %fields, "{}", event.event);
            }
            EventLevel::Info => {
                info!(event = %event.event, component = %event.component, fields = %fields, "{}", event.event);
            }
            EventLevel::Warn => {
                warn!(event = %event.event, component = %event.component, fields = %fields, "{}", event.event);
            }
            EventLevel::Error => {
                error!(event = %event.event, component = %event.component, fields = %fields, "{}", event.event);
            }
        }
    }
}

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: StructuredEvent) {
        Self::log_event(&event);
    }

    fn try_emit(&self, event: StructuredEvent) {
        Self::log_event(&event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<StructuredEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StructuredEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event names, in emission order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.event.clone()).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events with the given name.
    #[must_use]
    pub fn events_named(&self, name: &str) -> Vec<StructuredEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event == name)
            .cloned()
            .collect()
    }

    /// Returns events emitted by a component.
    #[must_use]
    pub fn events_from(&self, component: &str) -> Vec<StructuredEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.component == component)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: StructuredEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: StructuredEvent) {
        self.events.write().push(event);
    }
}
