//! Structured events for observability.
//!
//! Every stage, breaker transition, recovery and workflow milestone is
//! reported as a [`StructuredEvent`] delivered to an [`EventSink`].

mod event;
mod sink;

pub use event::{EventLevel, StructuredEvent};
pub use sink::{CollectingEventSink, EventSink, NoOpEventSink, TracingEventSink};
