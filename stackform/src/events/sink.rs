//! Event sink trait and implementations.

use async_trait::async_trait;
use serde_json::Value as Json;
use tracing::{debug, info, Level};

/// Receives lifecycle events from runs.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "resource.created")
    /// * `data` - Optional event payload
    async fn emit(&self, event_type: &str, data: Option<Json>);

    /// Emits an event without blocking. Must never panic.
    fn try_emit(&self, event_type: &str, data: Option<Json>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Json>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Json>) {}
}

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at `level`. Anything but DEBUG logs at INFO.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&Json>) {
        let resource = data
            .and_then(|d| d.get("resource"))
            .and_then(Json::as_str)
            .unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(event_type, resource, event_data = ?data, "Event: {event_type}");
        } else {
            info!(event_type, resource, event_data = ?data, "Event: {event_type}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Json>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Json>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Keeps every event in memory, for tests and previews.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<Json>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Json>)> {
        self.events.read().clone()
    }

    /// Returns the event types in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
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

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Json>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns the event types recorded for `resource`, in order.
    #[must_use]
    pub fn events_for(&self, resource: &str) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|(_, data)| {
                data.as_ref()
                    .and_then(|d| d.get("resource"))
                    .and_then(Json::as_str)
                    == Some(resource)
            })
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Returns the position of the first `event_type` event for `resource`.
    #[must_use]
    pub fn position(&self, event_type: &str, resource: &str) -> Option<usize> {
        self.events.read().iter().position(|(t, data)| {
            t == event_type
                && data
                    .as_ref()
                    .and_then(|d| d.get("resource"))
                    .and_then(Json::as_str)
                    == Some(resource)
        })
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Json>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<Json>) {
        self.events.write().push((event_type.to_string(), data));
    }
}
