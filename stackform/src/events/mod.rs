//! Lifecycle events emitted during runs.
//!
//! Every resource event carries a JSON payload with at least `run_id`,
//! `resource` and `kind`. Secret values never appear in payloads.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::resource::ResourceId;
use crate::utils::iso_timestamp;
use serde_json::{json, Value as Json};

/// A run began.
pub const RUN_STARTED: &str = "run.started";
/// A run reached a terminal state.
pub const RUN_COMPLETED: &str = "run.completed";
/// A resource is waiting on its dependencies.
pub const RESOURCE_WAITING: &str = "resource.waiting";
/// A resource was handed to the engine.
pub const RESOURCE_CREATING: &str = "resource.creating";
/// A resource was created.
pub const RESOURCE_CREATED: &str = "resource.created";
/// The engine failed to create a resource.
pub const RESOURCE_FAILED: &str = "resource.failed";
/// A resource was skipped because a dependency did not complete.
pub const RESOURCE_SKIPPED: &str = "resource.skipped";
/// A resource is being deleted.
pub const RESOURCE_DELETING: &str = "resource.deleting";
/// A resource was deleted.
pub const RESOURCE_DELETED: &str = "resource.deleted";

/// Builds the payload for a resource event.
#[must_use]
pub fn resource_payload(run_id: &str, resource: &ResourceId, kind: &str) -> Json {
    json!({
        "run_id": run_id,
        "resource": resource.as_str(),
        "kind": kind,
        "timestamp": iso_timestamp(),
    })
}

/// Adds `key` to an object payload.
#[must_use]
pub fn with_field(mut payload: Json, key: &str, value: impl Into<Json>) -> Json {
    if let Json::Object(map) = &mut payload {
        map.insert(key.to_string(), value.into());
    }
    payload
}
