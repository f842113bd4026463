//! An in-memory provisioning engine driven by per-resource scripts.

use crate::engine::{CreateRequest, DeleteRequest, OutputMap, ProvisioningEngine};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Engine for tests and demos.
///
/// Scripts are keyed by namespaced name (`svc/cluster`). Unscripted
/// resources succeed with their non-secret inputs echoed back plus `id`
/// (`"{name}-id"`) and `arn` (`"arn:{kind}:{name}"`).
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    outputs: HashMap<String, OutputMap>,
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
    failing_deletes: HashSet<String>,
    calls: Mutex<Vec<CreateRequest>>,
    created: Mutex<Vec<String>>,
    deletions: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedEngine {
    /// Creates an engine where everything succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or overrides output fields for `name`.
    #[must_use]
    pub fn with_outputs(mut self, name: impl Into<String>, fields: OutputMap) -> Self {
        self.outputs.entry(name.into()).or_default().extend(fields);
        self
    }

    /// Adds one output field for `name`.
    #[must_use]
    pub fn with_output(self, name: impl Into<String>, field: impl Into<String>, value: Json) -> Self {
        let mut fields = OutputMap::new();
        fields.insert(field.into(), value);
        self.with_outputs(name, fields)
    }

    /// Makes creating `name` fail with `message`.
    #[must_use]
    pub fn failing(mut self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(name.into(), message.into());
        self
    }

    /// Delays every create call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    /// Delays create calls for `name`.
    #[must_use]
    pub fn with_delay_for(mut self, name: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(name.into(), delay);
        self
    }

    /// Makes deleting `name` fail.
    #[must_use]
    pub fn failing_delete(mut self, name: impl Into<String>) -> Self {
        self.failing_deletes.insert(name.into());
        self
    }

    /// Returns every create request, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<CreateRequest> {
        self.calls.lock().clone()
    }

    /// Returns the number of create calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the request made for `name`.
    #[must_use]
    pub fn request_for(&self, name: &str) -> Option<CreateRequest> {
        self.calls.lock().iter().find(|r| r.name == name).cloned()
    }

    /// Returns the names of successfully created resources, in completion order.
    #[must_use]
    pub fn created_names(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    /// Returns the names of deleted resources, in completion order.
    #[must_use]
    pub fn deletions(&self) -> Vec<String> {
        self.deletions.lock().clone()
    }

    /// Returns the highest number of create calls that overlapped.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn default_outputs(request: &CreateRequest) -> OutputMap {
        let mut fields: OutputMap = request
            .inputs
            .iter()
            .filter(|(field, _)| !request.secret_inputs.contains(*field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        fields.insert("id".to_string(), json!(format!("{}-id", request.name)));
        fields.insert("arn".to_string(), json!(format!("arn:{}:{}", request.kind, request.name)));
        fields
    }
}

/// Decrements the in-flight counter even if the call is abandoned.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProvisioningEngine for ScriptedEngine {
    async fn create(&self, request: &CreateRequest) -> anyhow::Result<OutputMap> {
        self.calls.lock().push(request.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(delay) = self.delays.get(&request.name).copied().or(self.default_delay) {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.failures.get(&request.name) {
            anyhow::bail!("{message}");
        }

        let mut fields = Self::default_outputs(request);
        if let Some(extra) = self.outputs.get(&request.name) {
            fields.extend(extra.clone());
        }
        self.created.lock().push(request.name.clone());
        Ok(fields)
    }

    async fn delete(&self, request: &DeleteRequest) -> anyhow::Result<()> {
        if self.failing_deletes.contains(&request.name) {
            anyhow::bail!("cannot delete {}", request.name);
        }
        self.deletions.lock().push(request.name.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceDeclaration;
    use std::collections::BTreeMap;

    fn request(name: &str) -> CreateRequest {
        let decl = ResourceDeclaration::custom("aws:ecs:Cluster", name).with_input("size", 2);
        let mut inputs = BTreeMap::new();
        inputs.insert("size".to_string(), json!(2));
        CreateRequest::new(&decl, inputs)
    }

    #[tokio::test]
    async fn test_default_outputs_echo_inputs() {
        let engine = ScriptedEngine::new().with_output("app", "status", json!("ACTIVE"));
        let fields = engine.create(&request("app")).await.unwrap();

        assert_eq!(fields["size"], json!(2));
        assert_eq!(fields["id"], json!("app-id"));
        assert_eq!(fields["arn"], json!("arn:aws:ecs:Cluster:app"));
        assert_eq!(fields["status"], json!("ACTIVE"));
        assert_eq!(engine.created_names(), vec!["app"]);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_as_call() {
        let engine = ScriptedEngine::new().failing("app", "quota exceeded");
        let err = engine.create(&request("app")).await.unwrap_err();

        assert_eq!(err.to_string(), "quota exceeded");
        assert_eq!(engine.call_count(), 1);
        assert!(engine.created_names().is_empty());
        assert_eq!(engine.peak_concurrency(), 1);
    }
}
