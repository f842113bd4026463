//! The boundary to the backing provisioning engine.
//!
//! The scheduler decides when a resource is created; the engine decides how.
//! Engines receive fully resolved inputs and report the resulting output
//! fields.

use crate::resource::{ResourceDeclaration, ResourceId};
use async_trait::async_trait;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Output fields reported by the engine, by name.
pub type OutputMap = BTreeMap<String, Json>;

/// Placeholder shown instead of secret values.
pub const REDACTED: &str = "[secret]";

/// A request to create one resource.
///
/// `Debug` and `Serialize` show secret inputs as [`REDACTED`].
#[derive(Clone)]
pub struct CreateRequest {
    /// The resource id.
    pub id: ResourceId,
    /// The resource kind.
    pub kind: String,
    /// The namespaced name.
    pub name: String,
    /// The enclosing component, if any.
    pub parent: Option<ResourceId>,
    /// Fully resolved inputs.
    pub inputs: BTreeMap<String, Json>,
    /// Names of inputs whose values came from secret outputs.
    pub secret_inputs: BTreeSet<String>,
    /// SHA-256 of the resolved inputs, hex encoded.
    pub inputs_hash: String,
}

impl CreateRequest {
    /// Builds a request from a declaration and its resolved inputs.
    #[must_use]
    pub fn new(declaration: &ResourceDeclaration, inputs: BTreeMap<String, Json>) -> Self {
        Self {
            id: declaration.id.clone(),
            kind: declaration.kind.clone(),
            name: declaration.qualified_name.clone(),
            parent: declaration.parent.clone(),
            inputs_hash: hash_inputs(&inputs),
            inputs,
            secret_inputs: declaration.secret_inputs(),
        }
    }

    /// Returns the inputs with secret values replaced by a placeholder.
    #[must_use]
    pub fn redacted_inputs(&self) -> BTreeMap<String, Json> {
        redact(&self.inputs, &self.secret_inputs)
    }
}

impl fmt::Debug for CreateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("inputs", &self.redacted_inputs())
            .field("inputs_hash", &self.inputs_hash)
            .finish_non_exhaustive()
    }
}

impl Serialize for CreateRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CreateRequest", 7)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("parent", &self.parent)?;
        state.serialize_field("inputs", &self.redacted_inputs())?;
        state.serialize_field("secret_inputs", &self.secret_inputs)?;
        state.serialize_field("inputs_hash", &self.inputs_hash)?;
        state.end()
    }
}

/// A request to delete one resource created earlier.
///
/// `Debug` and `Serialize` show secret outputs as [`REDACTED`].
#[derive(Clone)]
pub struct DeleteRequest {
    /// The resource id.
    pub id: ResourceId,
    /// The resource kind.
    pub kind: String,
    /// The namespaced name.
    pub name: String,
    /// The outputs recorded when it was created.
    pub outputs: OutputMap,
    /// Output fields that must be redacted.
    pub secret_fields: BTreeSet<String>,
}

impl DeleteRequest {
    /// Returns the outputs with secret values replaced by a placeholder.
    #[must_use]
    pub fn redacted_outputs(&self) -> OutputMap {
        redact(&self.outputs, &self.secret_fields)
    }
}

impl fmt::Debug for DeleteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("outputs", &self.redacted_outputs())
            .finish_non_exhaustive()
    }
}

impl Serialize for DeleteRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DeleteRequest", 4)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("outputs", &self.redacted_outputs())?;
        state.end()
    }
}

/// Creates and deletes resources on behalf of the scheduler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Creates a resource and returns its output fields.
    async fn create(&self, request: &CreateRequest) -> anyhow::Result<OutputMap>;

    /// Deletes a resource. The default does nothing.
    async fn delete(&self, _request: &DeleteRequest) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hashes resolved inputs. Field order does not matter.
#[must_use]
pub fn hash_inputs(inputs: &BTreeMap<String, Json>) -> String {
    let json = serde_json::to_string(inputs).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}

/// Replaces the values of `secret` fields with [`REDACTED`].
#[must_use]
pub fn redact(fields: &BTreeMap<String, Json>, secret: &BTreeSet<String>) -> BTreeMap<String, Json> {
    fields
        .iter()
        .map(|(name, value)| {
            let shown = if secret.contains(name) {
                Json::String(REDACTED.to_string())
            } else {
                value.clone()
            };
            (name.clone(), shown)
        })
        .collect()
}
