//! Resource declarations and the outputs they expose.

use super::ResourceId;
use crate::engine::OutputMap;
use crate::errors::{AlreadyResolvedError, OutputError, ProviderError};
use crate::output::{Input, Output};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// What kind of node a declaration becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationClass {
    /// Backed by the provisioning engine.
    Custom,
    /// Groups children; no engine call.
    Component,
    /// The synthetic stack root.
    Root,
}

impl DeclarationClass {
    /// Returns true for nodes that never reach the engine.
    #[must_use]
    pub fn is_bookkeeping(self) -> bool {
        !matches!(self, Self::Custom)
    }
}

impl fmt::Display for DeclarationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom => write!(f, "custom"),
            Self::Component => write!(f, "component"),
            Self::Root => write!(f, "root"),
        }
    }
}

#[derive(Debug, Default)]
struct OutputFields {
    fields: BTreeMap<String, Output<Json>>,
    settled: Option<Result<OutputMap, OutputError>>,
}

/// The outputs of one declaration, settled once by the scheduler.
///
/// Fields are created on first request, so a declaration can hand out
/// outputs for attributes the engine has not reported yet.
#[derive(Debug)]
pub struct ResourceOutputs {
    owner: ResourceId,
    kind: String,
    secret_fields: BTreeSet<String>,
    inner: Mutex<OutputFields>,
}

impl ResourceOutputs {
    pub(crate) fn new(owner: ResourceId, kind: impl Into<String>, secret_fields: BTreeSet<String>) -> Self {
        Self {
            owner,
            kind: kind.into(),
            secret_fields,
            inner: Mutex::new(OutputFields::default()),
        }
    }

    /// Returns the output for `field`.
    pub fn output(&self, field: &str) -> Output<Json> {
        let (output, settled) = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.fields.get(field) {
                return existing.clone();
            }
            let output = Output::with_parts(
                BTreeSet::from([self.owner.clone()]),
                self.secret_fields.contains(field),
                Some(format!("{}.{field}", self.owner)),
            );
            inner.fields.insert(field.to_string(), output.clone());
            (output, inner.settled.clone())
        };

        if let Some(result) = settled {
            let _ = output.settle(self.field_settlement(&result, field));
        }
        output
    }

    /// Settles every handed-out field from the engine result.
    ///
    /// Fields requested later settle immediately from the stored result.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyResolvedError`] if the outputs were already settled.
    pub fn settle(&self, result: Result<OutputMap, OutputError>) -> Result<(), AlreadyResolvedError> {
        let pending: Vec<(String, Output<Json>)> = {
            let mut inner = self.inner.lock();
            if inner.settled.is_some() {
                return Err(AlreadyResolvedError::new(format!("outputs of '{}'", self.owner)));
            }
            inner.settled = Some(result.clone());
            inner
                .fields
                .iter()
                .map(|(name, output)| (name.clone(), output.clone()))
                .collect()
        };

        for (field, output) in pending {
            let _ = output.settle(self.field_settlement(&result, &field));
        }
        Ok(())
    }

    fn field_settlement(&self, result: &Result<OutputMap, OutputError>, field: &str) -> Result<Json, OutputError> {
        match result {
            Ok(fields) => fields.get(field).cloned().ok_or_else(|| {
                ProviderError::new(
                    self.owner.clone(),
                    self.kind.clone(),
                    format!("engine did not report output field '{field}'"),
                )
                .into()
            }),
            Err(error) => Err(error.clone()),
        }
    }

    /// Returns true once the scheduler settled these outputs.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.lock().settled.is_some()
    }

    /// Returns the names of fields marked secret.
    #[must_use]
    pub fn secret_fields(&self) -> &BTreeSet<String> {
        &self.secret_fields
    }
}

/// Desired state for one infrastructure object.
///
/// Immutable once registered, apart from its outputs.
#[derive(Debug, Clone)]
pub struct ResourceDeclaration {
    /// Unique id within the run.
    pub id: ResourceId,
    /// Opaque resource kind, e.g. `aws:ecs:Cluster`.
    pub kind: String,
    /// The logical name given by the caller.
    pub name: String,
    /// The name namespaced under every ancestor.
    pub qualified_name: String,
    /// The enclosing component, if any.
    pub parent: Option<ResourceId>,
    /// Custom or component.
    pub class: DeclarationClass,
    /// Input fields.
    pub inputs: BTreeMap<String, Input>,
    /// Ordering edges with no data flow.
    pub explicit_dependencies: BTreeSet<ResourceId>,
    /// Outputs settled by the scheduler.
    pub outputs: Arc<ResourceOutputs>,
}

impl ResourceDeclaration {
    /// Creates a custom resource declaration at the top level.
    #[must_use]
    pub fn custom(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_class(kind.into(), name.into(), DeclarationClass::Custom)
    }

    /// Creates a component declaration at the top level.
    #[must_use]
    pub fn component(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_class(kind.into(), name.into(), DeclarationClass::Component)
    }

    /// Creates the synthetic root declaration for `stack`.
    #[must_use]
    pub fn root(stack: &str) -> Self {
        Self::with_class(
            ResourceId::root_kind().to_string(),
            stack.to_string(),
            DeclarationClass::Root,
        )
    }

    fn with_class(kind: String, name: String, class: DeclarationClass) -> Self {
        let id = ResourceId::new(&kind, &name);
        let outputs = Arc::new(ResourceOutputs::new(id.clone(), kind.clone(), BTreeSet::new()));
        Self {
            id,
            kind,
            qualified_name: name.clone(),
            name,
            parent: None,
            class,
            inputs: BTreeMap::new(),
            explicit_dependencies: BTreeSet::new(),
            outputs,
        }
    }

    /// Places the declaration under `parent`, namespacing its name.
    #[must_use]
    pub fn with_parent(mut self, parent: &ResourceId, parent_qualified_name: &str) -> Self {
        self.qualified_name = format!("{parent_qualified_name}/{}", self.name);
        self.id = ResourceId::new(&self.kind, &self.qualified_name);
        self.parent = Some(parent.clone());
        self.outputs = Arc::new(ResourceOutputs::new(
            self.id.clone(),
            self.kind.clone(),
            self.outputs.secret_fields().clone(),
        ));
        self
    }

    /// Sets an input field.
    ///
    /// A secret input also marks the output field of the same name secret,
    /// since engines commonly echo inputs back as outputs.
    #[must_use]
    pub fn with_input(mut self, field: impl Into<String>, value: impl Into<Input>) -> Self {
        let field = field.into();
        let value = value.into();
        let secret = value.is_secret();
        self.inputs.insert(field.clone(), value);
        if secret {
            self = self.with_secret_outputs([field]);
        }
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: ResourceId) -> Self {
        self.explicit_dependencies.insert(id);
        self
    }

    /// Marks output fields whose values must be redacted.
    #[must_use]
    pub fn with_secret_outputs<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secret = self.outputs.secret_fields().clone();
        secret.extend(fields.into_iter().map(Into::into));
        self.outputs = Arc::new(ResourceOutputs::new(self.id.clone(), self.kind.clone(), secret));
        self
    }

    /// Names of inputs whose values are secret.
    #[must_use]
    pub fn secret_inputs(&self) -> BTreeSet<String> {
        self.inputs
            .iter()
            .filter(|(_, value)| value.is_secret())
            .map(|(field, _)| field.clone())
            .collect()
    }

    /// Resources this declaration reads outputs from, by input field.
    #[must_use]
    pub fn data_dependencies(&self) -> BTreeMap<&str, BTreeSet<ResourceId>> {
        self.inputs
            .iter()
            .map(|(field, value)| (field.as_str(), value.owners()))
            .filter(|(_, owners)| !owners.is_empty())
            .collect()
    }

    /// Every resource this declaration must wait for.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        let mut all: BTreeSet<ResourceId> = self
            .data_dependencies()
            .into_values()
            .flatten()
            .collect();
        all.extend(self.explicit_dependencies.iter().cloned());
        all.extend(self.parent.iter().cloned());
        all
    }

    /// Returns a handle for reading this declaration's outputs.
    #[must_use]
    pub fn handle(&self) -> Resource {
        Resource {
            id: self.id.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            qualified_name: self.qualified_name.clone(),
            outputs: Arc::clone(&self.outputs),
        }
    }
}

/// A registered resource, used to wire its outputs into other declarations.
#[derive(Debug, Clone)]
pub struct Resource {
    id: ResourceId,
    kind: String,
    name: String,
    qualified_name: String,
    outputs: Arc<ResourceOutputs>,
}

impl Resource {
    /// Returns the resource id.
    #[must_use]
    pub fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    /// Returns the resource kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the namespaced name.
    #[must_use]
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Returns the output for a provider field.
    #[must_use]
    pub fn output(&self, field: &str) -> Output<Json> {
        self.outputs.output(field)
    }

    /// Shorthand for `output("id")`.
    #[must_use]
    pub fn id(&self) -> Output<Json> {
        self.output("id")
    }
}

impl AsRef<ResourceId> for Resource {
    fn as_ref(&self) -> &ResourceId {
        &self.id
    }
}
