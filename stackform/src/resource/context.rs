//! The build session that records declarations.

use super::{Resource, ResourceDeclaration, ResourceId};
use crate::component::ComponentBuilder;
use crate::errors::{DuplicateResourceError, StackError};
use crate::output::Input;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Append-only record of declarations for one run.
#[derive(Debug, Default)]
struct DeclarationLog {
    declarations: Vec<ResourceDeclaration>,
    parents: HashMap<ResourceId, Option<ResourceId>>,
}

impl DeclarationLog {
    fn record(&mut self, declaration: ResourceDeclaration) -> Result<(), DuplicateResourceError> {
        if self.parents.contains_key(&declaration.id) {
            return Err(DuplicateResourceError::new(declaration.id));
        }
        self.parents
            .insert(declaration.id.clone(), declaration.parent.clone());
        self.declarations.push(declaration);
        Ok(())
    }

    fn is_within(&self, id: &ResourceId, ancestor: &ResourceId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.parents.get(node).and_then(Option::as_ref);
        }
        false
    }
}

/// Records declarations for one stack run.
///
/// A context is either the top level of a stack or the inside of a
/// component. Child contexts share the parent's log, so every declaration
/// ends up in the same graph.
#[derive(Debug, Clone)]
pub struct BuildContext {
    stack: String,
    log: Arc<Mutex<DeclarationLog>>,
    scope: Option<(ResourceId, String)>,
}

impl BuildContext {
    /// Creates a fresh session for `stack`.
    #[must_use]
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            log: Arc::new(Mutex::new(DeclarationLog::default())),
            scope: None,
        }
    }

    /// Returns the stack name.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Returns the component this context declares into, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&ResourceId> {
        self.scope.as_ref().map(|(id, _)| id)
    }

    /// Starts declaring a custom resource.
    #[must_use]
    pub fn resource(&self, kind: impl Into<String>, name: impl Into<String>) -> DeclarationBuilder<'_> {
        DeclarationBuilder::new(self, ResourceDeclaration::custom(kind, name))
    }

    /// Starts declaring a component.
    #[must_use]
    pub fn component(&self, kind: impl Into<String>, name: impl Into<String>) -> ComponentBuilder<'_> {
        ComponentBuilder::new(self, DeclarationBuilder::new(self, ResourceDeclaration::component(kind, name)))
    }

    /// Returns a context whose declarations are parented to `parent`.
    #[must_use]
    pub fn child_scope(&self, parent: &Resource) -> Self {
        Self {
            stack: self.stack.clone(),
            log: Arc::clone(&self.log),
            scope: Some((parent.resource_id().clone(), parent.qualified_name().to_string())),
        }
    }

    /// Returns a copy of every declaration recorded so far, in order.
    #[must_use]
    pub fn declarations(&self) -> Vec<ResourceDeclaration> {
        self.log.lock().declarations.clone()
    }

    /// Returns the number of recorded declarations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.lock().declarations.len()
    }

    /// Returns true if nothing was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `id` is `ancestor` or declared somewhere beneath it.
    #[must_use]
    pub fn is_within(&self, id: &ResourceId, ancestor: &ResourceId) -> bool {
        self.log.lock().is_within(id, ancestor)
    }

    fn record(&self, declaration: ResourceDeclaration) -> Result<Resource, StackError> {
        let handle = declaration.handle();
        debug!(
            resource = %declaration.id,
            class = %declaration.class,
            inputs = declaration.inputs.len(),
            "Declared resource"
        );
        self.log.lock().record(declaration)?;
        Ok(handle)
    }
}

/// Builder for a single declaration.
#[derive(Debug)]
pub struct DeclarationBuilder<'a> {
    context: &'a BuildContext,
    declaration: ResourceDeclaration,
    secret_outputs: BTreeSet<String>,
}

impl<'a> DeclarationBuilder<'a> {
    fn new(context: &'a BuildContext, declaration: ResourceDeclaration) -> Self {
        Self {
            context,
            declaration,
            secret_outputs: BTreeSet::new(),
        }
    }

    /// Sets an input field.
    #[must_use]
    pub fn input(mut self, field: impl Into<String>, value: impl Into<Input>) -> Self {
        self.declaration.inputs.insert(field.into(), value.into());
        self
    }

    /// Sets several input fields.
    #[must_use]
    pub fn inputs<K: Into<String>>(mut self, fields: impl IntoIterator<Item = (K, Input)>) -> Self {
        self.declaration
            .inputs
            .extend(fields.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Waits for `other` even though no input reads from it.
    ///
    /// Waiting on a component waits on everything declared inside it.
    #[must_use]
    pub fn depends_on(self, other: &impl AsRef<ResourceId>) -> Self {
        self.depends_on_id(other.as_ref().clone())
    }

    /// Waits for the resource with the given id.
    #[must_use]
    pub fn depends_on_id(mut self, id: ResourceId) -> Self {
        self.declaration.explicit_dependencies.insert(id);
        self
    }

    /// Marks output fields as secret.
    #[must_use]
    pub fn secret_outputs<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secret_outputs.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Records the declaration and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::DuplicateResource`] if a declaration with the
    /// same kind and namespaced name already exists.
    pub fn register(self) -> Result<Resource, StackError> {
        let mut declaration = self.declaration;
        if let Some((parent, qualified)) = &self.context.scope {
            declaration = declaration.with_parent(parent, qualified);
        }
        let mut secret = self.secret_outputs;
        secret.extend(declaration.secret_inputs());
        if !secret.is_empty() {
            declaration = declaration.with_secret_outputs(secret);
        }
        self.context.record(declaration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Value;

    #[test]
    fn test_register_records_in_order() {
        let ctx = BuildContext::new("dev");
        let vpc = ctx.resource("aws:ec2:Vpc", "default").register().unwrap();
        ctx.resource("aws:ec2:SecurityGroup", "web-sg")
            .input("vpcId", vpc.id())
            .register()
            .unwrap();

        let names: Vec<String> = ctx.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["default", "web-sg"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let ctx = BuildContext::new("dev");
        ctx.resource("aws:ecs:Cluster", "app").register().unwrap();
        let err = ctx.resource("aws:ecs:Cluster", "app").register().unwrap_err();
        assert!(matches!(err, StackError::DuplicateResource(_)));

        // Same name, different kind, is a different resource.
        assert!(ctx.resource("aws:ecs:Service", "app").register().is_ok());
    }

    #[test]
    fn test_child_scope_parents_declarations() {
        let ctx = BuildContext::new("dev");
        let svc = ctx.resource("stackform:Group", "svc").register().unwrap();
        let inner = ctx.child_scope(&svc);
        let cluster = inner.resource("aws:ecs:Cluster", "app").register().unwrap();

        assert_eq!(cluster.qualified_name(), "svc/app");
        assert!(ctx.is_within(cluster.resource_id(), svc.resource_id()));
        assert!(!ctx.is_within(svc.resource_id(), cluster.resource_id()));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_explicit_dependency_recorded() {
        let ctx = BuildContext::new("dev");
        let listener = ctx.resource("aws:lb:Listener", "web").register().unwrap();
        ctx.resource("aws:ecs:Service", "app")
            .depends_on(&listener)
            .input("name", Value::Literal("app".into()))
            .register()
            .unwrap();

        let decls = ctx.declarations();
        assert!(decls[1].explicit_dependencies.contains(listener.resource_id()));
    }

    #[test]
    fn test_secret_input_registers_secret_output() {
        let ctx = BuildContext::new("dev");
        let db = ctx
            .resource("aws:rds:Instance", "db")
            .input("password", crate::output::Output::<serde_json::Value>::secret("pw".into()))
            .secret_outputs(["masterUserSecret"])
            .register()
            .unwrap();

        assert!(db.output("password").is_secret());
        assert!(db.output("masterUserSecret").is_secret());
        assert!(!db.output("endpoint").is_secret());
    }
}
