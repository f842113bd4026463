//! Components: named groups of resources that expose a curated set of outputs.
//!
//! A component is a bookkeeping node. Its children are declared in a nested
//! [`BuildContext`] and namespaced under it; only the outputs returned from
//! the build closure are visible through [`Component::output`].

use crate::errors::StackError;
use crate::output::{Input, Output, Value};
use crate::resource::{BuildContext, DeclarationBuilder, Resource, ResourceId};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use tracing::debug;

/// Named outputs published by a component or a stack.
#[derive(Debug, Clone, Default)]
pub struct Exports {
    entries: BTreeMap<String, Input>,
}

impl Exports {
    /// Creates an empty export set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an export.
    #[must_use]
    pub fn export(mut self, name: impl Into<String>, value: impl Into<Input>) -> Self {
        self.entries.insert(name.into(), value.into());
        self
    }

    /// Returns the export named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Input> {
        self.entries.get(name)
    }

    /// Iterates exports in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Input)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns the number of exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is exported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebinds every derived export to `component`.
    ///
    /// Fails if an export reads from a resource outside the component.
    fn republish(self, component: &ResourceId, context: &BuildContext) -> Result<Self, StackError> {
        let mut entries = BTreeMap::new();
        for (name, value) in self.entries {
            if let Some(owner) = value
                .owners()
                .into_iter()
                .find(|owner| !context.is_within(owner, component))
            {
                return Err(StackError::ForeignExport {
                    component: component.clone(),
                    export: name,
                    owner,
                });
            }

            let value = match value {
                Value::Derived(output) => Value::Derived(output.republish(component.clone())),
                literal @ Value::Literal(_) => literal,
            };
            entries.insert(name, value);
        }
        Ok(Self { entries })
    }
}

/// Builder returned by [`BuildContext::component`].
#[derive(Debug)]
pub struct ComponentBuilder<'a> {
    context: &'a BuildContext,
    declaration: DeclarationBuilder<'a>,
}

impl<'a> ComponentBuilder<'a> {
    pub(crate) fn new(context: &'a BuildContext, declaration: DeclarationBuilder<'a>) -> Self {
        Self { context, declaration }
    }

    /// Sets an input on the component node itself.
    #[must_use]
    pub fn input(mut self, field: impl Into<String>, value: impl Into<Input>) -> Self {
        self.declaration = self.declaration.input(field, value);
        self
    }

    /// Orders the whole component after `other`.
    #[must_use]
    pub fn depends_on(mut self, other: &impl AsRef<ResourceId>) -> Self {
        self.declaration = self.declaration.depends_on(other);
        self
    }

    /// Registers the component and declares its children.
    ///
    /// `build` receives a context whose declarations are parented to the
    /// component and returns the outputs to republish.
    ///
    /// # Errors
    ///
    /// Propagates errors from `build` and from registration, and returns
    /// [`StackError::ForeignExport`] if an export depends on a resource
    /// declared outside the component.
    pub fn build<F>(self, build: F) -> Result<Component, StackError>
    where
        F: FnOnce(&BuildContext) -> Result<Exports, StackError>,
    {
        let resource = self.declaration.register()?;
        let scope = self.context.child_scope(&resource);
        let exports = build(&scope)?.republish(resource.resource_id(), self.context)?;

        debug!(
            component = %resource.resource_id(),
            exports = exports.len(),
            "Built component"
        );
        Ok(Component { resource, exports })
    }
}

/// A registered component and its republished outputs.
#[derive(Debug, Clone)]
pub struct Component {
    resource: Resource,
    exports: Exports,
}

impl Component {
    /// Returns the component's own resource handle.
    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Returns the exported output named `name`.
    ///
    /// Literal exports come back as already resolved outputs.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<Output<Json>> {
        self.exports.get(name).cloned().map(Value::into_output)
    }

    /// Returns every export.
    #[must_use]
    pub fn exports(&self) -> &Exports {
        &self.exports
    }
}

impl AsRef<ResourceId> for Component {
    fn as_ref(&self) -> &ResourceId {
        self.resource.resource_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_children_are_namespaced() {
        let ctx = BuildContext::new("dev");
        let component = ctx
            .component("stackform:Service", "svc")
            .build(|scope| {
                scope.resource("aws:ecs:Cluster", "app-cluster").register()?;
                Ok(Exports::new())
            })
            .unwrap();

        let decls = ctx.declarations();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[1].qualified_name, "svc/app-cluster");
        assert_eq!(decls[1].parent.as_ref(), Some(component.resource().resource_id()));
    }

    #[test]
    fn test_only_exported_outputs_are_visible() {
        let ctx = BuildContext::new("dev");
        let component = ctx
            .component("stackform:Service", "svc")
            .build(|scope| {
                let lb = scope.resource("aws:lb:LoadBalancer", "web-lb").register()?;
                Ok(Exports::new().export("url", lb.output("dnsName")).export("port", 80))
            })
            .unwrap();

        let url = component.output("url").unwrap();
        assert!(url.owners().contains(component.resource().resource_id()));
        assert!(url.try_get().is_none());
        assert_eq!(component.output("port").unwrap().try_get(), Some(Ok(json!(80))));
        assert!(component.output("dnsName").is_none());
    }

    #[test]
    fn test_foreign_export_rejected() {
        let ctx = BuildContext::new("dev");
        let outside = ctx.resource("aws:ec2:Vpc", "vpc").register().unwrap();

        let err = ctx
            .component("stackform:Service", "svc")
            .build(|_| Ok(Exports::new().export("vpc", outside.id())))
            .unwrap_err();

        assert!(matches!(err, StackError::ForeignExport { .. }));
    }

    #[test]
    fn test_nested_components() {
        let ctx = BuildContext::new("dev");
        let outer = ctx
            .component("stackform:Outer", "outer")
            .build(|scope| {
                let inner = scope.component("stackform:Inner", "inner").build(|inner| {
                    let bucket = inner.resource("aws:s3:Bucket", "logs").register()?;
                    Ok(Exports::new().export("bucket", bucket.id()))
                })?;
                let bucket = inner.output("bucket").map(Input::from);
                Ok(Exports::new().export("bucket", bucket.unwrap_or(Input::from(Json::Null))))
            })
            .unwrap();

        let decls = ctx.declarations();
        assert_eq!(decls[2].qualified_name, "outer/inner/logs");
        assert_eq!(outer.output("bucket").unwrap().owners().len(), 3);
    }
}
