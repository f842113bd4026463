//! Error types for stackform.
//!
//! Graph-shape errors (`GraphCycleError`, `UnknownResourceError`,
//! `DuplicateResourceError`) are raised before any resource is created.
//! Per-resource failures travel on the resource's outputs as
//! [`OutputError`] and are aggregated into a [`RunError`] at the end of a run.

use crate::resource::ResourceId;
use crate::scheduler::{NodeState, RunReport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for stackform operations.
#[derive(Debug, Error)]
pub enum StackError {
    /// The declaration graph contains a cycle.
    #[error("{0}")]
    Cycle(#[from] GraphCycleError),

    /// A declaration references a resource that is not part of the run.
    #[error("{0}")]
    UnknownResource(#[from] UnknownResourceError),

    /// Two declarations share an id.
    #[error("{0}")]
    DuplicateResource(#[from] DuplicateResourceError),

    /// An output was settled twice.
    #[error("{0}")]
    AlreadyResolved(#[from] AlreadyResolvedError),

    /// An interpolation template did not match its arguments.
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// Configuration could not be loaded or validated.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// One or more resources failed or were skipped.
    #[error("{0}")]
    Run(#[from] RunError),

    /// One or more resources could not be deleted.
    #[error("{0}")]
    Destroy(#[from] DestroyError),

    /// A component exported an output it does not own.
    #[error("Component '{component}' cannot export '{export}': it depends on '{owner}', which is outside the component")]
    ForeignExport {
        /// The exporting component.
        component: ResourceId,
        /// The export name.
        export: String,
        /// The owner outside the component subtree.
        owner: ResourceId,
    },

    /// A stack export failed to resolve although every resource was created.
    #[error("Export '{name}' failed: {cause}")]
    Export {
        /// The export name.
        name: String,
        /// Why it failed.
        cause: OutputError,
    },

    /// A stack export was still pending when the run finished.
    #[error("Export '{name}' was still pending when the run finished")]
    UnresolvedExport {
        /// The export name.
        name: String,
    },

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Diagnostic metadata attached to graph validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Raised when the dependency graph contains a cycle.
///
/// The path starts and ends on the same resource, e.g. `a -> b -> c -> a`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Dependency cycle detected: {}", join_ids(.cycle))]
pub struct GraphCycleError {
    /// The resources forming the cycle, first id repeated at the end.
    pub cycle: Vec<ResourceId>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl GraphCycleError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(cycle: Vec<ResourceId>) -> Self {
        let error_info = ErrorInfo::new(
            "GRAPH-001-CYCLE",
            format!("Declarations form a dependency cycle: {}", join_ids(&cycle)),
        )
        .with_fix_hint("Remove one explicit dependency or input reference in the cycle.");

        Self { cycle, error_info }
    }

    /// Returns every resource on the cycle once.
    #[must_use]
    pub fn resources(&self) -> Vec<&ResourceId> {
        let mut seen = Vec::new();
        for id in &self.cycle {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }
}

fn join_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ResourceId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// How a declaration referred to another resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// Through an input value.
    Input,
    /// Through an explicit dependency.
    Explicit,
    /// Through its parent.
    Parent,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Explicit => write!(f, "explicit dependency"),
            Self::Parent => write!(f, "parent"),
        }
    }
}

/// Raised when a declaration references a resource outside the graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Resource '{resource}' references unknown resource '{reference}' via {via}")]
pub struct UnknownResourceError {
    /// The declaring resource.
    pub resource: ResourceId,
    /// The missing resource.
    pub reference: ResourceId,
    /// How it was referenced.
    pub via: ReferenceKind,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl UnknownResourceError {
    /// Creates a new unknown resource error.
    #[must_use]
    pub fn new(resource: ResourceId, reference: ResourceId, via: ReferenceKind) -> Self {
        let error_info = ErrorInfo::new(
            "GRAPH-002-UNKNOWN",
            format!("'{reference}' is not declared in this run"),
        )
        .with_fix_hint("Declare the referenced resource in the same build context.")
        .with_context_entry("resource", resource.as_str());

        Self {
            resource,
            reference,
            via,
            error_info,
        }
    }
}

/// Raised when two declarations resolve to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Duplicate resource '{resource}'")]
pub struct DuplicateResourceError {
    /// The duplicated id.
    pub resource: ResourceId,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl DuplicateResourceError {
    /// Creates a new duplicate resource error.
    #[must_use]
    pub fn new(resource: ResourceId) -> Self {
        let error_info = ErrorInfo::new(
            "GRAPH-003-DUPLICATE",
            format!("'{resource}' is declared more than once"),
        )
        .with_fix_hint("Give each resource of the same kind a distinct name within its parent.");

        Self {
            resource,
            error_info,
        }
    }
}

/// Raised when an output that already settled is settled again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Output {output} has already been settled")]
pub struct AlreadyResolvedError {
    /// Description of the output.
    pub output: String,
}

impl AlreadyResolvedError {
    /// Creates a new already-resolved error.
    #[must_use]
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// Raised when the backing engine fails to create or delete a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Provider failed for '{resource}' ({kind}): {message}")]
pub struct ProviderError {
    /// The resource being provisioned.
    pub resource: ResourceId,
    /// The resource kind.
    pub kind: String,
    /// The engine's error message.
    pub message: String,
    /// Whether the call was abandoned after a timeout.
    pub timed_out: bool,
}

impl ProviderError {
    /// Creates a new provider error.
    #[must_use]
    pub fn new(resource: ResourceId, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource,
            kind: kind.into(),
            message: message.into(),
            timed_out: false,
        }
    }

    /// Creates a provider error for a call that exceeded its timeout.
    #[must_use]
    pub fn timeout(resource: ResourceId, kind: impl Into<String>, after: Duration) -> Self {
        Self {
            resource,
            kind: kind.into(),
            message: format!("engine call timed out after {}ms", after.as_millis()),
            timed_out: true,
        }
    }
}

/// Attached to resources skipped because something they depend on failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Resource '{resource}' skipped because '{upstream}' did not complete")]
pub struct UpstreamDependencyFailed {
    /// The skipped resource.
    pub resource: ResourceId,
    /// The dependency that failed or was skipped.
    pub upstream: ResourceId,
    /// The upstream failure.
    #[source]
    pub cause: Box<OutputError>,
}

impl UpstreamDependencyFailed {
    /// Creates a new upstream failure.
    #[must_use]
    pub fn new(resource: ResourceId, upstream: ResourceId, cause: OutputError) -> Self {
        Self {
            resource,
            upstream,
            cause: Box::new(cause),
        }
    }

    /// Follows the chain of skips down to the originating failure.
    #[must_use]
    pub fn root_cause(&self) -> &OutputError {
        self.cause.root_cause()
    }
}

/// The failure state carried by an [`Output`](crate::output::Output).
///
/// Cloneable because one failure is observed by every reader of the output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputError {
    /// The engine failed to create the owning resource.
    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// A dependency of the owning resource failed.
    #[error("{0}")]
    Upstream(#[from] UpstreamDependencyFailed),

    /// The graph was rejected before anything ran.
    #[error("{0}")]
    Cycle(#[from] GraphCycleError),

    /// The run was cancelled before the owning resource started.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// A `try_map` transform rejected its input.
    #[error("Transform failed: {0}")]
    Transform(String),

    /// A caller-owned input never settled.
    #[error("Timed out waiting for input '{0}'")]
    InputTimeout(String),
}

impl OutputError {
    /// Creates a transform error.
    #[must_use]
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform(message.into())
    }

    /// Follows upstream chains to the originating failure.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Upstream(upstream) => upstream.cause.root_cause(),
            other => other,
        }
    }

    /// Returns true if this is a skip caused by a dependency.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }
}

/// Raised when an interpolation template and its arguments disagree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Template '{template}' has {placeholders} placeholder(s) but {arguments} argument(s) were given")]
pub struct TemplateError {
    /// The template text.
    pub template: String,
    /// Number of `%s` placeholders.
    pub placeholders: usize,
    /// Number of values supplied.
    pub arguments: usize,
}

/// Errors loading or validating a [`RunConfig`](crate::config::RunConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        /// The file path.
        path: String,
        /// The IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config document is not valid JSON for the schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value was out of range or malformed.
    #[error("Invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        /// The setting name.
        key: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid(key: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// One resource that did not reach `Created`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    /// The resource id.
    pub resource: ResourceId,
    /// Its terminal state (`Failed` or `Skipped`).
    pub state: NodeState,
    /// Why.
    pub error: OutputError,
}

/// Aggregate error for a run in which some resources did not get created.
///
/// Lists every failed and skipped resource, not just the first.
#[derive(Debug, Clone)]
pub struct RunError {
    /// Every resource that failed or was skipped, in graph order.
    pub failures: Vec<NodeFailure>,
    /// The full run report.
    pub report: Box<RunReport>,
}

impl RunError {
    /// Builds the aggregate error from a finished run.
    #[must_use]
    pub fn from_report(report: RunReport) -> Self {
        Self {
            failures: report.failures(),
            report: Box::new(report),
        }
    }

    /// Returns the failures whose state is `Failed`.
    #[must_use]
    pub fn failed(&self) -> Vec<&NodeFailure> {
        self.failures
            .iter()
            .filter(|f| f.state == NodeState::Failed)
            .collect()
    }

    /// Returns the failures whose state is `Skipped`.
    #[must_use]
    pub fn skipped(&self) -> Vec<&NodeFailure> {
        self.failures
            .iter()
            .filter(|f| f.state == NodeState::Skipped)
            .collect()
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} resources did not complete",
            self.failures.len(),
            self.report.nodes.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  - {} [{}]: {}", failure.resource, failure.state, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for RunError {}

/// Aggregate error for a destroy pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} resource(s) could not be deleted: {}", .failures.len(), describe_failures(.failures))]
pub struct DestroyError {
    /// Each resource left behind and why.
    pub failures: Vec<(ResourceId, String)>,
}

fn describe_failures(failures: &[(ResourceId, String)]) -> String {
    failures
        .iter()
        .map(|(id, message)| format!("{id}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ResourceId {
        ResourceId::from(name)
    }

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("resource", "web-lb");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("resource"), Some(&"web-lb".to_string()));
    }

    #[test]
    fn test_cycle_error_names_every_resource() {
        let err = GraphCycleError::new(vec![id("a"), id("b"), id("c"), id("a")]);

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.error_info.code, "GRAPH-001-CYCLE");
        assert_eq!(err.resources(), vec![&id("a"), &id("b"), &id("c")]);
    }

    #[test]
    fn test_upstream_root_cause() {
        let provider = OutputError::from(ProviderError::new(id("db"), "aws:rds:Instance", "quota"));
        let first = OutputError::from(UpstreamDependencyFailed::new(id("task"), id("db"), provider.clone()));
        let second = UpstreamDependencyFailed::new(id("svc"), id("task"), first.clone());

        assert_eq!(second.root_cause(), &provider);
        assert!(first.is_upstream());
        assert!(!provider.is_upstream());
    }

    #[test]
    fn test_provider_timeout_message() {
        let err = ProviderError::timeout(id("lb"), "aws:lb:LoadBalancer", Duration::from_millis(250));
        assert!(err.timed_out);
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_template_error_message() {
        let err = TemplateError {
            template: "arn:%s".to_string(),
            placeholders: 1,
            arguments: 2,
        };
        assert!(err.to_string().contains("1 placeholder(s) but 2 argument(s)"));
    }

    #[test]
    fn test_stack_error_from_cycle() {
        let err: StackError = GraphCycleError::new(vec![id("a"), id("a")]).into();
        assert!(matches!(err, StackError::Cycle(_)));
    }

    #[test]
    fn test_destroy_error_lists_failures() {
        let err = DestroyError {
            failures: vec![(id("a"), "in use".to_string())],
        };
        assert!(err.to_string().contains("a: in use"));
    }
}
