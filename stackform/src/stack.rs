//! The caller-facing entry point.
//!
//! A [`Stack`] builds a fresh [`BuildContext`] per call, turns the
//! declarations into a validated graph and hands it to the [`Scheduler`].

use crate::cancellation::CancellationToken;
use crate::component::Exports;
use crate::config::RunConfig;
use crate::engine::{OutputMap, ProvisioningEngine};
use crate::errors::{DestroyError, ReferenceKind, RunError, StackError, UnknownResourceError};
use crate::events::EventSink;
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::output::Value;
use crate::resource::{BuildContext, ResourceId};
use crate::scheduler::{DestroyReport, RunReport, Scheduler};
use std::sync::Arc;
use tracing::{info, warn};

/// A successful run: resolved exports and the full report.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Stack exports resolved to JSON.
    pub outputs: OutputMap,
    /// What happened to every resource.
    pub report: RunReport,
}

/// A named topology bound to a provisioning engine.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    scheduler: Scheduler,
}

impl Stack {
    /// Creates a stack with default configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, engine: Arc<dyn ProvisioningEngine>) -> Self {
        Self {
            name: name.into(),
            scheduler: Scheduler::new(engine),
        }
    }

    /// Sets the run configuration.
    #[must_use]
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.scheduler = self.scheduler.with_config(config);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.scheduler = self.scheduler.with_event_sink(events);
        self
    }

    /// Uses `token` to cancel runs from outside.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.scheduler = self.scheduler.with_cancellation(token);
        self
    }

    /// Returns the stack name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        self.scheduler.config()
    }

    /// Returns a fresh build session for this stack.
    #[must_use]
    pub fn context(&self) -> BuildContext {
        BuildContext::new(&self.name)
    }

    /// Builds and validates the topology without contacting the engine.
    ///
    /// # Errors
    ///
    /// Returns whatever `build` returns, or a graph validation error.
    pub fn preview<F>(&self, build: F) -> Result<DependencyGraph, StackError>
    where
        F: FnOnce(&BuildContext) -> Result<Exports, StackError>,
    {
        self.plan(build).map(|(graph, _)| graph)
    }

    /// Builds, validates and provisions the topology.
    ///
    /// # Errors
    ///
    /// - Build and validation errors, before anything is created.
    /// - [`StackError::Run`] listing every failed or skipped resource.
    /// - [`StackError::Export`] or [`StackError::UnresolvedExport`] if an
    ///   export did not resolve although every resource was created.
    pub async fn run<F>(&self, build: F) -> Result<RunOutcome, StackError>
    where
        F: FnOnce(&BuildContext) -> Result<Exports, StackError>,
    {
        self.config().validate()?;
        let (graph, exports) = self.plan(build)?;
        info!(
            stack = %self.name,
            resources = graph.len() - 1,
            exports = exports.len(),
            "Provisioning stack"
        );

        let report = self.scheduler.execute(&graph).await?;
        if !report.is_success() {
            let error = RunError::from_report(report);
            warn!(stack = %self.name, failures = error.failures.len(), "Stack run failed");
            return Err(error.into());
        }

        let mut outputs = OutputMap::new();
        for (name, value) in exports.iter() {
            let resolved = match value {
                Value::Literal(json) => json.clone(),
                Value::Derived(output) => match output.try_get() {
                    Some(Ok(json)) => json,
                    Some(Err(cause)) => {
                        return Err(StackError::Export {
                            name: name.to_string(),
                            cause,
                        })
                    }
                    None => {
                        return Err(StackError::UnresolvedExport {
                            name: name.to_string(),
                        })
                    }
                },
            };
            outputs.insert(name.to_string(), resolved);
        }

        Ok(RunOutcome { outputs, report })
    }

    /// Deletes every resource a run created, dependents first.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Destroy`] listing every resource left behind.
    pub async fn destroy(&self, report: &RunReport) -> Result<DestroyReport, StackError> {
        let destroy = self.scheduler.destroy(report).await;
        if destroy.is_success() {
            Ok(destroy)
        } else {
            Err(DestroyError {
                failures: destroy.failures(),
            }
            .into())
        }
    }

    fn plan<F>(&self, build: F) -> Result<(DependencyGraph, Exports), StackError>
    where
        F: FnOnce(&BuildContext) -> Result<Exports, StackError>,
    {
        let context = self.context();
        let exports = build(&context)?;
        let graph = GraphBuilder::new(&self.name)
            .extend(context.declarations())
            .build()?;

        for (_, value) in exports.iter() {
            if let Some(owner) = value.owners().into_iter().find(|owner| !graph.contains(owner)) {
                return Err(UnknownResourceError::new(
                    ResourceId::root(&self.name),
                    owner,
                    ReferenceKind::Input,
                )
                .into());
            }
        }
        Ok((graph, exports))
    }
}
