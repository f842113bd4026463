//! Drives a [`DependencyGraph`] to completion.
//!
//! A single coordinator owns the run state. Each custom resource whose
//! predecessors are all created runs as its own tokio task: it resolves its
//! inputs, takes a concurrency slot and calls the engine. Completions come
//! back through a `FuturesUnordered`; the coordinator settles the node's
//! outputs and only then releases its dependents.

use super::{NodeReport, NodeState, NodeStateTable, RunReport};
use crate::cancellation::CancellationToken;
use crate::config::{FailureMode, RunConfig};
use crate::engine::{CreateRequest, OutputMap, ProvisioningEngine};
use crate::errors::{OutputError, ProviderError, StackError, UpstreamDependencyFailed};
use crate::events::{
    resource_payload, with_field, EventSink, NoOpEventSink, RESOURCE_CREATED, RESOURCE_CREATING,
    RESOURCE_FAILED, RESOURCE_SKIPPED, RESOURCE_WAITING, RUN_COMPLETED, RUN_STARTED,
};
use crate::graph::DependencyGraph;
use crate::observability::{resource_span, SpanTimer};
use crate::output::Input;
use crate::resource::ResourceDeclaration;
use crate::utils::{elapsed_ms, generate_run_id, Timestamp};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value as Json};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, info, warn, Instrument};

/// Resolves declarations in dependency order through a provisioning engine.
#[derive(Clone)]
pub struct Scheduler {
    engine: Arc<dyn ProvisioningEngine>,
    config: RunConfig,
    events: Arc<dyn EventSink>,
    cancellation: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler with default configuration and no event sink.
    #[must_use]
    pub fn new(engine: Arc<dyn ProvisioningEngine>) -> Self {
        Self {
            engine,
            config: RunConfig::default(),
            events: Arc::new(NoOpEventSink),
            cancellation: CancellationToken::new(),
        }
    }

    /// Sets the run configuration.
    #[must_use]
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Uses `token` for external cancellation.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Arc<dyn ProvisioningEngine> {
        &self.engine
    }

    pub(crate) fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Runs every node of `graph` to a terminal state.
    ///
    /// Resource failures do not make this return an error; they are recorded
    /// in the report and on the failed resources' outputs.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Internal`] if the graph could not be driven to
    /// completion, which only happens for graphs that bypassed validation.
    pub async fn execute(&self, graph: &DependencyGraph) -> Result<RunReport, StackError> {
        let mut run = Run::new(self, graph);

        info!(
            run_id = %run.run_id,
            stack = graph.stack(),
            resources = graph.len() - 1,
            failure_mode = ?self.config.failure_mode,
            "Starting run"
        );
        self.events
            .emit(
                RUN_STARTED,
                Some(json!({
                    "run_id": run.run_id,
                    "stack": graph.stack(),
                    "resources": graph.len() - 1,
                })),
            )
            .await;

        loop {
            while let Some(index) = run.ready.pop_front() {
                run.dispatch(index).await;
            }

            let Some((index, joined)) = run.active.next().await else {
                break;
            };
            let completion = joined.unwrap_or_else(|e| run.panicked(index, &e));
            run.finish(index, completion).await;
        }

        let unfinished = run.states.unfinished();
        if !unfinished.is_empty() {
            let ids: Vec<String> = unfinished.iter().map(ToString::to_string).collect();
            return Err(StackError::Internal(format!(
                "Scheduler stalled with unfinished resources: {}",
                ids.join(", ")
            )));
        }

        let report = run.into_report();
        let summary = report.summary();
        info!(
            run_id = %report.run_id,
            created = summary.created,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = report.duration_ms,
            "Run completed"
        );
        self.events
            .emit(
                RUN_COMPLETED,
                Some(json!({
                    "run_id": report.run_id,
                    "success": report.is_success(),
                    "summary": summary,
                    "duration_ms": report.duration_ms,
                })),
            )
            .await;

        Ok(report)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

/// How a node ended.
#[derive(Debug)]
enum NodeOutcome {
    Created(OutputMap),
    Failed(OutputError),
    Skipped(OutputError),
}

#[derive(Debug)]
struct NodeCompletion {
    outcome: NodeOutcome,
    inputs_hash: Option<String>,
    secret_inputs: BTreeSet<String>,
}

impl NodeCompletion {
    fn without_request(outcome: NodeOutcome) -> Self {
        Self {
            outcome,
            inputs_hash: None,
            secret_inputs: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Default)]
struct NodeRecord {
    error: Option<OutputError>,
    outputs: OutputMap,
    secret_fields: BTreeSet<String>,
    inputs_hash: Option<String>,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
}

type ActiveTask = BoxFuture<'static, (usize, Result<NodeCompletion, JoinError>)>;

/// Mutable state of one execution.
struct Run<'a> {
    scheduler: &'a Scheduler,
    graph: &'a DependencyGraph,
    run_id: String,
    started_at: Timestamp,
    token: CancellationToken,
    /// The failure that cancelled the run under `FailFast`.
    first_failure: Option<usize>,
    states: Arc<NodeStateTable>,
    semaphore: Option<Arc<Semaphore>>,
    remaining: Vec<usize>,
    blocked_by: Vec<Option<usize>>,
    records: Vec<NodeRecord>,
    ready: VecDeque<usize>,
    active: FuturesUnordered<ActiveTask>,
}

impl<'a> Run<'a> {
    fn new(scheduler: &'a Scheduler, graph: &'a DependencyGraph) -> Self {
        let remaining: Vec<usize> = (0..graph.len()).map(|i| graph.predecessors(i).len()).collect();
        let ready = (0..graph.len()).filter(|&i| remaining[i] == 0).collect();
        let limit = scheduler.config.max_concurrency;

        Self {
            scheduler,
            graph,
            run_id: generate_run_id().to_string(),
            started_at: Utc::now(),
            token: scheduler.cancellation.child_token(),
            first_failure: None,
            states: Arc::new(NodeStateTable::new(graph.nodes().iter().map(|d| &d.id))),
            semaphore: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
            remaining,
            blocked_by: vec![None; graph.len()],
            records: (0..graph.len()).map(|_| NodeRecord::default()).collect(),
            ready,
            active: FuturesUnordered::new(),
        }
    }

    fn is_root(index: usize) -> bool {
        index == DependencyGraph::ROOT
    }

    /// Starts a node whose predecessors have all finished.
    async fn dispatch(&mut self, index: usize) {
        let graph = self.graph;
        let declaration = graph.node(index);

        if let Some(upstream) = self.blocked_by[index] {
            let cause = self.records[upstream]
                .error
                .clone()
                .unwrap_or_else(|| OutputError::Cancelled("upstream did not complete".to_string()));
            let error = UpstreamDependencyFailed::new(
                declaration.id.clone(),
                graph.node(upstream).id.clone(),
                cause,
            );
            self.finish(index, NodeCompletion::without_request(NodeOutcome::Skipped(error.into())))
                .await;
            return;
        }

        if self.token.is_cancelled() && !Self::is_root(index) {
            let cause = self.cancellation_cause(index);
            self.finish(index, NodeCompletion::without_request(NodeOutcome::Skipped(cause)))
                .await;
            return;
        }

        self.states.transition(&declaration.id, NodeState::Waiting);
        self.records[index].started_at = Some(Utc::now());
        if !Self::is_root(index) {
            self.emit(RESOURCE_WAITING, declaration, None).await;
        }

        if declaration.class.is_bookkeeping() {
            self.finish(index, NodeCompletion::without_request(NodeOutcome::Created(OutputMap::new())))
                .await;
            return;
        }

        let task = NodeTask {
            declaration: declaration.clone(),
            engine: Arc::clone(&self.scheduler.engine),
            events: Arc::clone(&self.scheduler.events),
            states: Arc::clone(&self.states),
            token: self.token.clone(),
            semaphore: self.semaphore.clone(),
            run_id: self.run_id.clone(),
            engine_timeout: self.scheduler.config.engine_timeout(),
            input_timeout: self.scheduler.config.input_timeout(),
        };
        let span = resource_span(&self.run_id, &declaration.id, &declaration.kind);
        let handle = tokio::spawn(task.run().instrument(span));
        self.active.push(handle.map(move |joined| (index, joined)).boxed());
    }

    /// Why an unstarted node is skipped once the run token is cancelled.
    ///
    /// Under `FailFast` the skip chains to the failure that tripped it;
    /// otherwise it carries the external cancellation reason.
    fn cancellation_cause(&self, index: usize) -> OutputError {
        match self.first_failure {
            Some(failed) => {
                let cause = self.records[failed]
                    .error
                    .clone()
                    .unwrap_or_else(|| OutputError::Cancelled(self.token.reason().unwrap_or_default()));
                UpstreamDependencyFailed::new(
                    self.graph.node(index).id.clone(),
                    self.graph.node(failed).id.clone(),
                    cause,
                )
                .into()
            }
            None => OutputError::Cancelled(self.token.reason().unwrap_or_default()),
        }
    }

    /// Records a terminal state, settles outputs and releases dependents.
    async fn finish(&mut self, index: usize, completion: NodeCompletion) {
        let graph = self.graph;
        let declaration = graph.node(index);
        let (state, result) = match completion.outcome {
            NodeOutcome::Created(outputs) => (NodeState::Created, Ok(outputs)),
            NodeOutcome::Failed(error) => (NodeState::Failed, Err(error)),
            NodeOutcome::Skipped(OutputError::Cancelled(_)) if self.first_failure.is_some() => {
                (NodeState::Skipped, Err(self.cancellation_cause(index)))
            }
            NodeOutcome::Skipped(error) => (NodeState::Skipped, Err(error)),
        };

        self.states.transition(&declaration.id, state);
        let record = &mut self.records[index];
        record.finished_at = Some(Utc::now());
        record.inputs_hash = completion.inputs_hash;
        record.secret_fields = declaration.outputs.secret_fields().clone();
        match &result {
            Ok(outputs) => {
                record.outputs.clone_from(outputs);
                record.secret_fields.extend(
                    completion
                        .secret_inputs
                        .into_iter()
                        .filter(|field| outputs.contains_key(field)),
                );
            }
            Err(error) => record.error = Some(error.clone()),
        }

        if let Err(e) = declaration.outputs.settle(result.clone()) {
            warn!(resource = %declaration.id, error = %e, "Outputs were settled outside the scheduler");
        }

        if !Self::is_root(index) {
            self.report_terminal(declaration, state, &result).await;
        }

        if state == NodeState::Failed
            && self.scheduler.config.failure_mode == FailureMode::FailFast
            && !self.token.is_cancelled()
        {
            self.first_failure = Some(index);
            self.token.cancel(format!("'{}' failed", declaration.id));
        }

        for &successor in graph.successors(index) {
            if state != NodeState::Created {
                self.blocked_by[successor].get_or_insert(index);
            }
            self.remaining[successor] -= 1;
            if self.remaining[successor] == 0 {
                self.ready.push_back(successor);
            }
        }
    }

    async fn report_terminal(
        &self,
        declaration: &ResourceDeclaration,
        state: NodeState,
        result: &Result<OutputMap, OutputError>,
    ) {
        match (state, result) {
            (NodeState::Created, Ok(outputs)) => {
                debug!(resource = %declaration.id, fields = outputs.len(), "Resource created");
                let fields: Vec<&String> = outputs.keys().collect();
                self.emit(RESOURCE_CREATED, declaration, Some(("fields", json!(fields))))
                    .await;
            }
            (NodeState::Failed, Err(error)) => {
                warn!(resource = %declaration.id, error = %error, "Resource failed");
                self.emit(RESOURCE_FAILED, declaration, Some(("error", json!(error.to_string()))))
                    .await;
            }
            (_, Err(error)) => {
                info!(resource = %declaration.id, reason = %error, "Resource skipped");
                self.emit(RESOURCE_SKIPPED, declaration, Some(("reason", json!(error.to_string()))))
                    .await;
            }
            (_, Ok(_)) => {}
        }
    }

    async fn emit(&self, event: &str, declaration: &ResourceDeclaration, extra: Option<(&str, Json)>) {
        let mut payload = resource_payload(&self.run_id, &declaration.id, &declaration.kind);
        if let Some((key, value)) = extra {
            payload = with_field(payload, key, value);
        }
        self.scheduler.events.emit(event, Some(payload)).await;
    }

    fn panicked(&self, index: usize, error: &JoinError) -> NodeCompletion {
        let declaration = self.graph.node(index);
        warn!(resource = %declaration.id, error = %error, "Resource task panicked");
        NodeCompletion::without_request(NodeOutcome::Failed(
            ProviderError::new(
                declaration.id.clone(),
                declaration.kind.clone(),
                format!("task aborted: {error}"),
            )
            .into(),
        ))
    }

    fn into_report(self) -> RunReport {
        let graph = self.graph;
        let nodes = graph
            .topological_order()
            .into_iter()
            .filter(|&i| !Self::is_root(i))
            .map(|i| {
                let declaration = graph.node(i);
                let record = &self.records[i];
                NodeReport {
                    id: declaration.id.clone(),
                    kind: declaration.kind.clone(),
                    name: declaration.qualified_name.clone(),
                    class: declaration.class,
                    state: self.states.get(&declaration.id).unwrap_or(NodeState::NotStarted),
                    error: record.error.clone(),
                    outputs: record.outputs.clone(),
                    secret_fields: record.secret_fields.clone(),
                    inputs_hash: record.inputs_hash.clone(),
                    dependencies: graph
                        .predecessors(i)
                        .iter()
                        .filter(|&&p| !Self::is_root(p))
                        .map(|&p| graph.node(p).id.clone())
                        .collect(),
                    started_at: record.started_at,
                    finished_at: record.finished_at,
                    duration_ms: record
                        .started_at
                        .zip(record.finished_at)
                        .map(|(start, end)| elapsed_ms(&start, &end)),
                }
            })
            .collect();

        RunReport {
            run_id: self.run_id,
            stack: graph.stack().to_string(),
            started_at: self.started_at,
            duration_ms: elapsed_ms(&self.started_at, &Utc::now()),
            nodes,
        }
    }
}

/// Everything a spawned node task needs.
struct NodeTask {
    declaration: ResourceDeclaration,
    engine: Arc<dyn ProvisioningEngine>,
    events: Arc<dyn EventSink>,
    states: Arc<NodeStateTable>,
    token: CancellationToken,
    semaphore: Option<Arc<Semaphore>>,
    run_id: String,
    engine_timeout: Option<Duration>,
    input_timeout: Duration,
}

impl NodeTask {
    async fn run(self) -> NodeCompletion {
        let inputs = match self.resolve_inputs().await {
            Ok(inputs) => inputs,
            Err(outcome) => return NodeCompletion::without_request(outcome),
        };

        let _permit = match &self.semaphore {
            Some(semaphore) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => return NodeCompletion::without_request(self.cancelled()),
                    permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
                }
            }
            None => None,
        };
        if self.token.is_cancelled() {
            return NodeCompletion::without_request(self.cancelled());
        }

        let request = CreateRequest::new(&self.declaration, inputs);
        self.states.transition(&self.declaration.id, NodeState::Creating);
        let payload = resource_payload(&self.run_id, &self.declaration.id, &self.declaration.kind);
        self.events.try_emit(
            RESOURCE_CREATING,
            Some(with_field(payload, "inputs_hash", request.inputs_hash.clone())),
        );
        debug!(inputs_hash = %request.inputs_hash, "Calling engine");

        let outcome = match self.call_engine(&request).await {
            Ok(outputs) => NodeOutcome::Created(outputs),
            Err(error) => NodeOutcome::Failed(error.into()),
        };
        NodeCompletion {
            outcome,
            inputs_hash: Some(request.inputs_hash),
            secret_inputs: request.secret_inputs,
        }
    }

    /// Waits for every input value.
    async fn resolve_inputs(&self) -> Result<BTreeMap<String, Json>, NodeOutcome> {
        let mut resolved = BTreeMap::new();
        for (field, value) in &self.declaration.inputs {
            let waited = tokio::select! {
                biased;
                () = self.token.cancelled() => return Err(self.cancelled()),
                waited = tokio::time::timeout(self.input_timeout, value.resolve()) => waited,
            };

            match waited {
                Ok(Ok(json)) => {
                    resolved.insert(field.clone(), json);
                }
                Ok(Err(error)) => return Err(self.input_failed(value, error)),
                Err(_) => {
                    return Err(NodeOutcome::Failed(OutputError::InputTimeout(format!(
                        "{}.{field}",
                        self.declaration.id
                    ))))
                }
            }
        }
        Ok(resolved)
    }

    /// Inputs owned by other resources skip this node; caller-owned ones fail it.
    ///
    /// The skip names the owner whose output actually failed when the error
    /// identifies one.
    fn input_failed(&self, value: &Input, error: OutputError) -> NodeOutcome {
        let owners = value.owners();
        let failing = match &error {
            OutputError::Provider(provider) => Some(&provider.resource),
            OutputError::Upstream(upstream) => Some(&upstream.resource),
            _ => None,
        }
        .filter(|id| owners.contains(*id))
        .cloned();

        match failing.or_else(|| owners.into_iter().next()) {
            Some(upstream) => NodeOutcome::Skipped(
                UpstreamDependencyFailed::new(self.declaration.id.clone(), upstream, error).into(),
            ),
            None => NodeOutcome::Failed(error),
        }
    }

    async fn call_engine(&self, request: &CreateRequest) -> Result<OutputMap, ProviderError> {
        let id = &self.declaration.id;
        let kind = &self.declaration.kind;
        let timer = SpanTimer::start("engine.create");
        let call = self.engine.create(request);

        let result = match self.engine_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return Err(ProviderError::timeout(id.clone(), kind.clone(), limit)),
            },
            None => call.await,
        };
        debug!(duration_ms = timer.finish(), ok = result.is_ok(), "Engine call returned");
        result.map_err(|e| ProviderError::new(id.clone(), kind.clone(), format!("{e:#}")))
    }

    fn cancelled(&self) -> NodeOutcome {
        NodeOutcome::Skipped(OutputError::Cancelled(self.token.reason().unwrap_or_default()))
    }
}
