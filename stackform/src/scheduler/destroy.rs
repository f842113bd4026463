//! Tears down the resources a run created.
//!
//! A resource is deleted only after every created resource that depended on
//! it is gone. Unrelated resources are deleted concurrently, bounded by the
//! same concurrency limit as creation.

use super::{NodeReport, NodeState, RunReport, Scheduler};
use crate::engine::DeleteRequest;
use crate::events::{resource_payload, with_field, RESOURCE_DELETED, RESOURCE_DELETING};
use crate::observability::resource_span;
use crate::resource::{DeclarationClass, ResourceId};
use crate::utils::{elapsed_ms, Timestamp};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn, Instrument};

/// What happened to one resource during a destroy pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteState {
    /// Removed by the engine.
    Deleted,
    /// The engine failed to delete it.
    Failed,
    /// Left in place because a dependent could not be deleted.
    Skipped,
}

/// Result of deleting one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    /// The resource id.
    pub id: ResourceId,
    /// The resource kind.
    pub kind: String,
    /// Final state.
    pub state: DeleteState,
    /// Why it was not deleted.
    pub error: Option<String>,
}

/// Outcome of a destroy pass, in the order deletions finished.
#[derive(Debug, Clone)]
pub struct DestroyReport {
    /// The run whose resources were deleted.
    pub run_id: String,
    /// When the pass started.
    pub started_at: Timestamp,
    /// Total wall time.
    pub duration_ms: u64,
    /// Every custom resource that had been created.
    pub nodes: Vec<DeleteReport>,
}

impl DestroyReport {
    /// Returns true if every resource was deleted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.state == DeleteState::Deleted)
    }

    /// Returns the ids in deletion order.
    #[must_use]
    pub fn deleted(&self) -> Vec<&ResourceId> {
        self.nodes
            .iter()
            .filter(|n| n.state == DeleteState::Deleted)
            .map(|n| &n.id)
            .collect()
    }

    /// Returns every resource left behind with the reason.
    #[must_use]
    pub fn failures(&self) -> Vec<(ResourceId, String)> {
        self.nodes
            .iter()
            .filter(|n| n.state != DeleteState::Deleted)
            .map(|n| (n.id.clone(), n.error.clone().unwrap_or_default()))
            .collect()
    }

    /// Returns the entry for `id`.
    #[must_use]
    pub fn node(&self, id: &ResourceId) -> Option<&DeleteReport> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

#[derive(Debug)]
enum DeleteOutcome {
    Deleted,
    Failed(String),
    Skipped(String),
}

type DeleteTask = BoxFuture<'static, (usize, DeleteOutcome)>;

/// Mutable state of one destroy pass.
struct Teardown<'a> {
    run_id: &'a str,
    created: Vec<&'a NodeReport>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<usize>,
    blocked_by: Vec<Option<usize>>,
    states: Vec<Option<DeleteState>>,
    ready: VecDeque<usize>,
    finished: Vec<DeleteReport>,
}

impl<'a> Teardown<'a> {
    fn new(report: &'a RunReport) -> Self {
        let created: Vec<&NodeReport> = report
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Created)
            .collect();
        let position: HashMap<&ResourceId, usize> =
            created.iter().enumerate().map(|(i, n)| (&n.id, i)).collect();

        // dependencies[i]: created nodes that node i was built on.
        let dependencies: Vec<Vec<usize>> = created
            .iter()
            .map(|n| n.dependencies.iter().filter_map(|d| position.get(d).copied()).collect())
            .collect();
        let mut dependents = vec![0_usize; created.len()];
        for deps in &dependencies {
            for &d in deps {
                dependents[d] += 1;
            }
        }
        let ready = (0..created.len()).rev().filter(|&i| dependents[i] == 0).collect();

        Self {
            run_id: &report.run_id,
            blocked_by: vec![None; created.len()],
            states: vec![None; created.len()],
            created,
            dependencies,
            dependents,
            ready,
            finished: Vec::new(),
        }
    }

    /// Lets the dependencies of `index` go once their last dependent is done.
    fn release(&mut self, index: usize) {
        let deleted = self.states[index] == Some(DeleteState::Deleted);
        for &dependency in &self.dependencies[index] {
            if !deleted {
                self.blocked_by[dependency].get_or_insert(index);
            }
            self.dependents[dependency] -= 1;
            if self.dependents[dependency] == 0 {
                self.ready.push_back(dependency);
            }
        }
    }
}

impl Scheduler {
    /// Deletes every resource `report` shows as created, dependents first.
    ///
    /// Component nodes are bookkeeping: they are ordered like resources but
    /// never reach the engine and do not appear in the result.
    pub async fn destroy(&self, report: &RunReport) -> DestroyReport {
        let started_at = Utc::now();
        let mut teardown = Teardown::new(report);
        let limit = self.config().max_concurrency;
        let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
        let mut active: FuturesUnordered<DeleteTask> = FuturesUnordered::new();

        info!(run_id = %report.run_id, resources = teardown.created.len(), "Destroying resources");

        loop {
            while let Some(index) = teardown.ready.pop_front() {
                let node = teardown.created[index];
                if let Some(dependent) = teardown.blocked_by[index] {
                    let reason = format!("dependent '{}' was not deleted", teardown.created[dependent].id);
                    self.finish_delete(&mut teardown, index, DeleteOutcome::Skipped(reason))
                        .await;
                } else if node.class.is_bookkeeping() {
                    self.finish_delete(&mut teardown, index, DeleteOutcome::Deleted)
                        .await;
                } else {
                    active.push(self.spawn_delete(teardown.run_id, index, node, semaphore.clone()));
                }
            }

            let Some((index, outcome)) = active.next().await else {
                break;
            };
            self.finish_delete(&mut teardown, index, outcome).await;
        }

        let destroy = DestroyReport {
            run_id: report.run_id.clone(),
            started_at,
            duration_ms: elapsed_ms(&started_at, &Utc::now()),
            nodes: teardown.finished,
        };
        info!(
            run_id = %destroy.run_id,
            deleted = destroy.deleted().len(),
            left = destroy.failures().len(),
            "Destroy completed"
        );
        destroy
    }

    fn spawn_delete(
        &self,
        run_id: &str,
        index: usize,
        node: &NodeReport,
        semaphore: Option<Arc<Semaphore>>,
    ) -> DeleteTask {
        let engine = Arc::clone(self.engine());
        let events = Arc::clone(self.events());
        let timeout = self.config().engine_timeout();
        let request = DeleteRequest {
            id: node.id.clone(),
            kind: node.kind.clone(),
            name: node.name.clone(),
            outputs: node.outputs.clone(),
            secret_fields: node.secret_fields.clone(),
        };
        let payload = resource_payload(run_id, &node.id, &node.kind);
        let span = resource_span(run_id, &node.id, &node.kind);

        let task = async move {
            let _permit = match semaphore {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            events.try_emit(RESOURCE_DELETING, Some(payload));

            let call = engine.delete(&request);
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        return DeleteOutcome::Failed(format!(
                            "engine call timed out after {}ms",
                            limit.as_millis()
                        ))
                    }
                },
                None => call.await,
            };
            match result {
                Ok(()) => DeleteOutcome::Deleted,
                Err(e) => DeleteOutcome::Failed(format!("{e:#}")),
            }
        };

        tokio::spawn(task.instrument(span))
            .map(move |joined| {
                let outcome = joined.unwrap_or_else(|e| DeleteOutcome::Failed(format!("task aborted: {e}")));
                (index, outcome)
            })
            .boxed()
    }

    /// Records one finished deletion and releases what it was built on.
    async fn finish_delete(&self, teardown: &mut Teardown<'_>, index: usize, outcome: DeleteOutcome) {
        let node = teardown.created[index];
        let (state, error) = match outcome {
            DeleteOutcome::Deleted => (DeleteState::Deleted, None),
            DeleteOutcome::Failed(message) => (DeleteState::Failed, Some(message)),
            DeleteOutcome::Skipped(message) => (DeleteState::Skipped, Some(message)),
        };
        teardown.states[index] = Some(state);

        if node.class == DeclarationClass::Custom {
            match (state, &error) {
                (DeleteState::Failed, Some(message)) => {
                    warn!(resource = %node.id, error = %message, "Delete failed");
                }
                (_, Some(message)) => info!(resource = %node.id, reason = %message, "Delete skipped"),
                (_, None) => info!(resource = %node.id, "Resource deleted"),
            }

            let mut payload = with_field(resource_payload(teardown.run_id, &node.id, &node.kind), "state", json!(state));
            if let Some(message) = &error {
                payload = with_field(payload, "error", Json::String(message.clone()));
            }
            self.events().emit(RESOURCE_DELETED, Some(payload)).await;

            teardown.finished.push(DeleteReport {
                id: node.id.clone(),
                kind: node.kind.clone(),
                state,
                error,
            });
        }

        teardown.release(index);
    }
}
