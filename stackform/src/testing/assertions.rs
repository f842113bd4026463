//! Test assertions for run reports.

use crate::resource::Resource;
use crate::scheduler::{NodeState, RunReport};

/// Asserts that every resource in the run was created.
pub fn assert_run_succeeded(report: &RunReport) {
    assert!(
        report.is_success(),
        "Expected every resource to be created, got failures: {:?}",
        report
            .failures()
            .iter()
            .map(|f| format!("{} [{}]: {}", f.resource, f.state, f.error))
            .collect::<Vec<_>>()
    );
}

/// Asserts that `resource` ended in `expected`.
pub fn assert_node_state(report: &RunReport, resource: &Resource, expected: NodeState) {
    let actual = report.state_of(resource.resource_id());
    assert_eq!(
        actual,
        Some(expected),
        "Expected '{}' to be {}, got {:?}",
        resource.resource_id(),
        expected,
        actual
    );
}

/// Asserts that `first` finished before `second` started.
pub fn assert_created_before(report: &RunReport, first: &Resource, second: &Resource) {
    let finished = report
        .node(first.resource_id())
        .and_then(|n| n.finished_at);
    let started = report
        .node(second.resource_id())
        .and_then(|n| n.started_at);
    match (finished, started) {
        (Some(finished), Some(started)) => assert!(
            finished <= started,
            "Expected '{}' to finish before '{}' started",
            first.resource_id(),
            second.resource_id()
        ),
        _ => panic!(
            "Expected both '{}' and '{}' to have run",
            first.resource_id(),
            second.resource_id()
        ),
    }
}

/// Asserts that `names` appear in `order` with each one before the next.
pub fn assert_ordered(order: &[String], names: &[&str]) {
    let positions: Vec<Option<usize>> = names
        .iter()
        .map(|name| order.iter().position(|n| n == name))
        .collect();
    assert!(
        positions.iter().all(Option::is_some),
        "Expected {names:?} in {order:?}"
    );
    assert!(
        positions.windows(2).all(|pair| pair[0] < pair[1]),
        "Expected {names:?} in this order, got {order:?}"
    );
}
