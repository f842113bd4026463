//! Topological scheduling of declarations.
//!
//! The [`Scheduler`] walks a validated [`DependencyGraph`](crate::graph::DependencyGraph),
//! starting every resource as soon as the resources it depends on are
//! created, and records the outcome of each node in a [`RunReport`].
//! [`Scheduler::destroy`] undoes a run in reverse order.

mod destroy;
mod executor;
mod report;
mod state;

#[cfg(test)]
mod integration_tests;

pub use destroy::{DeleteReport, DeleteState, DestroyReport};
pub use executor::Scheduler;
pub use report::{NodeReport, RunReport, RunSummary};
pub use state::{NodeState, NodeStateTable};
