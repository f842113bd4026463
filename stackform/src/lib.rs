//! # Stackform
//!
//! Declare a multi-resource cloud topology as one unit and provision it in
//! dependency order.
//!
//! Stackform provides:
//!
//! - **Outputs**: single-assignment async values with `map`, `zip` and `combine`
//! - **Declarations**: resources whose inputs may read other resources' outputs
//! - **Dependency graphs**: data, explicit and parent edges, validated before anything runs
//! - **Scheduling**: independent branches run concurrently; a failure stops new work and skips what has not started
//! - **Components**: namespaced groups of resources that republish selected outputs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackform::prelude::*;
//!
//! let stack = Stack::new("dev", Arc::new(MyEngine::new()));
//! let outcome = stack
//!     .run(|ctx| {
//!         let lb = ctx.resource("aws:lb:LoadBalancer", "web-lb").register()?;
//!         Ok(Exports::new().export("endpoint", interpolate!("http://%s", lb.output("dnsName"))?))
//!     })
//!     .await?;
//! println!("{}", outcome.outputs["endpoint"]);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod component;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod output;
pub mod resource;
pub mod scheduler;
pub mod stack;
pub mod testing;
pub mod utils;

#[cfg(feature = "topology")]
pub mod topology;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::component::{Component, Exports};
    pub use crate::config::{FailureMode, LogConfig, RunConfig};
    pub use crate::engine::{CreateRequest, DeleteRequest, OutputMap, ProvisioningEngine};
    pub use crate::errors::{
        GraphCycleError, OutputError, ProviderError, RunError, StackError,
        UpstreamDependencyFailed,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{DependencyGraph, GraphBuilder};
    pub use crate::interpolate;
    pub use crate::output::{format, Input, Output, OutputState, Value};
    pub use crate::resource::{BuildContext, Resource, ResourceId};
    pub use crate::scheduler::{DestroyReport, NodeState, RunReport, Scheduler};
    pub use crate::stack::{RunOutcome, Stack};
}
