//! Testing utilities for stackform.
//!
//! This module provides:
//! - A scripted in-memory provisioning engine
//! - Assertions over run reports

mod assertions;
mod scripted;

pub use assertions::{assert_created_before, assert_node_state, assert_ordered, assert_run_succeeded};
pub use scripted::ScriptedEngine;
