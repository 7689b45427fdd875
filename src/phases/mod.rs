//! Implementation of the phases of a tfstage run.
//!
//! ## Overview
//!
//! A run follows 4 phases:
//! 1. Discovery - Find directories and the dependencies between them
//! 2. Ordering - Reject cycles and partition the graph into levels
//! 3. Preparation - Resolve environment variables, secrets and backend arguments
//! 4. Execution - Run the tool level by level on a bounded worker pool
//!
//! Phases 1-3 have no side effects beyond reads, so every configuration error
//! surfaces before the first directory is executed. The `orchestrator`
//! module wires the phases together.

pub mod discovery;
pub mod execution;
pub mod orchestrator;
pub mod ordering;
pub mod preparation;

pub use discovery as phase1;
pub use execution as phase4;
pub use ordering as phase2;
pub use preparation as phase3;
