//! Multi-service lifecycle orchestration.
//!
//! This crate brings a declarative set of interdependent services up and down against an abstract container runtime:
//!
//! - [`topology`] holds the validated service graph
//! - [`resolver`] orders services so that dependencies start first and stop last
//! - [`options`] carries the lifecycle flags of a single operation
//! - [`runtime`] defines the runtime interface, plus an in-memory implementation
//! - [`orchestrator`] drives a runtime through start, stop and exec operations
#![deny(warnings)]
#![deny(missing_docs)]

pub mod options;
pub mod orchestrator;
pub mod resolver;
pub mod runtime;
pub mod topology;
