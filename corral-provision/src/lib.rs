//! Application node preparation for the Corral fleet control plane.
//!
//! Plans the node set of an application cluster against the node
//! repository: reserving into groups, re-homing surplus groups after a
//! shrink, and retiring what can no longer serve. Committing the plan is
//! the activation step, which lives with the deployment pipeline.

pub mod prepare;

pub use prepare::{GroupPreparer, NodeRepository, PrepareError, Preparer};
