//! Shared types and utilities for the Corral container-fleet control plane.
//!
//! Domain vocabulary (nodes, allocations, cluster membership, agent
//! states), configuration loading, shared error types, and test logging
//! support used by the agent, client, and provisioning crates.

pub mod config;
pub mod errors;
pub mod testing;
pub mod types;

pub use config::{AgentSettings, ConfigError, CorralConfig};
pub use errors::RepositoryError;
pub use types::{
    AgentState, Allocation, ApplicationId, ClusterId, ClusterMembership, ClusterSpec, ClusterType,
    ContainerSpec, Flavor, Group, HostName, Node, NodeState,
};
