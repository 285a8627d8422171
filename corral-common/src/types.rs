//! Shared domain types for the Corral control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hostname of a host or container in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostName(pub String);

impl HostName {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self(hostname.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a deployed application: tenant, application and instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplicationId {
    pub tenant: String,
    pub application: String,
    pub instance: String,
}

impl ApplicationId {
    pub fn new(
        tenant: impl Into<String>,
        application: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            application: application.into(),
            instance: instance.into(),
        }
    }

    /// Canonical `tenant:application:instance` form used in logs and storage keys.
    pub fn serialized_form(&self) -> String {
        format!("{}:{}:{}", self.tenant, self.application, self.instance)
    }
}

impl std::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialized_form())
    }
}

/// Hardware profile requested for a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flavor(pub String);

impl Flavor {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a node in the node repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Allocated to an application and serving.
    Active,
    /// Allocated but taken out of service.
    Inactive,
    /// Reserved for an application, pending activation.
    Reserved,
    /// Provisioned in the cloud, not yet ready for allocation.
    Provisioned,
    /// Taken out of rotation by the failer.
    Failed,
    /// Parked for manual inspection.
    Parked,
    /// Deallocated, pending cleanup.
    Dirty,
    /// Clean and allocatable.
    Ready,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Reserved => "reserved",
            Self::Provisioned => "provisioned",
            Self::Failed => "failed",
            Self::Parked => "parked",
            Self::Dirty => "dirty",
            Self::Ready => "ready",
        };
        write!(f, "{s}")
    }
}

/// Kind of cluster a node allocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    Admin,
    Container,
    Content,
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Admin => "admin",
            Self::Container => "container",
            Self::Content => "content",
        };
        write!(f, "{s}")
    }
}

/// Cluster identifier, unique within an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A shard of a cluster.
///
/// Encoded as a decimal string; generated layouts use contiguous indices
/// from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Group(u32);

impl Group {
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Group {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Self)
    }
}

impl Serialize for Group {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Group {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Specification of one cluster within an application deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub id: ClusterId,
    pub cluster_type: ClusterType,
    /// Group this spec is pinned to, if any. Unset specs span all groups.
    pub group: Option<Group>,
}

impl ClusterSpec {
    pub fn new(id: ClusterId, cluster_type: ClusterType) -> Self {
        Self {
            id,
            cluster_type,
            group: None,
        }
    }

    /// Copy of this spec pinned to the given group.
    pub fn with_group(&self, group: Group) -> Self {
        Self {
            id: self.id.clone(),
            cluster_type: self.cluster_type,
            group: Some(group),
        }
    }

    /// Whether `other` names the same cluster, disregarding group.
    pub fn equals_ignoring_group(&self, other: &ClusterSpec) -> bool {
        self.id == other.id && self.cluster_type == other.cluster_type
    }
}

/// Membership of a node in a cluster: the cluster spec plus the node's
/// ordinal within that cluster.
///
/// The ordinal is unique across all active and failed members of the
/// cluster, so indices of failed nodes are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub cluster: ClusterSpec,
    pub index: u32,
}

impl ClusterMembership {
    pub fn new(cluster: ClusterSpec, index: u32) -> Self {
        Self { cluster, index }
    }

    pub fn with_cluster(&self, cluster: ClusterSpec) -> Self {
        Self {
            cluster,
            index: self.index,
        }
    }
}

/// Allocation of a node to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub owner: ApplicationId,
    pub membership: ClusterMembership,
    /// Whether this node can be removed without retiring it first.
    pub removable: bool,
    /// Set when the node has been asked to retire from its cluster.
    pub retired_at: Option<DateTime<Utc>>,
}

impl Allocation {
    pub fn new(owner: ApplicationId, membership: ClusterMembership) -> Self {
        Self {
            owner,
            membership,
            removable: false,
            retired_at: None,
        }
    }

    pub fn removable(mut self) -> Self {
        self.removable = true;
        self
    }

    pub fn with_membership(&self, membership: ClusterMembership) -> Self {
        Self {
            membership,
            ..self.clone()
        }
    }

    /// Copy of this allocation marked retired at the given instant.
    pub fn retired(&self, at: DateTime<Utc>) -> Self {
        Self {
            retired_at: Some(at),
            ..self.clone()
        }
    }
}

/// A node in the node repository.
///
/// Node identity is the hostname; all other fields are mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: HostName,
    pub flavor: Flavor,
    pub state: NodeState,
    pub allocation: Option<Allocation>,
}

impl Node {
    pub fn new(hostname: HostName, flavor: Flavor, state: NodeState) -> Self {
        Self {
            hostname,
            flavor,
            state,
            allocation: None,
        }
    }

    pub fn with_allocation(&self, allocation: Allocation) -> Self {
        Self {
            allocation: Some(allocation),
            ..self.clone()
        }
    }

    /// Copy of this node with its allocation marked retired.
    ///
    /// Unallocated nodes are returned unchanged.
    pub fn retired(&self, at: DateTime<Utc>) -> Self {
        match &self.allocation {
            Some(allocation) => self.with_allocation(allocation.retired(at)),
            None => self.clone(),
        }
    }
}

/// Container the node repository wants running on a host.
///
/// Opaque payload relayed from the node repository to the node-admin
/// driver; the agent only inspects hostname and node state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub hostname: HostName,
    pub node_state: NodeState,
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default)]
    pub restart_generation: Option<u64>,
}

impl ContainerSpec {
    pub fn new(hostname: HostName, node_state: NodeState) -> Self {
        Self {
            hostname,
            node_state,
            container_image: None,
            restart_generation: None,
        }
    }
}

/// Suspend/resume posture of a host agent.
///
/// Transitions follow the ordered chain
/// `Resumed ↔ SuspendedNodeAdmin ↔ Suspended`; a direct move between the
/// endpoints passes through `SuspendedNodeAdmin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// Host is serving; containers converge toward the repository's wishes.
    Resumed,
    /// Container mutation is frozen and the orchestrator has granted
    /// permission to suspend the host.
    SuspendedNodeAdmin,
    /// Node agent services have additionally been stopped.
    Suspended,
}

impl AgentState {
    fn rank(self) -> u8 {
        match self {
            Self::Resumed => 0,
            Self::SuspendedNodeAdmin => 1,
            Self::Suspended => 2,
        }
    }

    fn from_rank(rank: u8) -> Self {
        match rank {
            0 => Self::Resumed,
            1 => Self::SuspendedNodeAdmin,
            _ => Self::Suspended,
        }
    }

    /// The adjacent state one step along the chain toward `target`, or
    /// `self` when already there.
    pub fn step_toward(self, target: AgentState) -> AgentState {
        use std::cmp::Ordering;
        match self.rank().cmp(&target.rank()) {
            Ordering::Less => Self::from_rank(self.rank() + 1),
            Ordering::Greater => Self::from_rank(self.rank() - 1),
            Ordering::Equal => self,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Resumed => "RESUMED",
            Self::SuspendedNodeAdmin => "SUSPENDED_NODE_ADMIN",
            Self::Suspended => "SUSPENDED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_guard;

    #[test]
    fn test_application_id_serialized_form() {
        let _guard = test_guard!();
        let app = ApplicationId::new("vault", "search", "default");
        assert_eq!(app.serialized_form(), "vault:search:default");
        assert_eq!(app.to_string(), "vault:search:default");
    }

    #[test]
    fn test_group_string_round_trip() {
        let _guard = test_guard!();
        let group = Group::from_index(3);
        assert_eq!(group.to_string(), "3");
        assert_eq!("3".parse::<Group>().unwrap(), group);
        assert!("".parse::<Group>().is_err());
        assert!("-1".parse::<Group>().is_err());

        let json = serde_json::to_string(&group).unwrap();
        assert_eq!(json, "\"3\"");
        assert_eq!(serde_json::from_str::<Group>(&json).unwrap(), group);
    }

    #[test]
    fn test_cluster_spec_equals_ignoring_group() {
        let _guard = test_guard!();
        let spec = ClusterSpec::new(ClusterId::new("search"), ClusterType::Content);
        let pinned = spec.with_group(Group::from_index(1));
        assert!(spec.equals_ignoring_group(&pinned));

        let other = ClusterSpec::new(ClusterId::new("search"), ClusterType::Container);
        assert!(!spec.equals_ignoring_group(&other));
    }

    #[test]
    fn test_agent_state_steps_one_at_a_time() {
        let _guard = test_guard!();
        assert_eq!(
            AgentState::Resumed.step_toward(AgentState::Suspended),
            AgentState::SuspendedNodeAdmin
        );
        assert_eq!(
            AgentState::SuspendedNodeAdmin.step_toward(AgentState::Suspended),
            AgentState::Suspended
        );
        assert_eq!(
            AgentState::Suspended.step_toward(AgentState::Resumed),
            AgentState::SuspendedNodeAdmin
        );
        assert_eq!(
            AgentState::Resumed.step_toward(AgentState::Resumed),
            AgentState::Resumed
        );
    }

    #[test]
    fn test_agent_state_display_and_serde() {
        let _guard = test_guard!();
        assert_eq!(AgentState::SuspendedNodeAdmin.to_string(), "SUSPENDED_NODE_ADMIN");
        assert_eq!(
            serde_json::to_string(&AgentState::Resumed).unwrap(),
            "\"RESUMED\""
        );
    }

    #[test]
    fn test_node_retired_copies_allocation() {
        let _guard = test_guard!();
        let app = ApplicationId::new("vault", "search", "default");
        let cluster = ClusterSpec::new(ClusterId::new("search"), ClusterType::Content)
            .with_group(Group::from_index(0));
        let node = Node::new(
            HostName::new("node-4.example.com"),
            Flavor::new("d-8-16-100"),
            NodeState::Active,
        )
        .with_allocation(Allocation::new(app, ClusterMembership::new(cluster, 4)));

        let retired = node.retired(Utc::now());
        assert!(retired.allocation.as_ref().unwrap().retired_at.is_some());
        // The source node is untouched.
        assert!(node.allocation.as_ref().unwrap().retired_at.is_none());
        assert_eq!(retired.hostname, node.hostname);
    }

    #[test]
    fn test_unallocated_node_retire_is_noop() {
        let _guard = test_guard!();
        let node = Node::new(
            HostName::new("spare.example.com"),
            Flavor::new("d-2-8-50"),
            NodeState::Ready,
        );
        assert_eq!(node.retired(Utc::now()), node);
    }

    #[test]
    fn test_node_state_serde_names() {
        let _guard = test_guard!();
        assert_eq!(
            serde_json::to_string(&NodeState::Provisioned).unwrap(),
            "\"provisioned\""
        );
        assert_eq!(NodeState::Failed.to_string(), "failed");
    }
}
