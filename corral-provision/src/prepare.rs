//! Application prepare: reserve and retire nodes for one cluster.
//!
//! Prepare plans the node set an application cluster would have after a
//! deployment, balancing nodes across the wanted number of groups. Group
//! counts can shrink: active nodes stranded in groups past the new count
//! become surplus, are re-homed into a surviving group, and are retired
//! unless they are removable outright. Activation of the plan is a later,
//! separate step; prepare never changes the set of active nodes.

use chrono::{DateTime, Utc};
use corral_common::{
    ApplicationId, ClusterSpec, Flavor, Group, Node, NodeState, RepositoryError,
};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

// ── Errors ─────────────────────────────────────────────────────────────────

/// Errors from preparing an application deployment.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// A precondition on the requested layout was violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The group preparer could not find enough nodes.
    #[error("out of capacity: {0}")]
    OutOfCapacity(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ── Contracts ──────────────────────────────────────────────────────────────

/// Read access to the node repository, scoped to applications.
pub trait NodeRepository: Send + Sync {
    /// Nodes owned by `application` in any of the given states.
    fn nodes(
        &self,
        application: &ApplicationId,
        states: &[NodeState],
    ) -> Result<Vec<Node>, RepositoryError>;
}

/// Reserves the nodes of one cluster group.
///
/// The delegate may claim nodes from `surplus` (removing them from the
/// list) instead of reserving fresh ones, and advances `highest_index`
/// past any ordinal it hands out so indices stay unique cluster-wide.
pub trait GroupPreparer: Send + Sync {
    fn prepare(
        &self,
        application: &ApplicationId,
        cluster_group: &ClusterSpec,
        node_count: u32,
        flavor: &Flavor,
        surplus: &mut Vec<Node>,
        highest_index: &mut i64,
    ) -> Result<Vec<Node>, PrepareError>;
}

// ── Preparer ───────────────────────────────────────────────────────────────

/// Plans node sets for application clusters against the node repository.
pub struct Preparer {
    repository: Arc<dyn NodeRepository>,
    group_preparer: Arc<dyn GroupPreparer>,
}

impl Preparer {
    pub fn new(repository: Arc<dyn NodeRepository>, group_preparer: Arc<dyn GroupPreparer>) -> Self {
        Self {
            repository,
            group_preparer,
        }
    }

    /// Plan the node set for one application cluster.
    ///
    /// Returns the nodes that would be active were this plan committed:
    /// the accepted members of each group, plus retired copies of
    /// non-removable surplus nodes. Reserved and inactive nodes may be
    /// rewritten by the group preparer along the way.
    pub fn prepare(
        &self,
        application: &ApplicationId,
        cluster: &ClusterSpec,
        wanted_nodes: u32,
        flavor: &Flavor,
        wanted_groups: u32,
    ) -> Result<Vec<Node>, PrepareError> {
        if cluster.group.is_some() && wanted_groups > 1 {
            return Err(PrepareError::InvalidArgument(
                "a cluster pinned to one group cannot be prepared with multiple groups".to_string(),
            ));
        }
        if wanted_groups == 0 {
            return Err(PrepareError::InvalidArgument(
                "at least one group must be requested".to_string(),
            ));
        }
        if wanted_nodes > 0 && wanted_nodes % wanted_groups != 0 {
            return Err(PrepareError::InvalidArgument(format!(
                "requested {wanted_nodes} nodes, which cannot be divided evenly into \
                 {wanted_groups} groups"
            )));
        }

        // Pinned prepares only touch their own group; nothing is surplus.
        let mut surplus = match cluster.group {
            Some(_) => Vec::new(),
            None => self.nodes_in_removable_groups(application, cluster, wanted_groups)?,
        };
        let mut highest_index = self.highest_index(application, cluster)?;
        debug!(
            application = %application,
            cluster = %cluster.id,
            surplus = surplus.len(),
            highest_index,
            "prepare groundwork"
        );

        let mut accepted: Vec<Node> = Vec::new();
        for g in 0..wanted_groups {
            let group = cluster.group.unwrap_or_else(|| Group::from_index(g));
            let cluster_group = cluster.with_group(group);
            let prepared = self.group_preparer.prepare(
                application,
                &cluster_group,
                wanted_nodes / wanted_groups,
                flavor,
                &mut surplus,
                &mut highest_index,
            )?;
            replace(&mut accepted, prepared);
        }

        move_to_active_group(&mut surplus, wanted_groups, cluster.group);
        replace(&mut accepted, retire(&surplus, Utc::now()));
        Ok(accepted)
    }

    /// Active nodes of this cluster whose group ordinal falls outside the
    /// wanted group count.
    fn nodes_in_removable_groups(
        &self,
        application: &ApplicationId,
        cluster: &ClusterSpec,
        wanted_groups: u32,
    ) -> Result<Vec<Node>, PrepareError> {
        let active = self.repository.nodes(application, &[NodeState::Active])?;
        Ok(active
            .into_iter()
            .filter(|node| {
                node.allocation.as_ref().is_some_and(|allocation| {
                    allocation.membership.cluster.equals_ignoring_group(cluster)
                        && allocation
                            .membership
                            .cluster
                            .group
                            .is_some_and(|group| group.index() >= wanted_groups)
                })
            })
            .collect())
    }

    /// Highest membership ordinal across active and failed members of the
    /// cluster, or -1 when it has none.
    ///
    /// Failed members count so their ordinals are never reused.
    fn highest_index(
        &self,
        application: &ApplicationId,
        cluster: &ClusterSpec,
    ) -> Result<i64, PrepareError> {
        let nodes = self
            .repository
            .nodes(application, &[NodeState::Active, NodeState::Failed])?;
        Ok(nodes
            .iter()
            .filter_map(|node| node.allocation.as_ref())
            .filter(|allocation| allocation.membership.cluster.equals_ignoring_group(cluster))
            .map(|allocation| i64::from(allocation.membership.index))
            .max()
            .unwrap_or(-1))
    }
}

// ── Plan arithmetic ────────────────────────────────────────────────────────

/// Union with replacement: drop any accepted entry for the same node
/// (node identity is the hostname), then add the incoming one.
fn replace(accepted: &mut Vec<Node>, incoming: Vec<Node>) {
    for node in incoming {
        accepted.retain(|existing| existing.hostname != node.hostname);
        accepted.push(node);
    }
}

/// Re-home surplus nodes stranded in groups past the new count into the
/// target group (the pinned group, or group 0), so retiring them leaves
/// no orphan groups behind.
fn move_to_active_group(surplus: &mut [Node], wanted_groups: u32, target: Option<Group>) {
    for node in surplus.iter_mut() {
        let Some(allocation) = &node.allocation else {
            continue;
        };
        let membership = &allocation.membership;
        let outside = membership
            .cluster
            .group
            .is_some_and(|group| group.index() >= wanted_groups);
        if !outside {
            continue;
        }
        let new_group = target.unwrap_or_else(|| Group::from_index(0));
        let rehomed = membership.with_cluster(membership.cluster.with_group(new_group));
        *node = node.with_allocation(allocation.with_membership(rehomed));
    }
}

/// Retired copies of the non-removable surplus nodes.
///
/// Removable nodes need no retirement and simply drop out of the plan.
fn retire(surplus: &[Node], at: DateTime<Utc>) -> Vec<Node> {
    surplus
        .iter()
        .filter(|node| {
            node.allocation
                .as_ref()
                .is_some_and(|allocation| !allocation.removable)
        })
        .map(|node| node.retired(at))
        .collect()
}

// ── Mocks ──────────────────────────────────────────────────────────────────

/// In-memory node repository for tests.
#[derive(Default)]
pub struct MockNodeRepository {
    nodes: Mutex<Vec<Node>>,
    scripted_failures: Mutex<Vec<RepositoryError>>,
}

impl MockNodeRepository {
    pub fn set_nodes(&self, nodes: Vec<Node>) {
        *self.nodes.lock().expect("nodes mutex poisoned") = nodes;
    }

    pub fn push_failure(&self, error: RepositoryError) {
        self.scripted_failures
            .lock()
            .expect("failures mutex poisoned")
            .push(error);
    }
}

impl NodeRepository for MockNodeRepository {
    fn nodes(
        &self,
        application: &ApplicationId,
        states: &[NodeState],
    ) -> Result<Vec<Node>, RepositoryError> {
        let mut failures = self.scripted_failures.lock().expect("failures mutex poisoned");
        if !failures.is_empty() {
            return Err(failures.remove(0));
        }
        Ok(self
            .nodes
            .lock()
            .expect("nodes mutex poisoned")
            .iter()
            .filter(|node| {
                states.contains(&node.state)
                    && node
                        .allocation
                        .as_ref()
                        .is_some_and(|allocation| &allocation.owner == application)
            })
            .cloned()
            .collect())
    }
}

/// One scripted reply of the [`MockGroupPreparer`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedGroup {
    /// Nodes handed back for this group.
    pub accepted: Vec<Node>,
    /// How many surplus nodes the delegate claims for itself.
    pub consume_surplus: usize,
    /// How far the delegate advances the shared ordinal counter.
    pub advance_index_by: i64,
}

/// Arguments observed by one [`MockGroupPreparer`] call.
#[derive(Debug, Clone)]
pub struct GroupCall {
    pub cluster_group: ClusterSpec,
    pub node_count: u32,
    pub surplus_before: usize,
    pub highest_index_before: i64,
}

/// Scripted group preparer honouring the by-reference contract: each
/// step may drain surplus nodes and advance the ordinal counter, the way
/// the real delegate does. Steps are consumed FIFO.
#[derive(Default)]
pub struct MockGroupPreparer {
    steps: Mutex<Vec<ScriptedGroup>>,
    calls: Mutex<Vec<GroupCall>>,
}

impl MockGroupPreparer {
    pub fn push_step(&self, step: ScriptedGroup) {
        self.steps.lock().expect("steps mutex poisoned").push(step);
    }

    pub fn calls(&self) -> Vec<GroupCall> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

impl GroupPreparer for MockGroupPreparer {
    fn prepare(
        &self,
        _application: &ApplicationId,
        cluster_group: &ClusterSpec,
        node_count: u32,
        _flavor: &Flavor,
        surplus: &mut Vec<Node>,
        highest_index: &mut i64,
    ) -> Result<Vec<Node>, PrepareError> {
        self.calls.lock().expect("calls mutex poisoned").push(GroupCall {
            cluster_group: cluster_group.clone(),
            node_count,
            surplus_before: surplus.len(),
            highest_index_before: *highest_index,
        });

        let mut steps = self.steps.lock().expect("steps mutex poisoned");
        if steps.is_empty() {
            return Err(PrepareError::OutOfCapacity(
                "mock group preparer has no scripted step".to_string(),
            ));
        }
        let step = steps.remove(0);
        let claim = step.consume_surplus.min(surplus.len());
        surplus.drain(..claim);
        *highest_index += step.advance_index_by;
        Ok(step.accepted)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use corral_common::{Allocation, ClusterId, ClusterMembership, ClusterType, HostName, test_guard};

    fn app() -> ApplicationId {
        ApplicationId::new("vault", "search", "default")
    }

    fn content_cluster() -> ClusterSpec {
        ClusterSpec::new(ClusterId::new("search"), ClusterType::Content)
    }

    fn flavor() -> Flavor {
        Flavor::new("d-8-16-100")
    }

    fn node_in(state: NodeState, host: &str, group: u32, index: u32) -> Node {
        Node::new(HostName::new(host), flavor(), state).with_allocation(Allocation::new(
            app(),
            ClusterMembership::new(content_cluster().with_group(Group::from_index(group)), index),
        ))
    }

    fn active(host: &str, group: u32, index: u32) -> Node {
        node_in(NodeState::Active, host, group, index)
    }

    /// Six active nodes spread over groups 0, 1 and 2.
    fn three_group_fleet() -> Vec<Node> {
        vec![
            active("n0.example.com", 0, 0),
            active("n1.example.com", 0, 1),
            active("n2.example.com", 1, 2),
            active("n3.example.com", 1, 3),
            active("n4.example.com", 2, 4),
            active("n5.example.com", 2, 5),
        ]
    }

    fn fixture(nodes: Vec<Node>) -> (Arc<MockNodeRepository>, Arc<MockGroupPreparer>, Preparer) {
        let repository = Arc::new(MockNodeRepository::default());
        repository.set_nodes(nodes);
        let group_preparer = Arc::new(MockGroupPreparer::default());
        let preparer = Preparer::new(repository.clone(), group_preparer.clone());
        (repository, group_preparer, preparer)
    }

    fn group_of(node: &Node) -> u32 {
        node.allocation
            .as_ref()
            .and_then(|allocation| allocation.membership.cluster.group)
            .map(|group| group.index())
            .expect("node should carry a group")
    }

    fn is_retired(node: &Node) -> bool {
        node.allocation
            .as_ref()
            .is_some_and(|allocation| allocation.retired_at.is_some())
    }

    #[test]
    fn test_pinned_group_with_multiple_groups_is_rejected() {
        let _guard = test_guard!();
        let (_, _, preparer) = fixture(vec![]);
        let pinned = content_cluster().with_group(Group::from_index(0));
        let err = preparer.prepare(&app(), &pinned, 4, &flavor(), 2).unwrap_err();
        assert!(matches!(err, PrepareError::InvalidArgument(_)));
    }

    #[test]
    fn test_uneven_distribution_is_rejected() {
        let _guard = test_guard!();
        let (_, _, preparer) = fixture(vec![]);
        let err = preparer
            .prepare(&app(), &content_cluster(), 5, &flavor(), 2)
            .unwrap_err();
        assert!(matches!(err, PrepareError::InvalidArgument(_)));
    }

    #[test]
    fn test_zero_groups_is_rejected() {
        let _guard = test_guard!();
        let (_, _, preparer) = fixture(vec![]);
        let err = preparer
            .prepare(&app(), &content_cluster(), 4, &flavor(), 0)
            .unwrap_err();
        assert!(matches!(err, PrepareError::InvalidArgument(_)));
    }

    #[test]
    fn test_zero_nodes_is_allowed() {
        let _guard = test_guard!();
        let (_, group_preparer, preparer) = fixture(vec![]);
        group_preparer.push_step(ScriptedGroup::default());
        let accepted = preparer
            .prepare(&app(), &content_cluster(), 0, &flavor(), 1)
            .unwrap();
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_rebalance_retires_surplus_groups() {
        let _guard = test_guard!();
        let (_, group_preparer, preparer) = fixture(three_group_fleet());
        group_preparer.push_step(ScriptedGroup {
            accepted: vec![active("n0.example.com", 0, 0), active("n1.example.com", 0, 1)],
            ..ScriptedGroup::default()
        });
        group_preparer.push_step(ScriptedGroup {
            accepted: vec![active("n2.example.com", 1, 2), active("n3.example.com", 1, 3)],
            ..ScriptedGroup::default()
        });

        let accepted = preparer
            .prepare(&app(), &content_cluster(), 4, &flavor(), 2)
            .unwrap();

        // The delegate saw the surplus (group 2) and the highest ordinal.
        let calls = group_preparer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].cluster_group.group, Some(Group::from_index(0)));
        assert_eq!(calls[1].cluster_group.group, Some(Group::from_index(1)));
        assert_eq!(calls[0].node_count, 2);
        assert_eq!(calls[0].surplus_before, 2);
        assert_eq!(calls[0].highest_index_before, 5);

        // Four members stay active across groups 0 and 1; the two group-2
        // nodes come back retired and re-homed into group 0.
        assert_eq!(accepted.len(), 6);
        let (retired, kept): (Vec<_>, Vec<_>) = accepted.iter().partition(|n| is_retired(n));
        assert_eq!(kept.len(), 4);
        assert!(kept.iter().all(|n| group_of(n) < 2));
        assert_eq!(retired.len(), 2);
        assert!(retired.iter().all(|n| group_of(n) == 0));
        let mut retired_hosts: Vec<_> =
            retired.iter().map(|n| n.hostname.as_str().to_string()).collect();
        retired_hosts.sort();
        assert_eq!(retired_hosts, vec!["n4.example.com", "n5.example.com"]);

        // Ordinals stay unique across the plan.
        let mut indices: Vec<_> = accepted
            .iter()
            .map(|n| n.allocation.as_ref().unwrap().membership.index)
            .collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), accepted.len());
    }

    #[test]
    fn test_surplus_claimed_by_delegate_is_not_retired() {
        let _guard = test_guard!();
        let (_, group_preparer, preparer) = fixture(three_group_fleet());
        // Group 0 keeps its members and claims n4 out of the surplus.
        group_preparer.push_step(ScriptedGroup {
            accepted: vec![
                active("n0.example.com", 0, 0),
                active("n1.example.com", 0, 1),
                active("n4.example.com", 0, 4),
            ],
            consume_surplus: 1,
            ..ScriptedGroup::default()
        });
        group_preparer.push_step(ScriptedGroup {
            accepted: vec![active("n2.example.com", 1, 2), active("n3.example.com", 1, 3)],
            ..ScriptedGroup::default()
        });

        let accepted = preparer
            .prepare(&app(), &content_cluster(), 6, &flavor(), 2)
            .unwrap();

        assert_eq!(accepted.len(), 6);
        let retired: Vec<_> = accepted.iter().filter(|n| is_retired(n)).collect();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].hostname, HostName::new("n5.example.com"));
        // The claimed node stays active in its new group.
        let n4 = accepted
            .iter()
            .find(|n| n.hostname == HostName::new("n4.example.com"))
            .unwrap();
        assert!(!is_retired(n4));
        assert_eq!(group_of(n4), 0);
    }

    #[test]
    fn test_removable_surplus_is_dropped_from_plan() {
        let _guard = test_guard!();
        let mut nodes = three_group_fleet();
        // n5 is removable: no retirement needed.
        let allocation = nodes[5].allocation.take().unwrap().removable();
        let updated = nodes[5].with_allocation(allocation);
        nodes[5] = updated;
        let (_, group_preparer, preparer) = fixture(nodes);
        group_preparer.push_step(ScriptedGroup {
            accepted: vec![active("n0.example.com", 0, 0), active("n1.example.com", 0, 1)],
            ..ScriptedGroup::default()
        });
        group_preparer.push_step(ScriptedGroup {
            accepted: vec![active("n2.example.com", 1, 2), active("n3.example.com", 1, 3)],
            ..ScriptedGroup::default()
        });

        let accepted = preparer
            .prepare(&app(), &content_cluster(), 4, &flavor(), 2)
            .unwrap();

        assert_eq!(accepted.len(), 5);
        assert!(
            !accepted
                .iter()
                .any(|n| n.hostname == HostName::new("n5.example.com"))
        );
    }

    #[test]
    fn test_pinned_group_prepares_only_that_group() {
        let _guard = test_guard!();
        let (_, group_preparer, preparer) = fixture(three_group_fleet());
        let pinned = content_cluster().with_group(Group::from_index(3));
        group_preparer.push_step(ScriptedGroup {
            accepted: vec![
                active("n6.example.com", 3, 6),
                active("n7.example.com", 3, 7),
            ],
            advance_index_by: 2,
            ..ScriptedGroup::default()
        });

        let accepted = preparer.prepare(&app(), &pinned, 2, &flavor(), 1).unwrap();

        let calls = group_preparer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cluster_group.group, Some(Group::from_index(3)));
        // Pinned prepares see no surplus even though group 2 is outside
        // the wanted count.
        assert_eq!(calls[0].surplus_before, 0);
        assert_eq!(accepted.len(), 2);
        assert!(accepted.iter().all(|n| group_of(n) == 3));
    }

    #[test]
    fn test_failed_node_ordinal_is_not_reused() {
        let _guard = test_guard!();
        let mut nodes = three_group_fleet();
        nodes.push(node_in(NodeState::Failed, "broken.example.com", 1, 11));
        let (_, group_preparer, preparer) = fixture(nodes);
        group_preparer.push_step(ScriptedGroup::default());

        let _ = preparer.prepare(&app(), &content_cluster(), 0, &flavor(), 1);
        assert_eq!(group_preparer.calls()[0].highest_index_before, 11);
    }

    #[test]
    fn test_replace_keeps_newest_entry_per_hostname() {
        let _guard = test_guard!();
        let (_, group_preparer, preparer) = fixture(vec![]);
        // Both groups hand back the same hostname; the later reply wins.
        group_preparer.push_step(ScriptedGroup {
            accepted: vec![active("dup.example.com", 0, 0)],
            ..ScriptedGroup::default()
        });
        group_preparer.push_step(ScriptedGroup {
            accepted: vec![active("dup.example.com", 1, 1)],
            ..ScriptedGroup::default()
        });

        let accepted = preparer
            .prepare(&app(), &content_cluster(), 0, &flavor(), 2)
            .unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(group_of(&accepted[0]), 1);
    }

    #[test]
    fn test_prepare_is_deterministic() {
        let _guard = test_guard!();
        let mut plans = Vec::new();
        for _ in 0..2 {
            let (_, group_preparer, preparer) = fixture(three_group_fleet());
            group_preparer.push_step(ScriptedGroup {
                accepted: vec![active("n0.example.com", 0, 0), active("n1.example.com", 0, 1)],
                ..ScriptedGroup::default()
            });
            group_preparer.push_step(ScriptedGroup {
                accepted: vec![active("n2.example.com", 1, 2), active("n3.example.com", 1, 3)],
                ..ScriptedGroup::default()
            });
            let accepted = preparer
                .prepare(&app(), &content_cluster(), 4, &flavor(), 2)
                .unwrap();
            // Timestamps differ between runs; compare the shape.
            plans.push(
                accepted
                    .iter()
                    .map(|n| (n.hostname.clone(), group_of(n), is_retired(n)))
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(plans[0], plans[1]);
    }

    #[test]
    fn test_repository_failure_propagates() {
        let _guard = test_guard!();
        let (repository, _, preparer) = fixture(vec![]);
        repository.push_failure(RepositoryError::Io("zk session lost".to_string()));
        let err = preparer
            .prepare(&app(), &content_cluster(), 2, &flavor(), 1)
            .unwrap_err();
        assert!(matches!(err, PrepareError::Repository(_)));
    }
}
