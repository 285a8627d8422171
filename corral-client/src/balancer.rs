//! Adaptive weighted load balancer.
//!
//! Picks a recipient from a caller-supplied candidate list using
//! deterministic weighted round-robin driven by a deficit cursor, and
//! adapts per-node weights on busy feedback. One instance per client
//! session; callers serialize `select` and `report`.

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Weight subtracted from a node on each busy report.
const BUSY_WEIGHT_PENALTY: f64 = 0.01;

/// Factor (≈ 100/99) applied to every tracked weight when a penalised
/// node would fall below the floor, so flooring it at 1.0 preserves its
/// relative disadvantage.
const WEIGHT_RESCALE_FACTOR: f64 = 1.010_101_010_101_010_1;

/// Errors from the balancer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalancerError {
    /// The service name does not follow `"{cluster}/x/[y.]index/z"`.
    #[error("malformed service name '{name}' for cluster '{cluster}'")]
    MalformedServiceName { cluster: String, name: String },
}

/// Address of one candidate service, as published in the service mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceAddress {
    name: String,
    spec: String,
}

impl ServiceAddress {
    pub fn new(name: impl Into<String>, spec: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: spec.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection spec the caller dials, e.g. `tcp/host:19101`.
    pub fn spec(&self) -> &str {
        &self.spec
    }
}

/// Per-node weight and traffic counters.
#[derive(Debug, Clone)]
struct NodeMetrics {
    weight: f64,
    sent: u64,
    busy: u64,
}

impl NodeMetrics {
    fn new() -> Self {
        Self {
            weight: 1.0,
            sent: 0,
            busy: 0,
        }
    }
}

/// Serializable view of one tracked node, for debug endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetricsSnapshot {
    pub index: usize,
    pub weight: f64,
    pub sent: u64,
    pub busy: u64,
}

/// Deterministic weighted round-robin balancer with busy-feedback weight
/// adaptation.
///
/// Node weights never fall below 1.0; penalties that would cross the
/// floor instead rescale every other tracked weight upward.
pub struct LoadBalancer {
    cluster: String,
    /// Deficit cursor. Advanced by 1.0 per pick and wrapped (keeping the
    /// overshoot remainder) when it exceeds the total candidate weight.
    position: f64,
    /// Sparse per-node metrics indexed by the service-name index.
    metrics: Vec<Option<NodeMetrics>>,
}

impl LoadBalancer {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            position: 0.0,
            metrics: Vec::new(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Current deficit cursor, exposed for debugging.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Pick one candidate, or `None` when the list is empty.
    ///
    /// Walks the candidates in caller order accumulating weights; the
    /// first candidate whose cumulative weight exceeds the cursor wins.
    /// When the cursor has overshot the total weight, the first candidate
    /// wins and the cursor wraps by the total, keeping the remainder.
    pub fn select<'a>(
        &mut self,
        candidates: &'a [ServiceAddress],
    ) -> Result<Option<&'a ServiceAddress>, BalancerError> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut weight_sum = 0.0;
        let mut selected: Option<(usize, &ServiceAddress)> = None;
        for candidate in candidates {
            let index = self.service_index(candidate.name())?;
            weight_sum += self.metrics_at(index).weight;
            if weight_sum > self.position {
                selected = Some((index, candidate));
                break;
            }
        }

        let (index, selected) = match selected {
            Some(pick) => pick,
            None => {
                debug!(
                    cluster = %self.cluster,
                    position = self.position,
                    weight_sum,
                    "cursor overshot total weight, wrapping"
                );
                self.position -= weight_sum;
                let index = self.service_index(candidates[0].name())?;
                (index, &candidates[0])
            }
        };

        self.position += 1.0;
        self.metrics_at(index).sent += 1;
        Ok(Some(selected))
    }

    /// Feedback from a completed send to `address`.
    ///
    /// A busy reply costs the node [`BUSY_WEIGHT_PENALTY`] weight; when
    /// that would cross the 1.0 floor, all tracked weights are rescaled
    /// upward and the node is floored instead. Non-busy replies are
    /// ignored.
    pub fn report(&mut self, address: &ServiceAddress, busy: bool) -> Result<(), BalancerError> {
        if !busy {
            return Ok(());
        }
        let index = self.service_index(address.name())?;
        let want = self.metrics_at(index).weight - BUSY_WEIGHT_PENALTY;
        if want < 1.0 {
            self.increase_weights();
            self.metrics_at(index).weight = 1.0;
        } else {
            self.metrics_at(index).weight = want;
        }
        self.metrics_at(index).busy += 1;
        Ok(())
    }

    /// View of all tracked nodes, in index order.
    pub fn snapshot(&self) -> Vec<NodeMetricsSnapshot> {
        self.metrics
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref().map(|metrics| NodeMetricsSnapshot {
                    index,
                    weight: metrics.weight,
                    sent: metrics.sent,
                    busy: metrics.busy,
                })
            })
            .collect()
    }

    /// Extract the node index from a service name shaped
    /// `"{cluster}/x/[y.]index/z"`.
    fn service_index(&self, name: &str) -> Result<usize, BalancerError> {
        let malformed = || BalancerError::MalformedServiceName {
            cluster: self.cluster.clone(),
            name: name.to_string(),
        };

        let rest = name
            .strip_prefix(self.cluster.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(malformed)?;
        // Skip one segment; the index segment must itself be followed by one.
        let (_, rest) = rest.split_once('/').ok_or_else(malformed)?;
        let (segment, _) = rest.split_once('/').ok_or_else(malformed)?;
        let digits = segment.rsplit('.').next().ok_or_else(malformed)?;
        digits.parse::<usize>().map_err(|_| malformed())
    }

    fn metrics_at(&mut self, index: usize) -> &mut NodeMetrics {
        if index >= self.metrics.len() {
            self.metrics.resize_with(index + 1, || None);
        }
        self.metrics[index].get_or_insert_with(NodeMetrics::new)
    }

    fn increase_weights(&mut self) {
        for slot in self.metrics.iter_mut().flatten() {
            let want = slot.weight * WEIGHT_RESCALE_FACTOR;
            slot.weight = if want < 1.0 { 1.0 } else { want };
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
