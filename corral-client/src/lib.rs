//! Client-side dispatch for the Corral fleet control plane.
//!
//! Every outbound message picks a recipient through the adaptive
//! weighted [`balancer::LoadBalancer`] and reports the outcome back so
//! busy nodes shed load.

pub mod balancer;

pub use balancer::{BalancerError, LoadBalancer, NodeMetricsSnapshot, ServiceAddress};
