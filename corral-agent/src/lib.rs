//! Host agent core for the Corral fleet control plane.
//!
//! Drives a host's container population toward the node repository's
//! declared state and coordinates graceful suspend/resume with the
//! cluster orchestrator. The REST surface and the concrete drivers live
//! in the host process; this crate owns the reconciliation policy.

pub mod convergence;
pub mod driver;

pub use convergence::{AgentError, ConvergenceError, ConvergenceLoop};
pub use driver::{
    NodeAdmin, NodeAdminError, NodeRepository, Orchestrator, OrchestratorError,
};
