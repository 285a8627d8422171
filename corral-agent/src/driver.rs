//! Driver seams the host agent reconciles through.
//!
//! The agent core talks to three external collaborators: the node
//! repository (what should run here), the orchestrator (permission to
//! suspend or resume this host), and the node-admin driver (the subsystem
//! that actually starts and stops containers). Each seam is a trait so
//! deterministic mocks can stand in during tests; the mocks live here as
//! well, next to the contracts they implement.

use async_trait::async_trait;
use corral_common::{ContainerSpec, HostName, RepositoryError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

// ── Errors ─────────────────────────────────────────────────────────────────

/// Failure from the orchestrator permission service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Policy refused the operation for now. Absorbed and retried on the
    /// next tick.
    #[error("orchestrator denied the request: {0}")]
    Denied(String),

    /// The orchestrator could not be reached.
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
}

/// Failure from the node-admin driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeAdminError {
    #[error("node admin driver failure: {0}")]
    Driver(String),
}

// ── Contracts ──────────────────────────────────────────────────────────────

/// Read access to the node repository, scoped to the agent's host.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// The containers the repository currently wants running on this host.
    async fn containers_to_run(&self) -> Result<Vec<ContainerSpec>, RepositoryError>;
}

/// Cluster-wide permission service for suspending and resuming hosts.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn resume(&self, host: &HostName) -> Result<(), OrchestratorError>;

    /// Ask permission to suspend `host` on behalf of the given container
    /// hostnames (the host's own hostname included).
    async fn suspend(&self, host: &HostName, hostnames: &[HostName])
    -> Result<(), OrchestratorError>;
}

/// Driver for the per-host node-admin subsystem.
#[async_trait]
pub trait NodeAdmin: Send + Sync {
    /// Request the subsystem frozen or unfrozen. Returns `true` once the
    /// subsystem has converged to the requested freeze state.
    async fn set_frozen(&self, frozen: bool) -> bool;

    /// How long the subsystem has been working toward its requested freeze
    /// state. Zero when it is converged.
    fn subsystem_freeze_duration(&self) -> Duration;

    /// Push the wanted container set into the subsystem.
    async fn refresh_containers_to_run(
        &self,
        containers: Vec<ContainerSpec>,
    ) -> Result<(), NodeAdminError>;

    /// Stop node agent services inside the given containers.
    async fn stop_node_agent_services(&self, hostnames: &[HostName]);

    /// Snapshot of subsystem internals for the debug endpoint.
    fn debug_info(&self) -> serde_json::Value;

    /// Release driver resources. Called exactly once, on agent stop.
    async fn shutdown(&self);
}

// ── Call journal ───────────────────────────────────────────────────────────

/// Shared, ordered record of driver calls.
///
/// Tests hand one journal to several mocks to assert cross-driver call
/// ordering (freeze before suspend, converge before refresh).
#[derive(Debug, Clone, Default)]
pub struct CallJournal(Arc<Mutex<Vec<String>>>);

impl CallJournal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0
            .lock()
            .expect("call journal mutex poisoned")
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("call journal mutex poisoned").clone()
    }
}

// ── Mock node repository ───────────────────────────────────────────────────

/// Deterministic in-memory node repository for tests.
///
/// Scripted failures are consumed FIFO before the standing container set
/// is served.
#[derive(Default)]
pub struct MockNodeRepository {
    containers: Mutex<Vec<ContainerSpec>>,
    scripted_failures: Mutex<Vec<RepositoryError>>,
    fetches: AtomicUsize,
    journal: Option<CallJournal>,
}

impl MockNodeRepository {
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn set_containers(&self, containers: Vec<ContainerSpec>) {
        *self.containers.lock().expect("containers mutex poisoned") = containers;
    }

    pub fn push_failure(&self, error: RepositoryError) {
        self.scripted_failures
            .lock()
            .expect("failures mutex poisoned")
            .push(error);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeRepository for MockNodeRepository {
    async fn containers_to_run(&self) -> Result<Vec<ContainerSpec>, RepositoryError> {
        if let Some(journal) = &self.journal {
            journal.record("containers_to_run");
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.scripted_failures.lock().expect("failures mutex poisoned");
        if !failures.is_empty() {
            return Err(failures.remove(0));
        }
        Ok(self.containers.lock().expect("containers mutex poisoned").clone())
    }
}

// ── Mock orchestrator ──────────────────────────────────────────────────────

/// Deterministic orchestrator mock. Scripted results are consumed FIFO;
/// an empty script grants every request.
#[derive(Default)]
pub struct MockOrchestrator {
    resume_results: Mutex<Vec<Result<(), OrchestratorError>>>,
    suspend_results: Mutex<Vec<Result<(), OrchestratorError>>>,
    resume_calls: Mutex<Vec<HostName>>,
    suspend_calls: Mutex<Vec<(HostName, Vec<HostName>)>>,
    journal: Option<CallJournal>,
}

impl MockOrchestrator {
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn push_resume_result(&self, result: Result<(), OrchestratorError>) {
        self.resume_results
            .lock()
            .expect("resume results mutex poisoned")
            .push(result);
    }

    pub fn push_suspend_result(&self, result: Result<(), OrchestratorError>) {
        self.suspend_results
            .lock()
            .expect("suspend results mutex poisoned")
            .push(result);
    }

    pub fn resume_calls(&self) -> Vec<HostName> {
        self.resume_calls.lock().expect("resume calls mutex poisoned").clone()
    }

    pub fn suspend_calls(&self) -> Vec<(HostName, Vec<HostName>)> {
        self.suspend_calls
            .lock()
            .expect("suspend calls mutex poisoned")
            .clone()
    }
}

fn pop_or_ok(results: &Mutex<Vec<Result<(), OrchestratorError>>>) -> Result<(), OrchestratorError> {
    let mut results = results.lock().expect("results mutex poisoned");
    if results.is_empty() {
        Ok(())
    } else {
        results.remove(0)
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn resume(&self, host: &HostName) -> Result<(), OrchestratorError> {
        if let Some(journal) = &self.journal {
            journal.record("resume");
        }
        self.resume_calls
            .lock()
            .expect("resume calls mutex poisoned")
            .push(host.clone());
        pop_or_ok(&self.resume_results)
    }

    async fn suspend(
        &self,
        host: &HostName,
        hostnames: &[HostName],
    ) -> Result<(), OrchestratorError> {
        if let Some(journal) = &self.journal {
            journal.record("suspend");
        }
        self.suspend_calls
            .lock()
            .expect("suspend calls mutex poisoned")
            .push((host.clone(), hostnames.to_vec()));
        pop_or_ok(&self.suspend_results)
    }
}

// ── Mock node admin ────────────────────────────────────────────────────────

/// Deterministic node-admin mock.
///
/// `set_frozen` answers from a FIFO script, defaulting to `true`
/// (converged) when the script is empty.
#[derive(Default)]
pub struct MockNodeAdmin {
    set_frozen_results: Mutex<Vec<bool>>,
    set_frozen_calls: Mutex<Vec<bool>>,
    freeze_duration: Mutex<Duration>,
    refresh_failures: Mutex<Vec<NodeAdminError>>,
    refresh_calls: Mutex<Vec<Vec<ContainerSpec>>>,
    stop_services_calls: Mutex<Vec<Vec<HostName>>>,
    shutdowns: AtomicUsize,
    journal: Option<CallJournal>,
}

impl MockNodeAdmin {
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn push_set_frozen_result(&self, converged: bool) {
        self.set_frozen_results
            .lock()
            .expect("set_frozen results mutex poisoned")
            .push(converged);
    }

    pub fn set_subsystem_freeze_duration(&self, duration: Duration) {
        *self.freeze_duration.lock().expect("freeze duration mutex poisoned") = duration;
    }

    pub fn push_refresh_failure(&self, error: NodeAdminError) {
        self.refresh_failures
            .lock()
            .expect("refresh failures mutex poisoned")
            .push(error);
    }

    pub fn set_frozen_calls(&self) -> Vec<bool> {
        self.set_frozen_calls
            .lock()
            .expect("set_frozen calls mutex poisoned")
            .clone()
    }

    pub fn refresh_calls(&self) -> Vec<Vec<ContainerSpec>> {
        self.refresh_calls.lock().expect("refresh calls mutex poisoned").clone()
    }

    pub fn stop_services_calls(&self) -> Vec<Vec<HostName>> {
        self.stop_services_calls
            .lock()
            .expect("stop services calls mutex poisoned")
            .clone()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeAdmin for MockNodeAdmin {
    async fn set_frozen(&self, frozen: bool) -> bool {
        if let Some(journal) = &self.journal {
            journal.record(format!("set_frozen({frozen})"));
        }
        self.set_frozen_calls
            .lock()
            .expect("set_frozen calls mutex poisoned")
            .push(frozen);
        let mut results = self
            .set_frozen_results
            .lock()
            .expect("set_frozen results mutex poisoned");
        if results.is_empty() { true } else { results.remove(0) }
    }

    fn subsystem_freeze_duration(&self) -> Duration {
        *self.freeze_duration.lock().expect("freeze duration mutex poisoned")
    }

    async fn refresh_containers_to_run(
        &self,
        containers: Vec<ContainerSpec>,
    ) -> Result<(), NodeAdminError> {
        if let Some(journal) = &self.journal {
            journal.record("refresh_containers_to_run");
        }
        self.refresh_calls
            .lock()
            .expect("refresh calls mutex poisoned")
            .push(containers);
        let mut failures = self
            .refresh_failures
            .lock()
            .expect("refresh failures mutex poisoned");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.remove(0))
        }
    }

    async fn stop_node_agent_services(&self, hostnames: &[HostName]) {
        if let Some(journal) = &self.journal {
            journal.record("stop_node_agent_services");
        }
        self.stop_services_calls
            .lock()
            .expect("stop services calls mutex poisoned")
            .push(hostnames.to_vec());
    }

    fn debug_info(&self) -> serde_json::Value {
        serde_json::json!({
            "driver": "mock",
            "refreshes": self.refresh_calls.lock().expect("refresh calls mutex poisoned").len(),
            "shutdowns": self.shutdowns.load(Ordering::SeqCst),
        })
    }

    async fn shutdown(&self) {
        if let Some(journal) = &self.journal {
            journal.record("shutdown");
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
