//! Host agent convergence loop.
//!
//! One background worker per host drives the host toward its wanted
//! suspend/resume posture and, while resumed, relays the node
//! repository's wanted container set into the node-admin driver. All
//! transitions are gated: the node-admin subsystem must reach the
//! requested freeze state and the orchestrator must grant permission
//! before the agent moves along the chain
//! `RESUMED ↔ SUSPENDED_NODE_ADMIN ↔ SUSPENDED`.
//!
//! The loop never gives up on transient failures; it logs, finishes the
//! tick, and retries on the next one. Only `stop()` ends it.

use crate::driver::{NodeAdmin, NodeRepository, Orchestrator, OrchestratorError};
use corral_common::{AgentState, HostName, NodeState};
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for the worker to exit before shutting the
/// node-admin driver down regardless.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A subsystem stuck freezing longer than this is forcibly unfrozen so an
/// indefinitely denied suspend cannot stall the agent.
const DEFAULT_FREEZE_ESCAPE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default interval between reconciliation ticks.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

// ── Errors ─────────────────────────────────────────────────────────────────

/// Lifecycle errors from [`ConvergenceLoop::start`] and
/// [`ConvergenceLoop::stop`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("convergence loop is already running")]
    AlreadyStarted,

    #[error("convergence loop has been stopped")]
    AlreadyStopped,
}

/// Why a convergence attempt did not reach the wanted state.
///
/// Distinct variants let the tick loop apply its retry policy without
/// string inspection: `NotYet` and orchestrator denial are routine and
/// info-logged, anything else is an error.
#[derive(Debug, Error)]
pub enum ConvergenceError {
    /// A gate has not opened yet (subsystem freeze pending, or the walk
    /// has more steps to take). Retried next tick.
    #[error("not yet converged: {0}")]
    NotYet(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Repository(#[from] corral_common::RepositoryError),
}

// ── Loop state ─────────────────────────────────────────────────────────────

/// Fields shared between the worker and the public API, guarded by one
/// monitor.
struct LoopState {
    wanted: AgentState,
    current: AgentState,
    work_pending: bool,
    terminated: bool,
    last_tick: Instant,
    tick_interval: Duration,
    ticks: u64,
    last_failure: Option<String>,
}

// ── Convergence loop ───────────────────────────────────────────────────────

/// Per-host supervisor reconciling container state and suspend posture.
///
/// Cheap to clone; all clones share the same loop.
#[derive(Clone)]
pub struct ConvergenceLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    host: HostName,
    node_repository: Arc<dyn NodeRepository>,
    orchestrator: Arc<dyn Orchestrator>,
    node_admin: Arc<dyn NodeAdmin>,
    freeze_escape_timeout: Duration,
    state: Mutex<LoopState>,
    wakeup: Notify,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl ConvergenceLoop {
    pub fn new(
        host: HostName,
        node_repository: Arc<dyn NodeRepository>,
        orchestrator: Arc<dyn Orchestrator>,
        node_admin: Arc<dyn NodeAdmin>,
    ) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                host,
                node_repository,
                orchestrator,
                node_admin,
                freeze_escape_timeout: DEFAULT_FREEZE_ESCAPE_TIMEOUT,
                state: Mutex::new(LoopState {
                    wanted: AgentState::SuspendedNodeAdmin,
                    current: AgentState::SuspendedNodeAdmin,
                    work_pending: false,
                    terminated: false,
                    last_tick: Instant::now(),
                    tick_interval: DEFAULT_TICK_INTERVAL,
                    ticks: 0,
                    last_failure: None,
                }),
                wakeup: Notify::new(),
                worker: StdMutex::new(None),
            }),
        }
    }

    /// Override the stuck-freeze escape threshold (from configuration).
    /// Must be called before the loop is shared or started.
    pub fn with_freeze_escape_timeout(mut self, timeout: Duration) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("freeze escape timeout must be set before the loop is shared")
            .freeze_escape_timeout = timeout;
        self
    }

    /// Record the wanted state and wake the worker if it changed.
    ///
    /// Returns whether the host has already converged to `wanted` at call
    /// time; convergence itself is not awaited.
    pub async fn set_wanted_state(&self, wanted: AgentState) -> bool {
        let mut st = self.inner.state.lock().await;
        if st.wanted != wanted {
            info!(host = %self.inner.host, %wanted, "wanted state changed");
            st.wanted = wanted;
            st.work_pending = true;
            self.inner.wakeup.notify_one();
        }
        st.current == wanted
    }

    /// The state the host has converged to so far.
    pub async fn current_state(&self) -> AgentState {
        self.inner.state.lock().await.current
    }

    /// Consistent snapshot of the agent for the debug endpoint.
    pub async fn get_debug(&self) -> serde_json::Value {
        let st = self.inner.state.lock().await;
        json!({
            "host": self.inner.host.as_str(),
            "wanted": st.wanted,
            "current": st.current,
            "ticks": st.ticks,
            "last_convergence_failure": st.last_failure,
            "node_admin": self.inner.node_admin.debug_info(),
        })
    }

    /// Begin periodic reconciliation. Fails if already started or stopped.
    pub async fn start(&self, interval: Duration) -> Result<(), AgentError> {
        {
            let mut st = self.inner.state.lock().await;
            if st.terminated {
                return Err(AgentError::AlreadyStopped);
            }
            st.tick_interval = interval;
            st.last_tick = Instant::now();
        }
        let mut worker = self.inner.worker.lock().expect("worker handle mutex poisoned");
        if worker.is_some() {
            return Err(AgentError::AlreadyStarted);
        }
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(async move { inner.run().await }));
        Ok(())
    }

    /// Terminate the loop, wait up to [`STOP_JOIN_TIMEOUT`] for the worker
    /// to exit, then shut the node-admin driver down regardless.
    ///
    /// A second call fails; the loop cannot be restarted.
    pub async fn stop(&self) -> Result<(), AgentError> {
        {
            let mut st = self.inner.state.lock().await;
            if st.terminated {
                return Err(AgentError::AlreadyStopped);
            }
            st.terminated = true;
            st.work_pending = true;
        }
        self.inner.wakeup.notify_one();

        let worker = self
            .inner
            .worker
            .lock()
            .expect("worker handle mutex poisoned")
            .take();
        if let Some(worker) = worker {
            match timeout(STOP_JOIN_TIMEOUT, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(host = %self.inner.host, "convergence worker aborted: {err}");
                }
                Err(_) => warn!(
                    host = %self.inner.host,
                    "convergence worker did not exit within {STOP_JOIN_TIMEOUT:?}"
                ),
            }
        }

        self.inner.node_admin.shutdown().await;
        Ok(())
    }

    /// Run one reconciliation pass.
    ///
    /// Public so tests can drive the loop deterministically; the worker
    /// calls this after every wait.
    pub async fn tick(&self) {
        self.inner.tick().await;
    }
}

impl LoopInner {
    async fn run(&self) {
        info!(host = %self.host, "host agent convergence loop started");
        while self.await_tick().await {
            self.tick().await;
        }
        info!(host = %self.host, "host agent convergence loop terminated");
    }

    /// Block until work is pending or the tick interval has elapsed.
    /// Returns `false` once the loop is terminated.
    async fn await_tick(&self) -> bool {
        let mut st = self.state.lock().await;
        loop {
            if st.terminated {
                return false;
            }
            let elapsed = st.last_tick.elapsed();
            if st.work_pending || elapsed >= st.tick_interval {
                return true;
            }
            let remaining = st.tick_interval - elapsed;
            drop(st);
            // A wakeup is only a hint; the predicate above decides.
            let _ = timeout(remaining, self.wakeup.notified()).await;
            st = self.state.lock().await;
        }
    }

    async fn tick(&self) {
        let target = {
            let mut st = self.state.lock().await;
            st.last_tick = Instant::now();
            st.work_pending = false;
            st.ticks += 1;
            (st.current != st.wanted).then_some(st.wanted)
        };

        if let Some(target) = target {
            let converged = match self.converge(target).await {
                Ok(()) => {
                    self.record_outcome(None).await;
                    true
                }
                Err(err @ ConvergenceError::NotYet(_)) => {
                    info!(host = %self.host, %target, "{err}");
                    self.record_outcome(Some(err.to_string())).await;
                    false
                }
                Err(err @ ConvergenceError::Orchestrator(OrchestratorError::Denied(_))) => {
                    info!(host = %self.host, %target, "{err}");
                    self.record_outcome(Some(err.to_string())).await;
                    false
                }
                Err(err) => {
                    error!(host = %self.host, %target, "convergence failed: {err}");
                    self.record_outcome(Some(err.to_string())).await;
                    false
                }
            };

            // Forced-progress fallback for a freeze that never completes.
            if !converged && target != AgentState::Resumed {
                let frozen_for = self.node_admin.subsystem_freeze_duration();
                if frozen_for > self.freeze_escape_timeout {
                    warn!(
                        host = %self.host,
                        frozen_for_secs = frozen_for.as_secs(),
                        "subsystem stuck freezing, forcing unfreeze"
                    );
                    let _ = self.node_admin.set_frozen(false).await;
                }
            }
        }

        self.fetch_containers_to_run().await;
    }

    /// Attempt one gated transition along the suspend chain toward
    /// `target`.
    ///
    /// Completing a step that is not yet the target raises
    /// [`ConvergenceError::NotYet`]; the next tick continues the walk.
    /// The observable state therefore never moves more than one step per
    /// tick.
    async fn converge(&self, target: AgentState) -> Result<(), ConvergenceError> {
        let want_frozen = target != AgentState::Resumed;
        if !self.node_admin.set_frozen(want_frozen).await {
            return Err(ConvergenceError::NotYet(format!(
                "node admin is not yet {}",
                if want_frozen { "frozen" } else { "unfrozen" }
            )));
        }

        let current = self.state.lock().await.current;
        if current == target {
            return Ok(());
        }

        match (current, target) {
            (_, AgentState::Resumed) => {
                self.orchestrator.resume(&self.host).await?;
                self.set_current_state(AgentState::Resumed).await;
                Ok(())
            }
            (AgentState::Resumed, _) | (AgentState::Suspended, AgentState::SuspendedNodeAdmin) => {
                let mut hostnames = self.active_container_hostnames().await?;
                hostnames.push(self.host.clone());
                self.orchestrator.suspend(&self.host, &hostnames).await?;
                self.set_current_state(AgentState::SuspendedNodeAdmin).await;
                if target == AgentState::Suspended {
                    Err(ConvergenceError::NotYet(
                        "node agent services are still running".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
            (AgentState::SuspendedNodeAdmin, AgentState::Suspended) => {
                let hostnames = self.active_container_hostnames().await?;
                self.node_admin.stop_node_agent_services(&hostnames).await;
                self.set_current_state(AgentState::Suspended).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Hostnames of containers the repository reports in active state.
    ///
    /// Reading the repository while frozen is required here; the result
    /// gates suspension and is never applied to the node-admin driver.
    async fn active_container_hostnames(&self) -> Result<Vec<HostName>, ConvergenceError> {
        let containers = self.node_repository.containers_to_run().await?;
        Ok(containers
            .into_iter()
            .filter(|container| container.node_state == NodeState::Active)
            .map(|container| container.hostname)
            .collect())
    }

    /// Relay the repository's wanted container set into the node-admin
    /// driver.
    ///
    /// Holds the monitor for the whole call so debug snapshots observe a
    /// consistent view. Failures are absorbed: no partial apply.
    async fn fetch_containers_to_run(&self) {
        let st = self.state.lock().await;
        if st.current != AgentState::Resumed {
            debug!(host = %self.host, current = %st.current, "not resumed, skipping container refresh");
            return;
        }
        let containers = match self.node_repository.containers_to_run().await {
            Ok(containers) => containers,
            Err(err) => {
                warn!(host = %self.host, "failed to fetch containers to run: {err}");
                return;
            }
        };
        if let Err(err) = self.node_admin.refresh_containers_to_run(containers).await {
            warn!(host = %self.host, "failed to refresh containers to run: {err}");
        }
    }

    async fn set_current_state(&self, current: AgentState) {
        let mut st = self.state.lock().await;
        if st.current != current {
            info!(host = %self.host, from = %st.current, to = %current, "agent state transition");
            st.current = current;
        }
    }

    async fn record_outcome(&self, failure: Option<String>) {
        self.state.lock().await.last_failure = failure;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
