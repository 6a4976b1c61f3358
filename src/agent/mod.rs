//! Generic agent engine: lifecycle state machine plus the perceive→decide→act
//! (PDA) loop every bot runs on.
//!
//! Each agent owns exactly one concurrently scheduled loop task. The loop
//! executes perceive→decide→act strictly sequentially under a mutex (the
//! reentrancy guard), yields between cycles so sibling agents progress, and
//! observes a cancellation token so `stop()` works from any context,
//! including from a bus subscriber running inside this agent's own publish,
//! where awaiting the loop would deadlock on itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::schematic::SchematicError;
use crate::settings::Settings;
use crate::terrain::TerrainError;

/// Free-form parameters carried by `update` and control commands.
pub type ParamMap = HashMap<String, serde_json::Value>;

tokio::task_local! {
    /// Identity of the agent whose PDA loop is driving the current task.
    static LOOP_AGENT: String;
}

/// True when the current task *is* `agent_id`'s own PDA loop. Checked
/// explicitly by `stop()` so an agent never awaits its own loop.
fn in_own_loop(agent_id: &str) -> bool {
    LOOP_AGENT.try_with(|id| id == agent_id).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Unified lifecycle states shared by all agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Idle,
    Running,
    Paused,
    Waiting,
    Stopped,
    Error,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Stopped | AgentState::Error)
    }

    /// Edge table of the lifecycle state machine. `start()` is the only way
    /// out of a terminal state.
    pub fn allows(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Stopped)
                | (Running, Paused)
                | (Running, Waiting)
                | (Running, Stopped)
                | (Running, Error)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Waiting, Running)
                | (Waiting, Stopped)
                | (Waiting, Error)
                | (Stopped, Running)
                | (Error, Running)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Idle => "IDLE",
            AgentState::Running => "RUNNING",
            AgentState::Paused => "PAUSED",
            AgentState::Waiting => "WAITING",
            AgentState::Stopped => "STOPPED",
            AgentState::Error => "ERROR",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Cycle plumbing
// ---------------------------------------------------------------------------

/// Failure that escaped a perceive/decide/act phase. Escalates the agent to
/// `Error` and terminates its loop; never touches other agents.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("terrain access failed: {0}")]
    Terrain(#[from] TerrainError),
    #[error("schematic error: {0}")]
    Schematic(#[from] SchematicError),
    #[error("{0}")]
    Other(String),
}

impl CycleError {
    pub fn other(msg: impl Into<String>) -> Self {
        CycleError::Other(msg.into())
    }
}

/// What the loop should do after a completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStep {
    /// Yield and run another cycle.
    Continue,
    /// Mission complete: transition to Stopped, checkpoint, exit.
    Finished,
}

/// Per-cycle view handed to behavior methods: cancellation probe plus the
/// narrow state adjustments a behavior is allowed to make.
pub struct CycleContext {
    core: Arc<AgentCore>,
    cancel: CancellationToken,
}

impl CycleContext {
    pub fn agent_id(&self) -> &str {
        &self.core.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> AgentState {
        self.core.state()
    }

    /// Running → Waiting, used while an agent is starved for input.
    pub fn mark_waiting(&self, reason: &str) {
        self.core.transition(AgentState::Waiting, reason);
    }

    /// Waiting → Running, once the starvation clears.
    pub fn mark_running(&self, reason: &str) {
        self.core.transition(AgentState::Running, reason);
    }
}

/// The domain half of an agent: the three PDA phases plus the overridable
/// hooks. Implementations own all their mutable state; the engine guarantees
/// at most one cycle runs at a time.
#[async_trait]
pub trait Behavior: Send + 'static {
    type Percept: Send;
    type Decision: Send;

    async fn perceive(&mut self, cx: &CycleContext) -> Result<Self::Percept, CycleError>;

    async fn decide(
        &mut self,
        percept: Self::Percept,
        cx: &CycleContext,
    ) -> Result<Self::Decision, CycleError>;

    async fn act(
        &mut self,
        decision: Self::Decision,
        cx: &CycleContext,
    ) -> Result<CycleStep, CycleError>;

    /// Dynamic reconfiguration hook.
    async fn update(&mut self, params: ParamMap) {
        let _ = params;
    }

    /// Cleanup hook, invoked once before the checkpoint when the agent
    /// stops, errors out, or completes.
    async fn shutdown(&mut self) {}

    /// Checkpoint hook, invoked on stop, on error, and on completion.
    async fn save_checkpoint(&mut self) {}
}

// ---------------------------------------------------------------------------
// Core + handle
// ---------------------------------------------------------------------------

/// Engine-owned half of an agent: identity, state cell, cancellation token,
/// and the single loop-task slot.
pub struct AgentCore {
    id: String,
    state: Mutex<AgentState>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Set by whichever path performs the one Stopped transition +
    /// checkpoint, so concurrent `stop()` calls finalize exactly once.
    stop_finalized: AtomicBool,
    /// Deferred checkpoint marker for `stop()` called from the loop's own
    /// execution context.
    checkpoint_pending: AtomicBool,
    pause_poll: Duration,
    stop_grace: Duration,
}

impl AgentCore {
    fn new(id: String, settings: &Settings) -> Self {
        info!(agent = %id, "agent created");
        Self {
            id,
            state: Mutex::new(AgentState::Idle),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
            stop_finalized: AtomicBool::new(false),
            checkpoint_pending: AtomicBool::new(false),
            pause_poll: settings.pause_poll(),
            stop_grace: settings.stop_grace(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap()
    }

    /// Apply a state transition if the edge table allows it. Same-state is a
    /// quiet no-op; a rejected edge is logged and leaves the state unchanged.
    pub(crate) fn transition(&self, next: AgentState, reason: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let prev = *state;
        if prev == next {
            return true;
        }
        if !prev.allows(next) {
            warn!(agent = %self.id, from = %prev, to = %next, reason, "rejected state transition");
            return false;
        }
        *state = next;
        info!(agent = %self.id, from = %prev, to = %next, reason, "state transition");
        true
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    fn request_stop(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Returns true for exactly one caller per run.
    fn finalize_stop(&self) -> bool {
        !self.stop_finalized.swap(true, Ordering::SeqCst)
    }
}

/// An agent: engine core plus behavior behind the reentrancy guard.
///
/// Cheap to clone; clones share the same core and behavior.
pub struct Agent<B: Behavior> {
    core: Arc<AgentCore>,
    behavior: Arc<AsyncMutex<B>>,
}

impl<B: Behavior> Clone for Agent<B> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            behavior: Arc::clone(&self.behavior),
        }
    }
}

impl<B: Behavior> Agent<B> {
    pub fn new(id: impl Into<String>, behavior: B, settings: &Settings) -> Self {
        Self {
            core: Arc::new(AgentCore::new(id.into(), settings)),
            behavior: Arc::new(AsyncMutex::new(behavior)),
        }
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn state(&self) -> AgentState {
        self.core.state()
    }

    /// Direct access to the behavior, for wiring and tests. Locking this
    /// while the loop is mid-cycle waits for the cycle to finish.
    pub fn behavior(&self) -> &Arc<AsyncMutex<B>> {
        &self.behavior
    }

    pub fn is_loop_active(&self) -> bool {
        self.core
            .task
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Start the PDA loop. Idempotent: a second call while the loop is
    /// active logs and returns without spawning anything.
    pub async fn start(&self) {
        // The slot lock is held across check + spawn so two racing start()
        // calls cannot both arm a loop.
        let mut slot = self.core.task.lock().unwrap();
        if slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            warn!(agent = %self.core.id, "start ignored: loop already active");
            return;
        }
        let token = CancellationToken::new();
        *self.core.cancel.lock().unwrap() = token.clone();
        self.core.stop_finalized.store(false, Ordering::SeqCst);
        self.core.checkpoint_pending.store(false, Ordering::SeqCst);
        self.core.transition(AgentState::Running, "start");
        let core = Arc::clone(&self.core);
        let behavior = Arc::clone(&self.behavior);
        *slot = Some(tokio::spawn(LOOP_AGENT.scope(
            self.core.id.clone(),
            run_loop(core, behavior, token),
        )));
        info!(agent = %self.core.id, "agent started");
    }

    /// Request loop termination and finalize the lifecycle.
    ///
    /// Callable from any context. From a foreign task it waits (bounded by
    /// `stop_grace`) for the loop to exit, aborting on overrun. From the
    /// loop's own execution context it only signals and defers the
    /// checkpoint to the loop's exit path, never awaiting itself.
    pub async fn stop(&self) {
        self.core.request_stop();
        let own_loop = in_own_loop(&self.core.id);
        if !own_loop {
            let task = self.core.task.lock().unwrap().take();
            if let Some(mut task) = task {
                if tokio::time::timeout(self.core.stop_grace, &mut task)
                    .await
                    .is_err()
                {
                    warn!(agent = %self.core.id, "loop did not stop within grace period, aborting");
                    task.abort();
                }
            }
        }
        if self.core.state().is_terminal() {
            debug!(agent = %self.core.id, "stop: already terminal");
            return;
        }
        if self.core.finalize_stop() {
            self.core.transition(AgentState::Stopped, "stop requested");
            if own_loop {
                self.core.checkpoint_pending.store(true, Ordering::SeqCst);
            } else {
                let mut b = self.behavior.lock().await;
                b.shutdown().await;
                b.save_checkpoint().await;
            }
            info!(agent = %self.core.id, "agent stopped");
        }
    }

    /// Running → Paused. Any other source state is rejected.
    pub async fn pause(&self) {
        self.core.transition(AgentState::Paused, "pause command");
    }

    /// Paused → Running.
    pub async fn resume(&self) {
        self.core.transition(AgentState::Running, "resume command");
    }

    /// Forward dynamic parameters to the behavior.
    pub async fn update(&self, params: ParamMap) {
        info!(agent = %self.core.id, ?params, "update");
        self.behavior.lock().await.update(params).await;
    }
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

async fn run_loop<B: Behavior>(
    core: Arc<AgentCore>,
    behavior: Arc<AsyncMutex<B>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            // Cooperative cancellation: exit silently, stop() owns the
            // lifecycle bookkeeping.
            break;
        }
        match core.state() {
            AgentState::Paused => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(core.pause_poll) => {}
                }
                continue;
            }
            s if s.is_terminal() => break,
            _ => {}
        }

        let cx = CycleContext {
            core: Arc::clone(&core),
            cancel: cancel.clone(),
        };
        let step = {
            let mut b = behavior.lock().await;
            run_cycle(&mut *b, &cx).await
        };
        match step {
            Ok(CycleStep::Continue) => tokio::task::yield_now().await,
            Ok(CycleStep::Finished) => {
                if core.finalize_stop() {
                    core.transition(AgentState::Stopped, "mission complete");
                    let mut b = behavior.lock().await;
                    b.shutdown().await;
                    b.save_checkpoint().await;
                }
                break;
            }
            Err(err) => {
                error!(agent = %core.id, %err, "unhandled cycle failure");
                core.stop_finalized.store(true, Ordering::SeqCst);
                core.transition(AgentState::Error, "unhandled cycle failure");
                let mut b = behavior.lock().await;
                b.shutdown().await;
                b.save_checkpoint().await;
                break;
            }
        }
    }
    // Deferred checkpoint for stop() invoked from this loop's own context.
    if core.checkpoint_pending.swap(false, Ordering::SeqCst) {
        let mut b = behavior.lock().await;
        b.shutdown().await;
        b.save_checkpoint().await;
    }
    debug!(agent = %core.id, "loop exited");
}

async fn run_cycle<B: Behavior>(b: &mut B, cx: &CycleContext) -> Result<CycleStep, CycleError> {
    let percept = b.perceive(cx).await?;
    let decision = b.decide(percept, cx).await?;
    b.act(decision, cx).await
}

// ---------------------------------------------------------------------------
// Object-safe control surface
// ---------------------------------------------------------------------------

/// What the command dispatcher needs from any agent, regardless of behavior
/// type.
#[async_trait]
pub trait ControlHandle: Send + Sync {
    fn id(&self) -> &str;
    fn state(&self) -> AgentState;
    async fn start(&self);
    async fn stop(&self);
    async fn pause(&self);
    async fn resume(&self);
    async fn update(&self, params: ParamMap);
}

#[async_trait]
impl<B: Behavior> ControlHandle for Agent<B> {
    fn id(&self) -> &str {
        Agent::id(self)
    }

    fn state(&self) -> AgentState {
        Agent::state(self)
    }

    async fn start(&self) {
        Agent::start(self).await;
    }

    async fn stop(&self) {
        Agent::stop(self).await;
    }

    async fn pause(&self) {
        Agent::pause(self).await;
    }

    async fn resume(&self) {
        Agent::resume(self).await;
    }

    async fn update(&self, params: ParamMap) {
        Agent::update(self, params).await;
    }
}
