//! The coordinator
//!
//! [`Controller`] is the single context owning every piece of session
//! state: the child pool, the checkpoint registry, the async worklist, the
//! pause state machine and the search caches. It is driven from one thread;
//! collaborators are injected as trait objects so tests can substitute the
//! simulated engine.
//!
//! Manifests finish asynchronously. Each carries a [`Completion`] tag that
//! [`Controller::manifest_finished`] dispatches on, after which the child is
//! poked for more work and any pending resume search is polled again.

mod facade;
mod navigation;
mod pause;
mod prefetch;
mod search;

pub use facade::RequestOutcome;
pub use navigation::Reach;
pub use pause::{PauseMode, ResumeSearch, SearchStep};
pub use prefetch::plan_prefetch;
pub use search::Lookup;

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointId, CheckpointRegistry, FIRST_CHECKPOINT_ID};
use crate::child::{ChildId, ChildPool, InFlight};
use crate::config::Config;
use crate::engine::{DebuggerHooks, HostMessenger, ReplayEngine, WaitOutcome};
use crate::error::ensure;
use crate::manifest::{
    AsyncManifest, AsyncWorklist, Completion, Manifest, ManifestContents, ManifestResponse,
};
use crate::point::{ExecutionPoint, Position};
use crate::Result;

use pause::PauseState;
use search::SearchCaches;

/// An installed logpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Logpoint {
    /// Where it fires
    pub position: Position,
    /// Message template
    pub text: String,
    /// Optional condition
    pub condition: Option<String>,
}

/// Record/replay session coordinator
pub struct Controller {
    config: Config,
    engine: Box<dyn ReplayEngine>,
    host: Box<dyn HostMessenger>,
    debugger: Option<Box<dyn DebuggerHooks>>,
    pool: ChildPool,
    checkpoints: CheckpointRegistry,
    worklist: AsyncWorklist,
    pause: PauseState,
    search: Option<ResumeSearch>,
    caches: SearchCaches,
    breakpoints: Vec<Position>,
    logpoints: Vec<Logpoint>,
    event_triggers: Vec<String>,
    debugger_requests: Vec<Value>,
    last_flush_checkpoint: CheckpointId,
    since_saved: Duration,
    recording_endpoint: Option<ExecutionPoint>,
    crashes: usize,
    request_response: Option<ManifestResponse>,
    servicing_request: Option<ChildId>,
    time_warp_pending: bool,
    resume_after_save: bool,
}

static_assertions::assert_impl_all!(Controller: Send);

impl Controller {
    /// Create a controller; children are created by [`Controller::initialize`]
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        config: Config,
        engine: Box<dyn ReplayEngine>,
        host: Box<dyn HostMessenger>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            engine,
            host,
            debugger: None,
            pool: ChildPool::new(),
            checkpoints: CheckpointRegistry::new(),
            worklist: AsyncWorklist::new(),
            pause: PauseState::new(),
            search: None,
            caches: SearchCaches::default(),
            breakpoints: Vec::new(),
            logpoints: Vec::new(),
            event_triggers: Vec::new(),
            debugger_requests: Vec::new(),
            last_flush_checkpoint: FIRST_CHECKPOINT_ID,
            since_saved: Duration::ZERO,
            recording_endpoint: None,
            crashes: 0,
            request_response: None,
            servicing_request: None,
            time_warp_pending: false,
            resume_after_save: false,
        })
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every child of the session
    #[must_use]
    pub fn pool(&self) -> &ChildPool {
        &self.pool
    }

    /// The checkpoint registry
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointRegistry {
        &self.checkpoints
    }

    /// Last checkpoint replaying children may run to
    #[must_use]
    pub fn last_flush_checkpoint(&self) -> CheckpointId {
        self.last_flush_checkpoint
    }

    /// Number of queued async manifests
    #[must_use]
    pub fn pending_async_manifests(&self) -> usize {
        self.worklist.len()
    }

    /// Crashes recovered so far
    #[must_use]
    pub fn crashes(&self) -> usize {
        self.crashes
    }

    /// Send a manifest to a paused child
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the child is executing, or the
    /// engine's error if the transport rejects it
    pub(crate) fn send_manifest(&mut self, id: ChildId, manifest: Manifest) -> Result<()> {
        let hang_timeout = self.config.hang_timeout();
        let child = self.pool.get_mut(id)?;
        ensure(child.paused && child.in_flight().is_none(), || {
            format!(
                "child {id} sent {} while executing",
                manifest.contents.kind()
            )
        })?;

        debug!("Sending {} to child {}", manifest.contents.kind(), id);
        self.engine.send_manifest(id, &manifest.contents)?;
        child.start_manifest(manifest, Instant::now(), hang_timeout)
    }

    /// Handle a child finishing its manifest
    ///
    /// # Errors
    ///
    /// Returns error if the completion handler fails; fatal errors end the
    /// session
    pub fn manifest_finished(&mut self, id: ChildId, response: ManifestResponse) -> Result<()> {
        let child = self.pool.get_mut(id)?;
        if child.crashed {
            debug!("Ignoring response from crashed child {}", id);
            return Ok(());
        }
        let in_flight = child.finish_manifest(&response)?;
        debug!(
            "Child {} finished {} at checkpoint {}",
            id,
            in_flight.manifest.contents.kind(),
            response.point.checkpoint
        );

        self.dispatch_completion(id, in_flight, response)?;

        if !self.pool.is_frontier(id) {
            self.poke_child(id)?;
        }
        self.poll_search()
    }

    fn dispatch_completion(
        &mut self,
        id: ChildId,
        in_flight: InFlight,
        response: ManifestResponse,
    ) -> Result<()> {
        let InFlight {
            manifest, sent_at, ..
        } = in_flight;

        match manifest.completion {
            Completion::Travel => {
                if let ManifestContents::RunToPoint {
                    snapshot_points, ..
                } = manifest.contents
                {
                    let child = self.pool.get_mut(id)?;
                    child.snapshots.extend(snapshot_points);
                    child.snapshots.sort();
                    child.snapshots.dedup();
                }
                Ok(())
            }
            Completion::Restore { popped } => {
                let child = self.pool.get_mut(id)?;
                let keep = child.snapshots.len().saturating_sub(popped);
                ensure(keep > 0, || format!("child {id} restored past its first snapshot"))?;
                child.snapshots.truncate(keep);
                child.diverged = false;
                Ok(())
            }
            Completion::Frontier => self.frontier_finished(&response),
            Completion::MainChild => self.main_child_ready(&response),
            Completion::Flush => self.frontier_flushed(&response),
            Completion::Task(task) => self.task_finished(id, task, response, sent_at.elapsed()),
            Completion::DebuggerRequest => {
                self.request_response = Some(response);
                Ok(())
            }
            Completion::BatchRequest => {
                if !self.pool.is_frontier(id) {
                    self.pool.get_mut(id)?.diverged = true;
                }
                self.settle_paused()
            }
            Completion::Ignore => Ok(()),
        }
    }

    /// Block until `id` is paused, handling whatever it reports
    ///
    /// # Errors
    ///
    /// Returns error if the wait fails or the child's crash is fatal
    pub(crate) fn wait_until_paused(&mut self, id: ChildId, force_checkpoint: bool) -> Result<()> {
        match self.engine.wait_until_paused(id, force_checkpoint)? {
            WaitOutcome::Finished(response) => self.manifest_finished(id, response),
            WaitOutcome::AlreadyPaused => Ok(()),
            WaitOutcome::Crashed => self.child_crashed(id),
        }
    }

    /// Escalate manifests that overran their hang timer to a blocking wait
    ///
    /// # Errors
    ///
    /// Returns error if the wait fails or reveals a fatal crash
    pub fn check_hangs(&mut self, now: Instant) -> Result<()> {
        let hung: Vec<ChildId> = self
            .pool
            .iter()
            .filter(|child| child.is_live() && child.is_hung(now))
            .filter(|child| {
                !(self.pool.is_frontier(child.id())
                    && child.in_flight().is_some_and(|in_flight| {
                        matches!(in_flight.manifest.completion, Completion::Frontier)
                    }))
            })
            .map(|child| child.id())
            .collect();

        for id in hung {
            warn!("Child {} overran its hang timer, waiting for it", id);
            match self.engine.wait_until_paused(id, true)? {
                WaitOutcome::Finished(response) => self.manifest_finished(id, response)?,
                WaitOutcome::AlreadyPaused => {
                    warn!("Child {} paused without reporting its manifest", id);
                }
                WaitOutcome::Crashed => self.child_crashed(id)?,
            }
        }
        Ok(())
    }

    /// Give every idle replaying child something to do
    ///
    /// # Errors
    ///
    /// Returns error if a manifest cannot be sent
    pub(crate) fn poke_children(&mut self) -> Result<()> {
        for id in self.pool.replaying_ids() {
            self.poke_child(id)?;
        }
        Ok(())
    }

    /// Give one idle child something to do
    ///
    /// Async work comes first. Otherwise the active child heads for the
    /// pause point and any other child runs up to the flush frontier.
    pub(crate) fn poke_child(&mut self, id: ChildId) -> Result<()> {
        let child = self.pool.get(id)?;
        if !child.paused || !child.is_live() || self.pool.is_frontier(id) {
            return Ok(());
        }

        if self.process_async_manifest(id)? {
            return Ok(());
        }

        if self.pause.active == Some(id) {
            if self.pause.mode == PauseMode::Arriving {
                self.send_active_child_to_pause_point()?;
            }
            return Ok(());
        }

        let frontier = ExecutionPoint::checkpoint(self.last_flush_checkpoint);
        if self.pool.get(id)?.last_pause_point < frontier {
            self.maybe_reach_point(id, &frontier, None)?;
        }
        Ok(())
    }

    /// Continue or claim async work for `id`; true if a manifest was sent
    fn process_async_manifest(&mut self, id: ChildId) -> Result<bool> {
        let is_active = self.pause.active == Some(id);
        let child = self.pool.get_mut(id)?;
        if let Some(manifest) = child.async_manifest.take() {
            if search::should_skip(&manifest.task, &self.caches, &self.pool) {
                debug!("Dropping stale async manifest on child {}", id);
            } else if is_active && !manifest.runs_anywhere_on(self.pool.get(id)?) {
                debug!("Child {} became active, requeueing its async manifest", id);
                self.worklist.push(manifest);
            } else {
                return self.run_async_manifest(id, manifest);
            }
        }

        let picked = match self.pick_async_manifest(id, false)? {
            Some(manifest) => Some(manifest),
            None => self.pick_async_manifest(id, true)?,
        };
        match picked {
            Some(manifest) => self.run_async_manifest(id, manifest),
            None => Ok(false),
        }
    }

    fn pick_async_manifest(&mut self, id: ChildId, low_priority: bool) -> Result<Option<AsyncManifest>> {
        let Self {
            pool,
            worklist,
            caches,
            checkpoints,
            pause,
            ..
        } = self;
        let (pool, caches, checkpoints) = (&*pool, &*caches, &*checkpoints);
        let child = pool.get(id)?;
        let is_active = pause.active == Some(id);
        let now = Instant::now();
        Ok(worklist.pick(
            child,
            is_active,
            low_priority,
            |task| search::should_skip(task, caches, pool),
            |point| child.time_to_reach_point(point, checkpoints, now),
        ))
    }

    /// Move `id` to the manifest's point, then run it; true if a manifest was sent
    fn run_async_manifest(&mut self, id: ChildId, manifest: AsyncManifest) -> Result<bool> {
        if !manifest.runs_anywhere_on(self.pool.get(id)?) {
            if let Some(point) = manifest.point.clone() {
                if self.maybe_reach_point(id, &point, manifest.snapshot.as_ref())? == Reach::Pending {
                    self.pool.get_mut(id)?.async_manifest = Some(manifest);
                    return Ok(true);
                }
            }
        }

        let contents = self.task_contents(&manifest.task)?;
        let expected_duration = manifest.expected_duration;
        self.send_manifest(
            id,
            Manifest {
                contents,
                completion: Completion::Task(manifest),
                destination: None,
                expected_duration,
            },
        )?;
        Ok(true)
    }

    /// The current frontier child id
    fn frontier(&self) -> Result<ChildId> {
        self.pool.frontier_id()
    }

    fn debugger(&mut self) -> Option<&mut (dyn DebuggerHooks + 'static)> {
        self.debugger.as_deref_mut()
    }
}
