//! Session lifecycle and the debugger-facing surface

use serde_json::Value;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointId, RecordedEvent};
use crate::child::{ChildId, ChildProcess, InFlight};
use crate::engine::{DebuggerHooks, HostMessage};
use crate::error::ensure;
use crate::manifest::{
    AsyncManifest, AsyncTask, AsyncWorklist, Completion, Manifest, ManifestContents,
    ManifestResult,
};
use crate::point::{ExecutionPoint, Position};
use crate::{Result, RewindError};

use super::{Controller, Logpoint, Lookup, PauseMode};

/// Answer to a debugger request at the pause point
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    /// The child's reply, `Null` after an unhandled divergence
    pub value: Value,
    /// The child had to restore a snapshot; the request had no effect
    pub unhandled_divergence: bool,
}

impl Controller {
    /// Create the children and start the frontier running
    ///
    /// Record mode adopts `recording_child` as the frontier. Replay mode
    /// spawns a replaying child and promotes it with `setMainChild`.
    ///
    /// # Errors
    ///
    /// Returns error on a second call, a missing recording child in record
    /// mode, or a spawn failure
    pub fn initialize(&mut self, recording_child: Option<ChildId>) -> Result<()> {
        ensure(self.pool.frontier_id().is_err(), || {
            "session initialized twice".to_string()
        })?;

        let frontier = if self.config.mode.is_record() {
            let id = recording_child.ok_or_else(|| {
                RewindError::ConfigError("record mode needs a recording child".to_string())
            })?;
            self.pool.add(ChildProcess::recording(id));
            id
        } else {
            let id = self.engine.spawn_replaying_child()?;
            self.pool.add(ChildProcess::replaying(id));
            id
        };
        self.pool.set_frontier(frontier)?;

        for _ in 0..self.config.replaying_children {
            let id = self.engine.spawn_replaying_child()?;
            self.pool.add(ChildProcess::replaying(id));
        }
        info!(
            "Session started in {:?} mode: frontier {}, {} replaying children",
            self.config.mode, frontier, self.config.replaying_children
        );

        if self.config.mode.is_replay() {
            self.send_manifest(
                frontier,
                Manifest::new(ManifestContents::SetMainChild, Completion::MainChild),
            )
        } else {
            self.resume_frontier()
        }
    }

    /// Attach the debugger front end
    pub fn connect_debugger(&mut self, debugger: Box<dyn DebuggerHooks>) {
        self.debugger = Some(debugger);
    }

    /// Recover from a replaying child crash
    ///
    /// The crashed child is replaced by a fresh one that inherits its saved
    /// checkpoints. Its work is requeued and its scans are redone.
    ///
    /// A frontier crash is never recovered, even while the frontier is idle:
    /// it is the only process holding the unflushed tail of the recording,
    /// and nothing else can take over its role.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the frontier crashed, the child was
    /// servicing a debugger request, or the crash budget is spent
    pub fn child_crashed(&mut self, id: ChildId) -> Result<()> {
        if self.pool.get(id)?.crashed {
            return Ok(());
        }
        if self.pool.is_frontier(id) {
            return Err(RewindError::FrontierCrashed(id));
        }
        if self.servicing_request == Some(id) {
            self.servicing_request = None;
            return Err(RewindError::RequestCrashed(id));
        }
        self.crashes += 1;
        if self.crashes > self.config.crash_budget {
            return Err(RewindError::CrashBudgetExceeded {
                crashes: self.crashes,
                limit: self.config.crash_budget,
            });
        }
        warn!(
            "Child {} crashed ({} of {} allowed)",
            id, self.crashes, self.config.crash_budget
        );

        let child = self.pool.get_mut(id)?;
        child.crashed = true;
        let in_flight = child.take_in_flight();
        let traveling = child.async_manifest.take();
        let saved = std::mem::take(&mut child.saved_checkpoints);
        let mut lost_scans: Vec<CheckpointId> = child.scanned.iter().copied().collect();

        let replacement = self.engine.spawn_replaying_child()?;
        let mut fresh = ChildProcess::replaying(replacement);
        fresh.saved_checkpoints.clone_from(&saved);
        self.pool.add(fresh);
        for &checkpoint in &saved {
            self.checkpoints.entry(checkpoint)?.owner = Some(replacement);
        }
        info!(
            "Child {} replaces {} with {} saved checkpoints",
            replacement,
            id,
            saved.len()
        );

        let lost_tasks = in_flight
            .and_then(|InFlight { manifest, .. }| match manifest.completion {
                Completion::Task(task) => Some(task),
                _ => None,
            })
            .into_iter()
            .chain(traveling);
        for task in lost_tasks {
            requeue_lost(&mut self.worklist, &mut lost_scans, task);
        }
        self.worklist.release_owner(id);
        self.forget_scans(&lost_scans)?;

        let rebind = self.pause.active == Some(id)
            && matches!(self.pause.mode, PauseMode::Arriving | PauseMode::Paused);
        if rebind {
            let point = self.pause.point.clone();
            let active = self.nearest_child(&point)?;
            info!("Child {} takes over the pause point", active);
            self.pause.active = Some(active);
            self.transition(PauseMode::Arriving)?;
            self.send_active_child_to_pause_point()?;
        }
        self.poke_children()
    }

    /// Stop the frontier and flush before the host saves the recording
    ///
    /// # Errors
    ///
    /// Returns error if the frontier cannot be stopped or flushed
    pub fn before_save_recording(&mut self) -> Result<()> {
        self.resume_after_save = self.pause.mode == PauseMode::Running;
        if self.resume_after_save {
            self.interrupt_frontier()
        } else {
            self.flush_recording()
        }
    }

    /// Notify the host and let the frontier run again if it was running
    ///
    /// # Errors
    ///
    /// Returns error if the frontier cannot be resumed
    pub fn after_save_recording(&mut self) -> Result<()> {
        self.host.send(HostMessage::SaveRecordingFinished);
        if std::mem::take(&mut self.resume_after_save) && self.pause.mode == PauseMode::Running {
            self.resume_frontier()?;
        }
        Ok(())
    }

    /// The current pause point
    #[must_use]
    pub fn pause_point(&self) -> &ExecutionPoint {
        &self.pause.point
    }

    /// Where the frontier hit the end of the recording, once known
    #[must_use]
    pub fn recording_endpoint(&self) -> Option<&ExecutionPoint> {
        self.recording_endpoint.as_ref()
    }

    /// Whether the pause point is a known debugger statement
    #[must_use]
    pub fn paused_at_debugger_statement(&self) -> bool {
        if self.pause.mode != PauseMode::Paused {
            return false;
        }
        let region = self.checkpoints.saved_checkpoint(self.pause.point.checkpoint);
        self.checkpoints
            .get(region)
            .is_ok_and(|info| info.debugger_statements.contains(&self.pause.point))
    }

    /// Points with collected pause data, ascending
    #[must_use]
    pub fn cached_points(&self) -> Vec<ExecutionPoint> {
        let mut points: Vec<ExecutionPoint> = self.caches.pause_data.keys().cloned().collect();
        points.sort();
        points
    }

    /// Collected pause data at `point`
    #[must_use]
    pub fn pause_data(&self, point: &ExecutionPoint) -> Option<&Value> {
        self.caches.pause_data.get(point)
    }

    /// Requests answered at the current pause point
    #[must_use]
    pub fn debugger_requests(&self) -> &[Value] {
        &self.debugger_requests
    }

    /// Installed breakpoints
    #[must_use]
    pub fn breakpoints(&self) -> &[Position] {
        &self.breakpoints
    }

    /// Installed logpoints
    #[must_use]
    pub fn logpoints(&self) -> &[Logpoint] {
        &self.logpoints
    }

    /// Install a breakpoint and start searching flushed regions for it
    ///
    /// A resume search already under way keeps the breakpoints it started
    /// with.
    ///
    /// # Errors
    ///
    /// Returns error if the frontier cannot be restarted or a search
    /// cannot be queued
    pub fn add_breakpoint(&mut self, position: Position) -> Result<()> {
        if self.breakpoints.contains(&position) {
            return Ok(());
        }
        self.breakpoints.push(position.clone());
        self.reinstall_frontier_breakpoints()?;

        if position.kind.is_script_breakpoint() {
            for region in self.flushed_regions() {
                self.find_hits(region, &position)?;
            }
        }
        if matches!(self.pause.mode, PauseMode::Paused | PauseMode::Arriving) {
            let point = self.pause.point.clone();
            self.prefetch(&point);
        }
        self.poke_children()
    }

    /// Remove every breakpoint
    ///
    /// # Errors
    ///
    /// Returns error if the frontier cannot be restarted
    pub fn clear_breakpoints(&mut self) -> Result<()> {
        self.breakpoints.clear();
        self.reinstall_frontier_breakpoints()
    }

    /// Restart a live frontier so it stops at the current breakpoints
    fn reinstall_frontier_breakpoints(&mut self) -> Result<()> {
        if self.pause.mode != PauseMode::Running || self.pool.frontier_id().is_err() {
            return Ok(());
        }
        self.interrupt_frontier()?;
        if self.pause.mode == PauseMode::Running {
            self.resume_frontier()?;
        }
        Ok(())
    }

    /// Send a debugger request to the child at the pause point
    ///
    /// The child diverges from the recording afterwards. If it has to
    /// restore a snapshot instead, the pause point is re-established and
    /// the outcome reports an unhandled divergence.
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::NotPaused`] unless paused or arriving, and a
    /// fatal error if the child crashes meanwhile
    pub fn send_request(&mut self, request: Value) -> Result<RequestOutcome> {
        if self.pause.mode == PauseMode::Arriving {
            self.ensure_arrived()?;
        }
        if self.pause.mode != PauseMode::Paused {
            return Err(RewindError::NotPaused);
        }
        let id = self.pause.active.ok_or(RewindError::NotPaused)?;

        self.servicing_request = Some(id);
        let outcome = self.service_request(id, request);
        self.servicing_request = None;
        outcome
    }

    fn service_request(&mut self, id: ChildId, request: Value) -> Result<RequestOutcome> {
        if !self.pool.get(id)?.paused {
            self.wait_until_paused(id, false)?;
        }
        let value = self.request_on(id, request.clone())?;
        let Some(value) = value else {
            warn!("Child {} restored a snapshot servicing a request", id);
            self.pool.get_mut(id)?.diverged = false;
            self.transition(PauseMode::Arriving)?;
            self.send_active_child_to_pause_point()?;
            self.ensure_arrived()?;
            return Ok(RequestOutcome {
                value: Value::Null,
                unhandled_divergence: true,
            });
        };

        if !self.pool.is_frontier(id) {
            self.pool.get_mut(id)?.diverged = true;
        }
        self.debugger_requests.push(request);
        if self.engine.in_repaint_stress_mode() {
            self.engine.on_repaint();
        }
        Ok(RequestOutcome {
            value,
            unhandled_divergence: false,
        })
    }

    /// Run one request on a paused child; `None` if it restored a snapshot
    fn request_on(&mut self, id: ChildId, request: Value) -> Result<Option<Value>> {
        self.send_manifest(
            id,
            Manifest::new(
                ManifestContents::DebuggerRequest { request },
                Completion::DebuggerRequest,
            ),
        )?;
        self.wait_until_paused(id, false)?;
        let response = self
            .request_response
            .take()
            .ok_or_else(|| RewindError::invariant(format!("child {id} answered no request")))?;
        if response.restored_snapshot {
            return Ok(None);
        }
        Ok(Some(match response.result {
            ManifestResult::Value(value) => value,
            _ => Value::Null,
        }))
    }

    /// Send a request to the frontier child wherever it is
    ///
    /// A running frontier is stopped at its next checkpoint and resumed
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns error if the frontier cannot be stopped or answers nothing
    pub fn send_request_main_child(&mut self, request: Value) -> Result<Value> {
        let frontier = self.frontier()?;
        let was_running = self.pause.mode == PauseMode::Running;
        if !self.pool.get(frontier)?.paused {
            self.wait_until_paused(frontier, true)?;
        }
        let value = self.request_on(frontier, request)?.unwrap_or(Value::Null);
        if was_running && self.pause.mode == PauseMode::Running {
            self.resume_frontier()?;
        }
        Ok(value)
    }

    /// Install a logpoint and evaluate it at every hit already known
    ///
    /// # Errors
    ///
    /// Returns error if hit searches cannot be queued
    pub fn add_logpoint(
        &mut self,
        position: Position,
        text: String,
        condition: Option<String>,
    ) -> Result<()> {
        let index = self.logpoints.len();
        self.logpoints.push(Logpoint {
            position: position.clone(),
            text,
            condition,
        });
        if position.kind.is_script_breakpoint() {
            for region in self.flushed_regions() {
                if let Lookup::Ready(hits) = self.find_hits(region, &position)? {
                    self.queue_logpoint_hits(index, &hits);
                }
            }
        }
        self.poke_children()
    }

    /// Replace the event names whose handlers resume searches stop at
    ///
    /// # Errors
    ///
    /// Returns error if handler searches cannot be queued
    pub fn set_event_triggers(&mut self, names: Vec<String>) -> Result<()> {
        self.event_triggers = names;
        let events: Vec<RecordedEvent> = self
            .flushed_regions()
            .into_iter()
            .filter(|&region| self.pool.region_scanned(region))
            .filter_map(|region| self.checkpoints.get(region).ok())
            .flat_map(|info| info.events.iter())
            .filter(|event| self.event_triggers.contains(&event.name))
            .cloned()
            .collect();
        for event in events {
            self.find_event_frame_entry(&event)?;
        }
        self.poke_children()
    }

    /// Move a pause on the frontier onto a replaying child
    ///
    /// Returns whether a switch happened.
    ///
    /// # Errors
    ///
    /// Returns error if the frontier cannot be moved off the pause point
    pub fn maybe_switch_to_replaying_child(&mut self) -> Result<bool> {
        let frontier = self.frontier()?;
        if self.pause.mode != PauseMode::Paused
            || self.pause.active != Some(frontier)
            || !self.engine.can_rewind()
        {
            return Ok(false);
        }
        let point = self.pause.point.clone();
        self.leave_frontier()?;
        self.arrive_at(point)?;
        Ok(true)
    }
}

/// Put a crashed child's task back on the worklist; scans are redone
/// through their region instead
fn requeue_lost(
    worklist: &mut AsyncWorklist,
    lost_scans: &mut Vec<CheckpointId>,
    manifest: AsyncManifest,
) {
    match manifest.task {
        AsyncTask::Scan { checkpoint } => lost_scans.push(checkpoint),
        _ => worklist.push(manifest),
    }
}
