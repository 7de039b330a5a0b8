//! Deterministic in-memory engine
//!
//! Children "execute" a [`SimulatedRecording`] instantly: a manifest's
//! response is computed when it is sent and held until the caller collects
//! it with [`SimulatedEngine::take_finished`] or a blocking wait. A resumed
//! recording child with no breakpoint ahead keeps running until it is
//! forced to pause, at which point it has recorded the whole recording.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::checkpoint::{CheckpointId, RecordedEvent, FIRST_CHECKPOINT_ID};
use crate::child::ChildId;
use crate::manifest::{ManifestContents, ManifestResponse, ManifestResult, ReachedCheckpoint};
use crate::point::{ExecutionPoint, Position, PositionKind};
use crate::{Result, RewindError};

use super::{DebuggerHooks, HostMessage, HostMessenger, ReplayEngine, WaitOutcome};

/// The execution a simulated engine replays
#[derive(Debug, Clone)]
pub struct SimulatedRecording {
    /// Last checkpoint of the recording
    pub checkpoints: CheckpointId,
    /// Execution time between consecutive checkpoints
    pub checkpoint_duration_ms: u64,
    /// Every positioned point that executes, ascending
    pub points: Vec<ExecutionPoint>,
    /// Debugger statements, ascending
    pub debugger_statements: Vec<ExecutionPoint>,
    /// Recorded events
    pub events: Vec<RecordedEvent>,
    /// Scripts created when the frontier first reaches a checkpoint
    pub scripts: Vec<(CheckpointId, Value)>,
}

impl SimulatedRecording {
    /// A recording of `checkpoints` evenly spaced checkpoints
    #[must_use]
    pub fn new(checkpoints: CheckpointId, checkpoint_duration_ms: u64) -> Self {
        Self {
            checkpoints: checkpoints.max(FIRST_CHECKPOINT_ID),
            checkpoint_duration_ms,
            points: Vec::new(),
            debugger_statements: Vec::new(),
            events: Vec::new(),
            scripts: Vec::new(),
        }
    }

    /// Add executed points
    #[must_use]
    pub fn with_points(mut self, points: impl IntoIterator<Item = ExecutionPoint>) -> Self {
        self.points.extend(points);
        self.points.sort();
        self
    }

    /// Add a debugger statement (also an executed point)
    #[must_use]
    pub fn with_debugger_statement(mut self, point: ExecutionPoint) -> Self {
        self.debugger_statements.push(point.clone());
        self.debugger_statements.sort();
        self.with_points([point])
    }

    /// Add a recorded event
    #[must_use]
    pub fn with_event(mut self, name: &str, point: ExecutionPoint) -> Self {
        self.events.push(RecordedEvent {
            name: name.to_string(),
            point,
        });
        self
    }

    /// Add a script created at a checkpoint
    #[must_use]
    pub fn with_script(mut self, checkpoint: CheckpointId, script: Value) -> Self {
        self.scripts.push((checkpoint, script));
        self
    }

    fn end(&self) -> ExecutionPoint {
        ExecutionPoint::checkpoint(self.checkpoints)
    }

    fn in_region(point: &ExecutionPoint, start: CheckpointId, end: CheckpointId) -> bool {
        point.checkpoint >= start && point.checkpoint < end
    }

    fn hits_in(&self, start: CheckpointId, end: CheckpointId, position: &Position) -> Vec<ExecutionPoint> {
        self.points
            .iter()
            .filter(|point| Self::in_region(point, start, end) && point.hit_by(position))
            .cloned()
            .collect()
    }

    fn next_hit(&self, from: &ExecutionPoint, breakpoints: &[Position]) -> Option<ExecutionPoint> {
        self.points
            .iter()
            .find(|point| {
                *point > from
                    && (breakpoints.iter().any(|bp| point.hit_by(bp))
                        || self.debugger_statements.contains(point))
            })
            .cloned()
    }

    fn frame_steps(&self, at: &ExecutionPoint) -> Vec<ExecutionPoint> {
        let Some(frame) = at.frame_index() else {
            return Vec::new();
        };
        self.points
            .iter()
            .filter(|point| point.checkpoint == at.checkpoint)
            .filter(|point| {
                let position = point.position.as_ref();
                let depth = point.frame_index();
                depth == Some(frame)
                    || (depth == Some(frame + 1)
                        && position.is_some_and(|p| p.kind == PositionKind::EnterFrame))
            })
            .cloned()
            .collect()
    }

    fn parent_entry(&self, at: &ExecutionPoint) -> Option<ExecutionPoint> {
        let frame = at.frame_index()?.checked_sub(1)?;
        self.points
            .iter()
            .rev()
            .find(|point| {
                *point < at
                    && point.frame_index() == Some(frame)
                    && point
                        .position
                        .as_ref()
                        .is_some_and(|p| p.kind == PositionKind::EnterFrame)
            })
            .cloned()
    }

    fn event_entry(&self, event_point: &ExecutionPoint) -> Option<ExecutionPoint> {
        self.points
            .iter()
            .find(|point| {
                *point > event_point
                    && point
                        .position
                        .as_ref()
                        .is_some_and(|p| p.kind == PositionKind::EnterFrame)
            })
            .cloned()
    }
}

#[derive(Debug)]
enum Pending {
    Ready(ManifestResponse),
    Running,
}

#[derive(Debug)]
struct SimChild {
    point: ExecutionPoint,
    snapshots: Vec<ExecutionPoint>,
    pending: Option<Pending>,
    crashed: bool,
    frontier: bool,
    recording: bool,
    reported: CheckpointId,
}

impl SimChild {
    fn new(recording: bool) -> Self {
        Self {
            point: ExecutionPoint::start(),
            snapshots: if recording {
                Vec::new()
            } else {
                vec![ExecutionPoint::start()]
            },
            pending: None,
            crashed: false,
            frontier: recording,
            recording,
            reported: FIRST_CHECKPOINT_ID,
        }
    }
}

#[derive(Debug)]
struct SimState {
    recording: SimulatedRecording,
    children: BTreeMap<ChildId, SimChild>,
    next_id: ChildId,
    can_rewind: bool,
    stress_mode: bool,
    restore_next_request: bool,
    crash_next_request: bool,
    sent: Vec<(ChildId, ManifestContents)>,
    repaints: usize,
}

/// Engine replaying a [`SimulatedRecording`]; clones share state
#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedEngine {
    /// Create an engine with no children
    #[must_use]
    pub fn new(recording: SimulatedRecording) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                recording,
                children: BTreeMap::new(),
                next_id: 0,
                can_rewind: true,
                stress_mode: false,
                restore_next_request: false,
                crash_next_request: false,
                sent: Vec::new(),
                repaints: 0,
            })),
        }
    }

    /// Toggle rewinding support
    pub fn set_can_rewind(&self, can_rewind: bool) {
        self.state.lock().can_rewind = can_rewind;
    }

    /// Toggle repaint stress mode
    pub fn set_stress_mode(&self, stress_mode: bool) {
        self.state.lock().stress_mode = stress_mode;
    }

    /// Start the recording child
    pub fn spawn_recording_child(&self) -> ChildId {
        self.spawn(true)
    }

    fn spawn(&self, recording: bool) -> ChildId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.children.insert(id, SimChild::new(recording));
        id
    }

    /// Kill a child; its pending response is lost
    pub fn crash(&self, child: ChildId) {
        if let Some(sim) = self.state.lock().children.get_mut(&child) {
            sim.crashed = true;
            sim.pending = None;
        }
    }

    /// Make the next debugger request restore a snapshot mid-request
    pub fn restore_on_next_request(&self) {
        self.state.lock().restore_next_request = true;
    }

    /// Make the child receiving the next debugger request die while
    /// servicing it
    pub fn crash_on_next_request(&self) {
        self.state.lock().crash_next_request = true;
    }

    /// Collect one finished manifest, lowest child id first
    pub fn take_finished(&self) -> Option<(ChildId, ManifestResponse)> {
        let mut state = self.state.lock();
        state.children.iter_mut().find_map(|(id, sim)| {
            if sim.crashed || !matches!(sim.pending, Some(Pending::Ready(_))) {
                return None;
            }
            match sim.pending.take() {
                Some(Pending::Ready(response)) => Some((*id, response)),
                _ => None,
            }
        })
    }

    /// Every manifest sent so far
    #[must_use]
    pub fn sent(&self) -> Vec<(ChildId, ManifestContents)> {
        self.state.lock().sent.clone()
    }

    /// Number of manifests of `kind` sent so far
    #[must_use]
    pub fn count_sent(&self, kind: &str) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(_, contents)| contents.kind() == kind)
            .count()
    }

    /// Number of repaints requested
    #[must_use]
    pub fn repaints(&self) -> usize {
        self.state.lock().repaints
    }
}

impl SimState {
    fn report(&mut self, child: ChildId, to: CheckpointId, response: &mut ManifestResponse) {
        let duration_ms = self.recording.checkpoint_duration_ms;
        let Some(sim) = self.children.get_mut(&child) else {
            return;
        };
        if !sim.frontier {
            return;
        }
        for checkpoint in sim.reported + 1..=to {
            response.checkpoints.push(ReachedCheckpoint {
                checkpoint,
                duration_ms,
            });
            response.new_scripts.extend(
                self.recording
                    .scripts
                    .iter()
                    .filter(|(at, _)| *at == checkpoint)
                    .map(|(_, script)| script.clone()),
            );
        }
        sim.reported = sim.reported.max(to);
    }

    fn respond_at_end(&mut self, child: ChildId, hit_endpoint: bool) -> ManifestResponse {
        let end = self.recording.end();
        let mut response = ManifestResponse::at(end.clone());
        response.hit_endpoint = hit_endpoint;
        self.report(child, end.checkpoint, &mut response);
        if let Some(sim) = self.children.get_mut(&child) {
            sim.point = end;
        }
        response
    }

    fn execute(&mut self, child: ChildId, contents: &ManifestContents) -> Result<Pending> {
        let recording = self.recording.clone();
        let restore_request = self.restore_next_request;
        let sim = self
            .children
            .get_mut(&child)
            .ok_or(RewindError::UnknownChild(child))?;
        if sim.crashed {
            return Err(RewindError::Engine(format!("child {child} has crashed")));
        }

        let here = sim.point.clone();
        let response = match contents {
            ManifestContents::RunToPoint {
                target,
                snapshot_points,
            } => {
                sim.snapshots.extend(snapshot_points.iter().cloned());
                sim.point = target.clone();
                ManifestResponse::at(target.clone())
            }
            ManifestContents::RestoreSnapshot { num_snapshots } => {
                let keep = sim.snapshots.len().saturating_sub(*num_snapshots).max(1);
                sim.snapshots.truncate(keep);
                sim.point = sim
                    .snapshots
                    .last()
                    .cloned()
                    .unwrap_or_else(ExecutionPoint::start);
                ManifestResponse::at(sim.point.clone())
            }
            ManifestContents::Resume {
                forward,
                breakpoints,
            } => {
                if !forward {
                    sim.point = ExecutionPoint::start();
                    return Ok(Pending::Ready(ManifestResponse::at(sim.point.clone())));
                }
                let is_recording = sim.recording;
                match recording.next_hit(&here, breakpoints) {
                    Some(hit) => {
                        sim.point = hit.clone();
                        let mut response = ManifestResponse::at(hit.clone());
                        self.report(child, hit.checkpoint, &mut response);
                        response
                    }
                    None if is_recording => return Ok(Pending::Running),
                    None => self.respond_at_end(child, true),
                }
            }
            ManifestContents::SetMainChild => {
                sim.frontier = true;
                ManifestResponse::at(here)
            }
            ManifestContents::FlushRecording => {
                let mut response = ManifestResponse::at(here.clone());
                self.report(child, here.checkpoint, &mut response);
                response
            }
            ManifestContents::ScanRecording {
                checkpoint,
                end_checkpoint,
            } => {
                sim.point = ExecutionPoint::checkpoint(*end_checkpoint);
                let in_region = |point: &ExecutionPoint| {
                    SimulatedRecording::in_region(point, *checkpoint, *end_checkpoint)
                };
                ManifestResponse::at(sim.point.clone()).with_result(ManifestResult::Scan {
                    debugger_statements: recording
                        .debugger_statements
                        .iter()
                        .filter(|&point| in_region(point))
                        .cloned()
                        .collect(),
                    events: recording
                        .events
                        .iter()
                        .filter(|event| in_region(&event.point))
                        .cloned()
                        .collect(),
                })
            }
            ManifestContents::FindHits {
                checkpoint,
                end_checkpoint,
                position,
            } => ManifestResponse::at(here).with_result(ManifestResult::Points(
                recording.hits_in(*checkpoint, *end_checkpoint, position),
            )),
            ManifestContents::FindFrameSteps { point } => ManifestResponse::at(here)
                .with_result(ManifestResult::Points(recording.frame_steps(point))),
            ManifestContents::FindParentFrameEntryPoint { point } => ManifestResponse::at(here)
                .with_result(ManifestResult::Point(recording.parent_entry(point))),
            ManifestContents::FindEventFrameEntry { point, .. } => ManifestResponse::at(here)
                .with_result(ManifestResult::Point(recording.event_entry(point))),
            ManifestContents::DebuggerRequest { request } => {
                if restore_request {
                    self.restore_next_request = false;
                    let sim = self
                        .children
                        .get_mut(&child)
                        .ok_or(RewindError::UnknownChild(child))?;
                    sim.point = sim
                        .snapshots
                        .last()
                        .cloned()
                        .unwrap_or_else(ExecutionPoint::start);
                    let mut response = ManifestResponse::at(sim.point.clone());
                    response.restored_snapshot = true;
                    return Ok(Pending::Ready(response));
                }
                ManifestResponse::at(here.clone()).with_result(ManifestResult::Value(
                    json!({ "request": request, "point": here }),
                ))
            }
            ManifestContents::BatchDebuggerRequest { requests } => ManifestResponse::at(here)
                .with_result(ManifestResult::Value(Value::from(requests.len()))),
            ManifestContents::GetPauseData => ManifestResponse::at(here.clone())
                .with_result(ManifestResult::Value(json!({ "point": here }))),
            ManifestContents::HitLogpoint { text, .. } => ManifestResponse::at(here)
                .with_result(ManifestResult::Value(Value::String(text.clone()))),
        };
        Ok(Pending::Ready(response))
    }
}

impl ReplayEngine for SimulatedEngine {
    fn send_manifest(&mut self, child: ChildId, contents: &ManifestContents) -> Result<()> {
        let mut state = self.state.lock();
        if state.crash_next_request && matches!(contents, ManifestContents::DebuggerRequest { .. }) {
            state.crash_next_request = false;
            state.sent.push((child, contents.clone()));
            if let Some(sim) = state.children.get_mut(&child) {
                sim.crashed = true;
                sim.pending = None;
            }
            return Ok(());
        }
        let pending = state.execute(child, contents)?;
        state.sent.push((child, contents.clone()));
        if let Some(sim) = state.children.get_mut(&child) {
            sim.pending = Some(pending);
        }
        Ok(())
    }

    fn wait_until_paused(&mut self, child: ChildId, force_checkpoint: bool) -> Result<WaitOutcome> {
        let mut state = self.state.lock();
        let sim = state
            .children
            .get_mut(&child)
            .ok_or(RewindError::UnknownChild(child))?;
        if sim.crashed {
            return Ok(WaitOutcome::Crashed);
        }
        match sim.pending.take() {
            None => Ok(WaitOutcome::AlreadyPaused),
            Some(Pending::Ready(response)) => Ok(WaitOutcome::Finished(response)),
            Some(Pending::Running) if force_checkpoint => {
                Ok(WaitOutcome::Finished(state.respond_at_end(child, false)))
            }
            Some(Pending::Running) => {
                sim.pending = Some(Pending::Running);
                Err(RewindError::Engine(format!(
                    "child {child} is running and would never pause"
                )))
            }
        }
    }

    fn spawn_replaying_child(&mut self) -> Result<ChildId> {
        Ok(self.spawn(false))
    }

    fn can_rewind(&self) -> bool {
        self.state.lock().can_rewind
    }

    fn on_repaint(&mut self) {
        self.state.lock().repaints += 1;
    }

    fn clear_graphics(&mut self) {}

    fn restore_main_graphics(&mut self) {}

    fn in_repaint_stress_mode(&self) -> bool {
        self.state.lock().stress_mode
    }
}

/// Host or debugger traffic observed by an [`EventLog`]
#[derive(Debug, Clone, PartialEq)]
pub enum LoggedEvent {
    /// Host notification
    Host(HostMessage),
    /// `onPause`
    Pause(ExecutionPoint),
    /// `onPositionChange`
    PositionChange(ExecutionPoint),
    /// `onNewConsoleMessage`
    ConsoleMessage(ExecutionPoint, Value),
    /// `onNewScript`
    NewScript(Value),
    /// `onHitRecordingBoundary`
    HitBoundary,
}

/// Records everything sent to the host and the debugger; clones share state
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<LoggedEvent>>>,
}

impl EventLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything logged so far
    #[must_use]
    pub fn events(&self) -> Vec<LoggedEvent> {
        self.events.lock().clone()
    }

    fn push(&self, event: LoggedEvent) {
        self.events.lock().push(event);
    }
}

impl HostMessenger for EventLog {
    fn send(&mut self, message: HostMessage) {
        self.push(LoggedEvent::Host(message));
    }
}

impl DebuggerHooks for EventLog {
    fn on_pause(&mut self, point: &ExecutionPoint) {
        self.push(LoggedEvent::Pause(point.clone()));
    }

    fn on_position_change(&mut self, point: &ExecutionPoint) {
        self.push(LoggedEvent::PositionChange(point.clone()));
    }

    fn on_new_console_message(&mut self, point: &ExecutionPoint, message: &Value) {
        self.push(LoggedEvent::ConsoleMessage(point.clone(), message.clone()));
    }

    fn on_new_script(&mut self, script: &Value) {
        self.push(LoggedEvent::NewScript(script.clone()));
    }

    fn on_hit_recording_boundary(&mut self) {
        self.push(LoggedEvent::HitBoundary);
    }
}
