//! Pause state machine and the frontier child
//!
//! ```text
//! RUNNING ──pause──▶ ARRIVING ──arrived──▶ PAUSED ──resume──▶ RESUMING_*
//!    ▲                  ▲  ▲                                     │
//!    └──forward search──┼──┴──────────── hit found ──────────────┘
//!       exhausted       └── time warp (any state)
//! ```

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use crate::checkpoint::{CheckpointId, CheckpointRegistry, RecordedEvent, FIRST_CHECKPOINT_ID};
use crate::child::ChildId;
use crate::engine::HostMessage;
use crate::error::ensure;
use crate::manifest::{Completion, Manifest, ManifestContents, ManifestResponse};
use crate::point::{ExecutionPoint, Position};
use crate::{Result, RewindError};

use super::{Controller, Lookup, Reach};

/// Blocking waits allowed while forcing the active child to arrive
const MAX_ARRIVAL_WAITS: usize = 256;

/// Where the user-visible execution is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseMode {
    /// The frontier child is executing live
    Running,
    /// The active child sits at the pause point
    Paused,
    /// The active child is traveling to the pause point
    Arriving,
    /// Searching forward for the next hit; no active child
    ResumingForward,
    /// Searching backward for the previous hit; no active child
    ResumingBackward,
}

impl PauseMode {
    /// Whether the state machine may move from `self` to `to`
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        use PauseMode::{Arriving, Paused, ResumingBackward, ResumingForward, Running};
        matches!(
            (self, to),
            (Running, Arriving | Paused)
                | (Paused, Arriving | Running | ResumingForward | ResumingBackward)
                | (Arriving, Arriving | Paused)
                | (ResumingForward, Arriving | Running)
                | (ResumingBackward, Arriving)
        )
    }
}

impl fmt::Display for PauseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Arriving => "ARRIVING",
            Self::ResumingForward => "RESUMING_FORWARD",
            Self::ResumingBackward => "RESUMING_BACKWARD",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(super) struct PauseState {
    pub(super) mode: PauseMode,
    pub(super) point: ExecutionPoint,
    pub(super) active: Option<ChildId>,
}

impl PauseState {
    pub(super) fn new() -> Self {
        Self {
            mode: PauseMode::Running,
            point: ExecutionPoint::start(),
            active: None,
        }
    }
}

/// A directional search for the next breakpoint hit, one saved region at
/// a time
#[derive(Debug, Clone)]
pub struct ResumeSearch {
    origin: ExecutionPoint,
    forward: bool,
    breakpoints: Vec<Position>,
    region: CheckpointId,
    first: bool,
}

impl ResumeSearch {
    /// Search from `origin`, starting with the saved region containing it
    #[must_use]
    pub fn new(
        origin: ExecutionPoint,
        forward: bool,
        breakpoints: Vec<Position>,
        checkpoints: &CheckpointRegistry,
    ) -> Self {
        let region = checkpoints.saved_checkpoint(origin.checkpoint);
        Self {
            origin,
            forward,
            breakpoints,
            region,
            first: true,
        }
    }

    /// Region currently searched
    #[must_use]
    pub fn region(&self) -> CheckpointId {
        self.region
    }

    /// The nearest candidate strictly past the origin in the search direction
    fn nearest(&self, candidates: Vec<ExecutionPoint>) -> Option<ExecutionPoint> {
        let origin = &self.origin;
        if self.forward {
            candidates.into_iter().filter(|point| point > origin).min()
        } else {
            candidates.into_iter().filter(|point| point < origin).max()
        }
    }
}

/// Outcome of polling a [`ResumeSearch`]
#[derive(Debug, Clone, PartialEq)]
pub enum SearchStep {
    /// Waiting on scans or hit searches
    Pending,
    /// The next point to pause at
    Found(ExecutionPoint),
    /// The search ran off the flushed recording or its start
    Exhausted,
}

impl Controller {
    /// Current pause mode
    #[must_use]
    pub fn pause_mode(&self) -> PauseMode {
        self.pause.mode
    }

    /// Child bound to the pause point, if any
    #[must_use]
    pub fn active_child(&self) -> Option<ChildId> {
        self.pause.active
    }

    pub(super) fn transition(&mut self, to: PauseMode) -> Result<()> {
        let from = self.pause.mode;
        ensure(from.can_transition(to), || {
            format!("pause mode cannot go from {from} to {to}")
        })?;
        if from != to {
            info!("Pause mode {} -> {}", from, to);
        }
        self.pause.mode = to;
        Ok(())
    }

    /// Advance a resume search as far as cached answers allow
    ///
    /// Each saved region contributes hits of script breakpoints, debugger
    /// statements and handler entries of triggered events. Frame
    /// breakpoints are only matched against the origin frame's steps, in
    /// the first region.
    ///
    /// # Errors
    ///
    /// Returns error if a search manifest cannot be queued
    pub fn resume_target(&mut self, search: &mut ResumeSearch) -> Result<SearchStep> {
        loop {
            let region = search.region;
            let Some(end) = self.region_end(region) else {
                if search.forward {
                    return Ok(SearchStep::Exhausted);
                }
                match self.checkpoints.previous_saved_checkpoint(region) {
                    Some(previous) => {
                        search.region = previous;
                        search.first = false;
                        continue;
                    }
                    None => return Ok(SearchStep::Exhausted),
                }
            };

            let mut pending = false;
            let mut candidates = Vec::new();

            if self.pool.region_scanned(region) {
                let info = self.checkpoints.get(region)?;
                candidates.extend(info.debugger_statements.iter().cloned());
                let triggered: Vec<RecordedEvent> = info
                    .events
                    .iter()
                    .filter(|event| self.event_triggers.contains(&event.name))
                    .cloned()
                    .collect();
                for event in triggered {
                    match self.find_event_frame_entry(&event)? {
                        Lookup::Ready(entry) => candidates.extend(entry),
                        Lookup::AwaitingScan | Lookup::Requested => pending = true,
                    }
                }
            } else {
                self.scan_recording(region)?;
                pending = true;
            }

            for position in &search.breakpoints {
                if position.kind.is_script_breakpoint() {
                    match self.find_hits(region, position)? {
                        Lookup::Ready(hits) => candidates.extend(hits),
                        Lookup::AwaitingScan | Lookup::Requested => pending = true,
                    }
                } else if search.first && !search.origin.is_checkpoint() {
                    match self.find_frame_steps(&search.origin)? {
                        Lookup::Ready(steps) => candidates
                            .extend(steps.into_iter().filter(|step| step.hit_by(position))),
                        Lookup::AwaitingScan | Lookup::Requested => pending = true,
                    }
                }
            }

            if pending {
                return Ok(SearchStep::Pending);
            }
            if let Some(point) = search.nearest(candidates) {
                return Ok(SearchStep::Found(point));
            }

            search.first = false;
            if search.forward {
                search.region = end;
            } else {
                match self.checkpoints.previous_saved_checkpoint(region) {
                    Some(previous) => search.region = previous,
                    None => return Ok(SearchStep::Exhausted),
                }
            }
            debug!("Resume search moving to region {}", search.region);
        }
    }

    /// Poll the running resume search, acting on its outcome
    pub(crate) fn poll_search(&mut self) -> Result<()> {
        let Some(mut search) = self.search.take() else {
            return Ok(());
        };
        match self.resume_target(&mut search)? {
            SearchStep::Pending => {
                self.search = Some(search);
                Ok(())
            }
            SearchStep::Found(point) => {
                info!("Resume search found checkpoint {}", point.checkpoint);
                self.arrive_at(point)
            }
            SearchStep::Exhausted if search.forward => {
                info!("Forward search reached the end of the flushed recording");
                self.transition(PauseMode::Running)?;
                self.resume_frontier()
            }
            SearchStep::Exhausted => {
                info!("Backward search reached the start of the recording");
                if let Some(debugger) = self.debugger() {
                    debugger.on_hit_recording_boundary();
                }
                self.arrive_at(ExecutionPoint::start())
            }
        }
    }

    /// Bind the nearest child to `point` and send it there
    pub(crate) fn arrive_at(&mut self, point: ExecutionPoint) -> Result<()> {
        self.transition(PauseMode::Arriving)?;
        let active = self.nearest_child(&point)?;
        info!(
            "Child {} heading for checkpoint {} (progress {:.3})",
            active, point.checkpoint, point.progress
        );
        self.pause.point = point.clone();
        self.pause.active = Some(active);
        self.engine.clear_graphics();
        if let Some(debugger) = self.debugger() {
            debugger.on_position_change(&point);
        }
        self.prefetch(&point);
        self.send_active_child_to_pause_point()?;
        self.poke_children()
    }

    pub(crate) fn send_active_child_to_pause_point(&mut self) -> Result<()> {
        let Some(id) = self.pause.active else {
            return Ok(());
        };
        if self.pause.mode != PauseMode::Arriving {
            return Ok(());
        }
        let child = self.pool.get(id)?;
        if !child.paused {
            return Ok(());
        }
        if child.async_manifest.is_some() {
            return self.poke_child(id);
        }

        let point = self.pause.point.clone();
        match self.maybe_reach_point(id, &point, None)? {
            Reach::Pending => Ok(()),
            Reach::Reached => self.child_arrived(id),
        }
    }

    /// The active child reached the pause point: replay buffered requests,
    /// then settle
    fn child_arrived(&mut self, id: ChildId) -> Result<()> {
        if self.debugger_requests.is_empty() {
            return self.settle_paused();
        }
        debug!(
            "Replaying {} debugger requests on child {}",
            self.debugger_requests.len(),
            id
        );
        let requests = self.debugger_requests.clone();
        self.send_manifest(
            id,
            Manifest::new(
                ManifestContents::BatchDebuggerRequest { requests },
                Completion::BatchRequest,
            ),
        )
    }

    pub(crate) fn settle_paused(&mut self) -> Result<()> {
        self.transition(PauseMode::Paused)?;
        let point = self.pause.point.clone();
        let on_frontier = self
            .pause
            .active
            .is_some_and(|id| self.pool.is_frontier(id));
        if on_frontier {
            self.engine.restore_main_graphics();
        } else {
            self.engine.on_repaint();
        }
        if let Some(debugger) = self.debugger() {
            debugger.on_pause(&point);
        }
        if std::mem::take(&mut self.time_warp_pending) {
            self.host.send(HostMessage::TimeWarpFinished);
        }
        Ok(())
    }

    /// Drive the active child to the pause point with blocking waits
    pub(crate) fn ensure_arrived(&mut self) -> Result<()> {
        for _ in 0..MAX_ARRIVAL_WAITS {
            if self.pause.mode != PauseMode::Arriving {
                return Ok(());
            }
            let id = self.pause.active.ok_or(RewindError::NotPaused)?;
            if self.pool.get(id)?.paused {
                self.poke_child(id)?;
                let stuck = self.pause.mode == PauseMode::Arriving
                    && self.pause.active == Some(id)
                    && self.pool.get(id)?.paused;
                ensure(!stuck, || {
                    format!("child {id} cannot make progress toward the pause point")
                })?;
            } else {
                self.wait_until_paused(id, false)?;
            }
        }
        Err(RewindError::invariant("active child never reached the pause point"))
    }

    /// Resume in a direction from the current pause point
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::NotPaused`] unless paused or arriving
    pub fn resume(&mut self, forward: bool) -> Result<()> {
        if self.pause.mode == PauseMode::Arriving {
            self.ensure_arrived()?;
        }
        if self.pause.mode != PauseMode::Paused {
            return Err(RewindError::NotPaused);
        }
        self.debugger_requests.clear();

        let frontier = self.frontier()?;
        if self.pause.active == Some(frontier) {
            if forward {
                self.transition(PauseMode::Running)?;
                self.pause.active = None;
                return self.resume_frontier();
            }
            self.leave_frontier()?;
        }

        let origin = self.pause.point.clone();
        self.transition(if forward {
            PauseMode::ResumingForward
        } else {
            PauseMode::ResumingBackward
        })?;
        self.pause.active = None;
        self.engine.clear_graphics();

        self.search = Some(ResumeSearch::new(
            origin,
            forward,
            self.breakpoints.clone(),
            &self.checkpoints,
        ));
        self.poll_search()?;
        self.poke_children()
    }

    /// Jump straight to `target`
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::UnknownCheckpoint`] if `target` lies past the
    /// flushed recording. A rejected warp leaves the frontier where it was:
    /// running again if it was running, or still at the pause point.
    pub fn time_warp(&mut self, target: ExecutionPoint) -> Result<()> {
        info!("Time warp to checkpoint {}", target.checkpoint);
        let was_running = self.pause.mode == PauseMode::Running;
        if was_running {
            self.interrupt_frontier()?;
        }
        let frontier = self.frontier()?;
        if self.pause.mode == PauseMode::Paused && self.pause.active == Some(frontier) {
            let reachable = self.last_flush_checkpoint.max(self.pause.point.checkpoint);
            if target.checkpoint > reachable {
                return Err(RewindError::UnknownCheckpoint(target.checkpoint));
            }
            self.leave_frontier()?;
        }
        if target > ExecutionPoint::checkpoint(self.last_flush_checkpoint) {
            if was_running && self.pause.mode == PauseMode::Running {
                self.resume_frontier()?;
            }
            return Err(RewindError::UnknownCheckpoint(target.checkpoint));
        }

        self.search = None;
        self.debugger_requests.clear();
        self.time_warp_pending = true;
        self.arrive_at(target)
    }

    /// Stop live execution and pause at the frontier's checkpoint
    ///
    /// # Errors
    ///
    /// Returns error if the frontier cannot be interrupted or flushed
    pub fn pause(&mut self) -> Result<()> {
        if self.pause.mode != PauseMode::Running {
            return Ok(());
        }
        self.interrupt_frontier()?;
        if self.pause.mode != PauseMode::Running {
            return Ok(());
        }
        self.arrive_at(ExecutionPoint::checkpoint(self.last_flush_checkpoint))
    }

    /// Stop the frontier at a checkpoint and flush, unless it stops at a hit
    pub(super) fn interrupt_frontier(&mut self) -> Result<()> {
        let id = self.frontier()?;
        if !self.pool.get(id)?.paused {
            self.wait_until_paused(id, true)?;
        }
        if self.pause.mode == PauseMode::Running {
            self.flush_recording()?;
        }
        Ok(())
    }

    /// Move the frontier off a positioned pause point and flush past it
    pub(crate) fn leave_frontier(&mut self) -> Result<()> {
        let id = self.frontier()?;
        while !self.pool.get(id)?.last_pause_point.is_checkpoint() {
            if self.pool.get(id)?.paused {
                self.send_manifest(
                    id,
                    Manifest::new(
                        ManifestContents::Resume {
                            forward: true,
                            breakpoints: Vec::new(),
                        },
                        Completion::Frontier,
                    ),
                )?;
            }
            self.wait_until_paused(id, true)?;
        }
        self.flush_recording()
    }

    /// Make everything the frontier recorded available to replaying children
    ///
    /// # Errors
    ///
    /// Returns error if the frontier cannot be reached
    pub fn flush_recording(&mut self) -> Result<()> {
        let id = self.frontier()?;
        if !self.pool.get(id)?.paused {
            self.wait_until_paused(id, true)?;
        }
        let checkpoint = self.pool.get(id)?.last_pause_point.checkpoint;
        if checkpoint <= self.last_flush_checkpoint {
            return Ok(());
        }
        self.send_manifest(
            id,
            Manifest::new(ManifestContents::FlushRecording, Completion::Flush),
        )?;
        self.wait_until_paused(id, false)
    }

    /// Let the frontier run live with the installed breakpoints
    pub(crate) fn resume_frontier(&mut self) -> Result<()> {
        let id = self.frontier()?;
        if !self.pool.get(id)?.paused {
            return Ok(());
        }
        self.engine.restore_main_graphics();
        self.send_manifest(
            id,
            Manifest::new(
                ManifestContents::Resume {
                    forward: true,
                    breakpoints: self.breakpoints.clone(),
                },
                Completion::Frontier,
            ),
        )
    }

    pub(crate) fn frontier_finished(&mut self, response: &ManifestResponse) -> Result<()> {
        self.record_checkpoints(response)?;
        if response.hit_endpoint {
            info!("Recording endpoint at checkpoint {}", response.point.checkpoint);
            self.recording_endpoint = Some(response.point.clone());
            self.host.send(HostMessage::HitRecordingEndpoint {
                point: response.point.clone(),
            });
        }

        let stopped = response.hit_endpoint || !response.point.is_checkpoint();
        if self.pause.mode == PauseMode::Running && stopped {
            let frontier = self.frontier()?;
            self.pause.point = response.point.clone();
            self.pause.active = Some(frontier);
            if let Some(debugger) = self.debugger() {
                debugger.on_position_change(&response.point);
            }
            self.settle_paused()?;
        }
        Ok(())
    }

    pub(crate) fn main_child_ready(&mut self, response: &ManifestResponse) -> Result<()> {
        self.record_checkpoints(response)?;
        if self.pause.mode == PauseMode::Running {
            self.resume_frontier()?;
        }
        Ok(())
    }

    pub(crate) fn frontier_flushed(&mut self, response: &ManifestResponse) -> Result<()> {
        self.record_checkpoints(response)?;
        let checkpoint = response.point.checkpoint;
        if !self.checkpoints.is_saved(checkpoint) {
            self.add_saved_checkpoint(checkpoint)?;
        }
        self.since_saved = Duration::ZERO;
        self.last_flush_checkpoint = self.last_flush_checkpoint.max(checkpoint);
        info!("Flushed recording through checkpoint {}", checkpoint);

        for region in self.flushed_regions() {
            self.scan_recording(region)?;
        }
        self.poke_children()
    }

    /// Account for checkpoints and scripts reported by the frontier
    fn record_checkpoints(&mut self, response: &ManifestResponse) -> Result<()> {
        let interval = self.config.saved_checkpoint_interval();
        for reached in &response.checkpoints {
            ensure(reached.checkpoint > FIRST_CHECKPOINT_ID, || {
                format!("frontier reported checkpoint {}", reached.checkpoint)
            })?;
            self.checkpoints
                .record_duration(reached.checkpoint - 1, reached.duration())?;
            self.since_saved += reached.duration();
            if self.since_saved >= interval {
                self.add_saved_checkpoint(reached.checkpoint)?;
                self.since_saved = Duration::ZERO;
            }
        }
        for script in &response.new_scripts {
            if let Some(debugger) = self.debugger() {
                debugger.on_new_script(script);
            }
        }
        Ok(())
    }

    /// Mark a checkpoint saved and hand it to the next replaying child
    ///
    /// # Errors
    ///
    /// Returns error for ids below the first checkpoint
    pub fn add_saved_checkpoint(&mut self, checkpoint: CheckpointId) -> Result<()> {
        self.checkpoints.mark_saved(checkpoint)?;
        if checkpoint == FIRST_CHECKPOINT_ID || !self.engine.can_rewind() {
            return Ok(());
        }
        let Some(owner) = self.pool.next_assignee() else {
            return Ok(());
        };

        let info = self.checkpoints.entry(checkpoint)?;
        info.owner = Some(owner);
        info.assign_time = Some(std::time::Instant::now());
        self.pool.get_mut(owner)?.saved_checkpoints.insert(checkpoint);
        debug!("Saved checkpoint {} assigned to child {}", checkpoint, owner);
        Ok(())
    }
}
