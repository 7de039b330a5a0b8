//! Per-child state

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::checkpoint::{CheckpointId, CheckpointRegistry};
use crate::error::ensure;
use crate::manifest::{AsyncManifest, Manifest, ManifestResponse};
use crate::point::ExecutionPoint;
use crate::Result;

use super::ChildId;

/// What a child process does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Records live execution; cannot rewind
    Recording,
    /// Replays the recording and can restore snapshots
    Replaying,
}

/// A manifest the child is executing
#[derive(Debug)]
pub struct InFlight {
    /// The manifest
    pub manifest: Manifest,
    /// When it was sent
    pub sent_at: Instant,
    /// When the hang timer fires
    pub deadline: Instant,
}

/// State of one child process
#[derive(Debug)]
pub struct ChildProcess {
    id: ChildId,
    role: Role,
    /// Idle and ready for a new manifest
    pub paused: bool,
    /// Where the child last paused
    pub last_pause_point: ExecutionPoint,
    /// Snapshots taken so far, ascending
    pub snapshots: Vec<ExecutionPoint>,
    /// Saved checkpoints this child snapshots and scans
    pub saved_checkpoints: BTreeSet<CheckpointId>,
    /// Saved checkpoints whose regions this child has scanned
    pub scanned: BTreeSet<CheckpointId>,
    /// Has run debugger evaluations since its last snapshot restore
    pub diverged: bool,
    /// The process is gone
    pub crashed: bool,
    /// A claimed async manifest still traveling to its point
    pub async_manifest: Option<AsyncManifest>,
    /// Last reported memory usage in bytes
    pub memory_usage: Option<u64>,
    in_flight: Option<InFlight>,
}

impl ChildProcess {
    /// The recording child, live at checkpoint 1
    #[must_use]
    pub fn recording(id: ChildId) -> Self {
        Self::new(id, Role::Recording, Vec::new())
    }

    /// A replaying child holding a snapshot of checkpoint 1
    #[must_use]
    pub fn replaying(id: ChildId) -> Self {
        Self::new(id, Role::Replaying, vec![ExecutionPoint::start()])
    }

    fn new(id: ChildId, role: Role, snapshots: Vec<ExecutionPoint>) -> Self {
        Self {
            id,
            role,
            paused: true,
            last_pause_point: ExecutionPoint::start(),
            snapshots,
            saved_checkpoints: BTreeSet::new(),
            scanned: BTreeSet::new(),
            diverged: false,
            crashed: false,
            async_manifest: None,
            memory_usage: None,
            in_flight: None,
        }
    }

    /// Child id
    #[must_use]
    pub fn id(&self) -> ChildId {
        self.id
    }

    /// Child role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the child has not crashed
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.crashed
    }

    /// The manifest being executed, if any
    #[must_use]
    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    /// Begin executing a manifest
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the child is not paused
    pub fn start_manifest(
        &mut self,
        manifest: Manifest,
        now: Instant,
        hang_timeout: Duration,
    ) -> Result<()> {
        ensure(self.paused && self.in_flight.is_none(), || {
            format!(
                "child {} sent {} while executing",
                self.id,
                manifest.contents.kind()
            )
        })?;
        ensure(self.is_live(), || format!("child {} has crashed", self.id))?;

        let deadline = now + hang_timeout + manifest.expected_duration.unwrap_or_default();
        self.paused = false;
        self.in_flight = Some(InFlight {
            manifest,
            sent_at: now,
            deadline,
        });
        Ok(())
    }

    /// Finish the executing manifest
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the child is not executing
    pub fn finish_manifest(&mut self, response: &ManifestResponse) -> Result<InFlight> {
        let id = self.id;
        ensure(!self.paused, || format!("child {id} finished while idle"))?;
        let in_flight = self.in_flight.take().ok_or_else(|| {
            crate::RewindError::invariant(format!("child {id} has no manifest in flight"))
        })?;

        self.paused = true;
        self.last_pause_point = response.point.clone();
        if response.memory_usage.is_some() {
            self.memory_usage = response.memory_usage;
        }
        Ok(in_flight)
    }

    /// Drop any in-flight manifest after a crash
    pub fn take_in_flight(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }

    /// Whether the hang timer has fired
    #[must_use]
    pub fn is_hung(&self, now: Instant) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|in_flight| now >= in_flight.deadline)
    }

    /// Most recent snapshot at or before `point`
    #[must_use]
    pub fn snapshot_before(&self, point: &ExecutionPoint) -> Option<&ExecutionPoint> {
        self.snapshots.iter().rev().find(|snapshot| *snapshot <= point)
    }

    /// Estimated time for this child to reach `point`
    ///
    /// Only used to break ties when scheduling work.
    #[must_use]
    pub fn time_to_reach_point(
        &self,
        point: &ExecutionPoint,
        checkpoints: &CheckpointRegistry,
        now: Instant,
    ) -> Duration {
        let mut time = Duration::ZERO;
        let mut start = self.last_pause_point.clone();
        if let Some(in_flight) = &self.in_flight {
            let expected = in_flight.manifest.expected_duration.unwrap_or_default();
            time += expected.saturating_sub(now.saturating_duration_since(in_flight.sent_at));
            if let Some(destination) = &in_flight.manifest.destination {
                start = destination.clone();
            }
        }

        if *point < start || self.diverged {
            match self.snapshot_before(point) {
                Some(snapshot) => start = snapshot.clone(),
                None => return Duration::MAX,
            }
        }

        time + checkpoints.point_range_duration(&start, point)
    }
}
