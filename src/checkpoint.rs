//! Checkpoint registry
//!
//! Dense, lazily grown table of per-checkpoint bookkeeping indexed by
//! checkpoint id. Entries are never removed.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::child::ChildId;
use crate::error::ensure;
use crate::point::ExecutionPoint;
use crate::{Result, RewindError};

/// Checkpoint identifier, starting at [`FIRST_CHECKPOINT_ID`]
pub type CheckpointId = usize;

/// The first checkpoint of every recording; always saved
pub const FIRST_CHECKPOINT_ID: CheckpointId = 1;

static_assertions::const_assert!(FIRST_CHECKPOINT_ID >= 1);

/// An event recorded in a scanned region (e.g. a DOM event dispatch)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    /// Event name, matched against installed event triggers
    pub name: String,
    /// Where the event was dispatched
    pub point: ExecutionPoint,
}

/// Bookkeeping for one checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    /// Execution time from this checkpoint to the next; set exactly once
    pub duration: Option<Duration>,
    /// The checkpoint's execution point
    pub point: ExecutionPoint,
    /// Whether replaying children snapshot here
    pub saved: bool,
    /// Child responsible for snapshotting and scanning from here
    pub owner: Option<ChildId>,
    /// When the checkpoint was assigned to its owner
    pub assign_time: Option<Instant>,
    /// When the region starting here was first scanned
    pub scan_time: Option<Instant>,
    /// How long that first scan took
    pub scan_duration: Option<Duration>,
    /// Debugger statements hit in the region starting here
    pub debugger_statements: Vec<ExecutionPoint>,
    /// Events recorded in the region starting here
    pub events: Vec<RecordedEvent>,
}

impl CheckpointInfo {
    fn new(id: CheckpointId) -> Self {
        Self {
            duration: None,
            point: ExecutionPoint::checkpoint(id),
            saved: false,
            owner: None,
            assign_time: None,
            scan_time: None,
            scan_duration: None,
            debugger_statements: Vec::new(),
            events: Vec::new(),
        }
    }
}

/// Registry of every checkpoint referenced so far
#[derive(Debug, Clone)]
pub struct CheckpointRegistry {
    /// `infos[i]` describes checkpoint `i + FIRST_CHECKPOINT_ID`
    infos: Vec<CheckpointInfo>,
}

impl Default for CheckpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointRegistry {
    /// Create a registry holding only the first checkpoint, saved
    #[must_use]
    pub fn new() -> Self {
        let mut first = CheckpointInfo::new(FIRST_CHECKPOINT_ID);
        first.saved = true;
        Self { infos: vec![first] }
    }

    /// Highest checkpoint id referenced so far
    #[must_use]
    pub fn last_id(&self) -> CheckpointId {
        self.infos.len() + FIRST_CHECKPOINT_ID - 1
    }

    fn index(id: CheckpointId) -> Result<usize> {
        id.checked_sub(FIRST_CHECKPOINT_ID)
            .ok_or(RewindError::UnknownCheckpoint(id))
    }

    /// Look up a checkpoint
    ///
    /// # Errors
    ///
    /// Returns error if the checkpoint has never been referenced
    pub fn get(&self, id: CheckpointId) -> Result<&CheckpointInfo> {
        self.infos
            .get(Self::index(id)?)
            .ok_or(RewindError::UnknownCheckpoint(id))
    }

    /// Look up a checkpoint, growing the table to include it
    ///
    /// # Errors
    ///
    /// Returns error for ids below [`FIRST_CHECKPOINT_ID`]
    pub fn entry(&mut self, id: CheckpointId) -> Result<&mut CheckpointInfo> {
        let index = Self::index(id)?;
        while self.infos.len() <= index {
            let next = self.infos.len() + FIRST_CHECKPOINT_ID;
            self.infos.push(CheckpointInfo::new(next));
        }
        Ok(&mut self.infos[index])
    }

    /// Record the execution time from `id` to `id + 1`
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the duration was already set
    pub fn record_duration(&mut self, id: CheckpointId, duration: Duration) -> Result<()> {
        let info = self.entry(id)?;
        ensure(info.duration.is_none(), || {
            format!("duration of checkpoint {id} recorded twice")
        })?;
        info.duration = Some(duration);
        self.entry(id + 1)?;
        Ok(())
    }

    /// Execution time from checkpoint `start` to checkpoint `end`
    ///
    /// Checkpoints whose duration is not yet known contribute nothing.
    #[must_use]
    pub fn range_duration(&self, start: CheckpointId, end: CheckpointId) -> Duration {
        if end <= start || start < FIRST_CHECKPOINT_ID {
            return Duration::ZERO;
        }
        let from = start - FIRST_CHECKPOINT_ID;
        let to = (end - FIRST_CHECKPOINT_ID).min(self.infos.len());
        self.infos
            .get(from..to)
            .unwrap_or_default()
            .iter()
            .filter_map(|info| info.duration)
            .sum()
    }

    /// Execution time between two points, at checkpoint granularity
    #[must_use]
    pub fn point_range_duration(&self, start: &ExecutionPoint, end: &ExecutionPoint) -> Duration {
        self.range_duration(start.checkpoint, end.checkpoint)
    }

    /// Total recorded execution time before `id`
    #[must_use]
    pub fn elapsed_before(&self, id: CheckpointId) -> Duration {
        self.range_duration(FIRST_CHECKPOINT_ID, id)
    }

    /// Mark a checkpoint saved
    ///
    /// # Errors
    ///
    /// Returns error for ids below [`FIRST_CHECKPOINT_ID`]
    pub fn mark_saved(&mut self, id: CheckpointId) -> Result<()> {
        self.entry(id)?.saved = true;
        Ok(())
    }

    /// Whether a checkpoint is saved
    #[must_use]
    pub fn is_saved(&self, id: CheckpointId) -> bool {
        self.get(id).is_ok_and(|info| info.saved)
    }

    /// The closest saved checkpoint at or before `id`
    #[must_use]
    pub fn saved_checkpoint(&self, id: CheckpointId) -> CheckpointId {
        let mut id = id.min(self.last_id());
        while id > FIRST_CHECKPOINT_ID && !self.is_saved(id) {
            id -= 1;
        }
        id.max(FIRST_CHECKPOINT_ID)
    }

    /// The closest saved checkpoint strictly after `id`
    #[must_use]
    pub fn next_saved_checkpoint(&self, id: CheckpointId) -> Option<CheckpointId> {
        (id + 1..=self.last_id()).find(|&next| self.is_saved(next))
    }

    /// The closest saved checkpoint strictly before `id`
    #[must_use]
    pub fn previous_saved_checkpoint(&self, id: CheckpointId) -> Option<CheckpointId> {
        (FIRST_CHECKPOINT_ID..id.min(self.last_id() + 1))
            .rev()
            .find(|&prev| self.is_saved(prev))
    }

    /// All saved checkpoints in ascending order
    pub fn saved_checkpoints(&self) -> impl Iterator<Item = CheckpointId> + '_ {
        self.infos
            .iter()
            .enumerate()
            .filter(|(_, info)| info.saved)
            .map(|(index, _)| index + FIRST_CHECKPOINT_ID)
    }

    /// Saved checkpoints strictly between two points, plus `end` itself
    /// when it is a saved checkpoint point
    #[must_use]
    pub fn saved_points_between(
        &self,
        start: &ExecutionPoint,
        end: &ExecutionPoint,
    ) -> Vec<ExecutionPoint> {
        self.saved_checkpoints()
            .filter(|&id| id >= start.checkpoint && id <= end.checkpoint)
            .map(ExecutionPoint::checkpoint)
            .filter(|point| point > start && point <= end)
            .collect()
    }

    /// Every referenced checkpoint's info
    pub fn iter(&self) -> impl Iterator<Item = (CheckpointId, &CheckpointInfo)> {
        self.infos
            .iter()
            .enumerate()
            .map(|(index, info)| (index + FIRST_CHECKPOINT_ID, info))
    }
}
