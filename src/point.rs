//! Execution points and breakpoint positions
//!
//! An [`ExecutionPoint`] names a unique moment of the recording. Points are
//! totally ordered: first by checkpoint, then (within a checkpoint) the bare
//! checkpoint point comes first, then positioned points by progress, frame
//! depth and position kind.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointId, FIRST_CHECKPOINT_ID};

/// Kind of a script position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PositionKind {
    /// A breakpoint site at a script offset
    Break,
    /// Single-step over a script offset in a specific frame
    OnStep,
    /// A frame being popped
    OnPop,
    /// A frame being entered
    EnterFrame,
}

impl PositionKind {
    /// Positions whose hits can be found from a region scan
    #[must_use]
    pub fn is_script_breakpoint(self) -> bool {
        matches!(self, Self::Break | Self::OnStep)
    }

    /// Call/return positions, found from frame steps
    #[must_use]
    pub fn is_frame_breakpoint(self) -> bool {
        matches!(self, Self::OnPop | Self::EnterFrame)
    }
}

/// Location within script execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Position kind
    pub kind: PositionKind,
    /// Script id, absent for "any script"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<u32>,
    /// Bytecode offset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    /// Frame depth, absent for "any frame"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<u32>,
}

impl Position {
    /// Breakpoint at a script offset
    #[must_use]
    pub fn breakpoint(script: u32, offset: u32) -> Self {
        Self {
            kind: PositionKind::Break,
            script: Some(script),
            offset: Some(offset),
            frame_index: None,
        }
    }

    /// Single step at an offset in a given frame
    #[must_use]
    pub fn on_step(script: u32, offset: u32, frame_index: u32) -> Self {
        Self {
            kind: PositionKind::OnStep,
            script: Some(script),
            offset: Some(offset),
            frame_index: Some(frame_index),
        }
    }

    /// Frame pop; `None` script matches every script
    #[must_use]
    pub fn on_pop(script: Option<u32>, frame_index: Option<u32>) -> Self {
        Self {
            kind: PositionKind::OnPop,
            script,
            offset: None,
            frame_index,
        }
    }

    /// Frame entry; `None` script matches every script
    #[must_use]
    pub fn enter_frame(script: Option<u32>, frame_index: Option<u32>) -> Self {
        Self {
            kind: PositionKind::EnterFrame,
            script,
            offset: None,
            frame_index,
        }
    }

    /// Whether a breakpoint at `self` fires for a point at `other`
    #[must_use]
    pub fn subsumes(&self, other: &Position) -> bool {
        if self == other {
            return true;
        }
        let frame_ok = self.frame_index.is_none() || self.frame_index == other.frame_index;
        match (self.kind, other.kind) {
            (PositionKind::Break, PositionKind::OnStep) => {
                self.script == other.script && self.offset == other.offset
            }
            (PositionKind::OnStep, PositionKind::OnStep) => {
                self.script == other.script && self.offset == other.offset && frame_ok
            }
            (PositionKind::OnPop, PositionKind::OnPop)
            | (PositionKind::EnterFrame, PositionKind::EnterFrame) => {
                (self.script.is_none() || self.script == other.script) && frame_ok
            }
            _ => false,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self.kind {
            PositionKind::EnterFrame => 0,
            PositionKind::Break | PositionKind::OnStep => 1,
            PositionKind::OnPop => 2,
        }
    }
}

/// A moment of the recording
///
/// Decoding rejects checkpoints below [`FIRST_CHECKPOINT_ID`] and progress
/// outside `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "WirePoint")]
pub struct ExecutionPoint {
    /// Checkpoint this point follows
    pub checkpoint: CheckpointId,
    /// Script position, absent for the checkpoint itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Fraction of the recording executed at this point, in `[0, 1]`
    pub progress: f64,
}

/// An execution point as decoded, before validation
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePoint {
    checkpoint: CheckpointId,
    #[serde(default)]
    position: Option<Position>,
    #[serde(default)]
    progress: f64,
}

impl TryFrom<WirePoint> for ExecutionPoint {
    type Error = String;

    fn try_from(wire: WirePoint) -> std::result::Result<Self, Self::Error> {
        if wire.checkpoint < FIRST_CHECKPOINT_ID {
            return Err(format!("checkpoint {} precedes the recording", wire.checkpoint));
        }
        if !(0.0..=1.0).contains(&wire.progress) {
            return Err(format!("progress {} outside [0, 1]", wire.progress));
        }
        Ok(Self {
            checkpoint: wire.checkpoint,
            position: wire.position,
            progress: wire.progress,
        })
    }
}

impl ExecutionPoint {
    /// The point of a checkpoint itself
    #[must_use]
    pub fn checkpoint(checkpoint: CheckpointId) -> Self {
        Self {
            checkpoint,
            position: None,
            progress: 0.0,
        }
    }

    /// A positioned point
    #[must_use]
    pub fn at(checkpoint: CheckpointId, position: Position, progress: f64) -> Self {
        Self {
            checkpoint,
            position: Some(position),
            progress: progress.clamp(0.0, 1.0),
        }
    }

    /// The very start of the recording
    #[must_use]
    pub fn start() -> Self {
        Self::checkpoint(FIRST_CHECKPOINT_ID)
    }

    /// Whether this is a bare checkpoint point
    #[must_use]
    pub fn is_checkpoint(&self) -> bool {
        self.position.is_none()
    }

    /// Frame depth of a positioned point
    #[must_use]
    pub fn frame_index(&self) -> Option<u32> {
        self.position.as_ref().and_then(|p| p.frame_index)
    }

    /// Whether a breakpoint at `position` fires at this point
    #[must_use]
    pub fn hit_by(&self, position: &Position) -> bool {
        self.position
            .as_ref()
            .is_some_and(|here| position.subsumes(here))
    }
}

impl PartialEq for ExecutionPoint {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ExecutionPoint {}

impl Hash for ExecutionPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.checkpoint.hash(state);
        if let Some(position) = &self.position {
            self.progress.to_bits().hash(state);
            position.hash(state);
        }
    }
}

impl PartialOrd for ExecutionPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExecutionPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.checkpoint
            .cmp(&other.checkpoint)
            .then_with(|| match (&self.position, &other.position) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => self
                    .progress
                    .total_cmp(&other.progress)
                    .then_with(|| a.frame_index.cmp(&b.frame_index))
                    .then_with(|| a.kind_rank().cmp(&b.kind_rank()))
                    .then_with(|| a.script.cmp(&b.script))
                    .then_with(|| a.offset.cmp(&b.offset))
                    .then_with(|| a.kind.cmp(&b.kind)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_precedes_positions() {
        let cp = ExecutionPoint::checkpoint(3);
        let hit = ExecutionPoint::at(3, Position::breakpoint(1, 10), 0.2);
        let next = ExecutionPoint::checkpoint(4);

        assert!(cp < hit);
        assert!(hit < next);
        assert!(ExecutionPoint::start() < cp);
    }

    #[test]
    fn test_progress_orders_within_checkpoint() {
        let a = ExecutionPoint::at(2, Position::breakpoint(1, 50), 0.1);
        let b = ExecutionPoint::at(2, Position::breakpoint(1, 10), 0.3);
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_enter_frame_before_pop_at_same_progress() {
        let enter = ExecutionPoint::at(2, Position::enter_frame(Some(1), Some(2)), 0.5);
        let pop = ExecutionPoint::at(2, Position::on_pop(Some(1), Some(2)), 0.5);
        assert!(enter < pop);
    }

    #[test]
    fn test_subsumes() {
        let any_pop = Position::on_pop(None, None);
        assert!(any_pop.subsumes(&Position::on_pop(Some(4), Some(1))));
        assert!(!any_pop.subsumes(&Position::enter_frame(Some(4), Some(1))));

        let bp = Position::breakpoint(1, 10);
        assert!(bp.subsumes(&Position::on_step(1, 10, 3)));
        assert!(!bp.subsumes(&Position::on_step(1, 11, 3)));

        let framed_step = Position::on_step(1, 10, 2);
        assert!(!framed_step.subsumes(&Position::on_step(1, 10, 3)));
    }

    #[test]
    fn test_wire_format() {
        let point = ExecutionPoint::at(7, Position::on_step(2, 40, 1), 0.25);
        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(json["checkpoint"], 7);
        assert_eq!(json["position"]["kind"], "OnStep");
        assert_eq!(json["position"]["frameIndex"], 1);
        assert_eq!(json["progress"], 0.25);

        let decoded: ExecutionPoint = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, point);

        let bare: ExecutionPoint = serde_json::from_str(r#"{"checkpoint":1}"#).unwrap();
        assert_eq!(bare, ExecutionPoint::start());
    }

    #[test]
    fn test_wire_rejects_invalid_points() {
        assert!(serde_json::from_str::<ExecutionPoint>(r#"{"checkpoint":0}"#).is_err());
        assert!(serde_json::from_str::<ExecutionPoint>(
            r#"{"checkpoint":2,"position":{"kind":"Break","script":1,"offset":3},"progress":1.5}"#
        )
        .is_err());
        assert!(serde_json::from_str::<ExecutionPoint>(r#"{"checkpoint":2,"progress":-0.1}"#).is_err());
    }
}
