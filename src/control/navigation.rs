//! Moving replaying children between execution points

use std::time::Instant;

use tracing::debug;

use crate::child::ChildId;
use crate::error::ensure;
use crate::manifest::{Completion, Manifest, ManifestContents};
use crate::point::ExecutionPoint;
use crate::{Result, RewindError};

use super::Controller;

/// Outcome of [`Controller::maybe_reach_point`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reach {
    /// The child is already at the target
    Reached,
    /// A manifest was sent; poll again once it finishes
    Pending,
}

impl Controller {
    /// Send `id` one step closer to `target`
    ///
    /// Backward motion, or any motion of a diverged child, restores the
    /// newest snapshot at or before the target. Forward motion runs to the
    /// target, snapshotting every saved checkpoint on the way plus
    /// `snapshot` when given.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation for the frontier child or a child
    /// with no snapshot to restore
    pub fn maybe_reach_point(
        &mut self,
        id: ChildId,
        target: &ExecutionPoint,
        snapshot: Option<&ExecutionPoint>,
    ) -> Result<Reach> {
        ensure(!self.pool.is_frontier(id), || {
            format!("frontier child {id} cannot be navigated")
        })?;
        let child = self.pool.get(id)?;
        let current = child.last_pause_point.clone();
        if current == *target && !child.diverged {
            return Ok(Reach::Reached);
        }

        if *target < current || child.diverged {
            let bound = if *target < current { target } else { &current };
            let popped = child
                .snapshots
                .iter()
                .filter(|point| *point > bound)
                .count();
            let keep = child.snapshots.len() - popped;
            ensure(keep > 0, || {
                format!("child {id} has no snapshot before {}", bound.checkpoint)
            })?;
            let destination = child.snapshots[keep - 1].clone();

            debug!(
                "Child {} restoring snapshot at checkpoint {} ({} popped)",
                id, destination.checkpoint, popped
            );
            self.send_manifest(
                id,
                Manifest {
                    contents: ManifestContents::RestoreSnapshot {
                        num_snapshots: popped,
                    },
                    completion: Completion::Restore { popped },
                    destination: Some(destination),
                    expected_duration: None,
                },
            )?;
            return Ok(Reach::Pending);
        }

        let mut snapshot_points: Vec<ExecutionPoint> = self
            .checkpoints
            .saved_points_between(&current, target)
            .into_iter()
            .filter(|point| !child.snapshots.contains(point))
            .collect();
        if let Some(extra) = snapshot {
            if *extra > current && extra <= target && !snapshot_points.contains(extra) {
                snapshot_points.push(extra.clone());
                snapshot_points.sort();
            }
        }

        let expected_duration = self.checkpoints.point_range_duration(&current, target);
        self.send_manifest(
            id,
            Manifest {
                contents: ManifestContents::RunToPoint {
                    target: target.clone(),
                    snapshot_points,
                },
                completion: Completion::Travel,
                destination: Some(target.clone()),
                expected_duration: Some(expected_duration),
            },
        )?;
        Ok(Reach::Pending)
    }

    /// The live replaying child that can reach `point` soonest
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if no replaying child is alive
    pub(crate) fn nearest_child(&self, point: &ExecutionPoint) -> Result<ChildId> {
        let now = Instant::now();
        self.pool
            .replaying()
            .min_by_key(|child| child.time_to_reach_point(point, &self.checkpoints, now))
            .map(crate::child::ChildProcess::id)
            .ok_or_else(|| RewindError::invariant("no live replaying child"))
    }
}
