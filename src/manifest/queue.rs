//! Two-priority worklist of async manifests

use std::time::Duration;

use crate::checkpoint::{CheckpointId, RecordedEvent};
use crate::child::{ChildId, ChildProcess};
use crate::point::{ExecutionPoint, Position};

/// Background work claimed by whichever idle child suits it best
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncTask {
    /// Scan the region starting at a saved checkpoint
    Scan {
        /// Region start
        checkpoint: CheckpointId,
    },
    /// Find hits of a position in a scanned region
    FindHits {
        /// Region start
        checkpoint: CheckpointId,
        /// Position searched for
        position: Position,
    },
    /// Steps of the frame at a point
    FrameSteps {
        /// Point inside the frame
        point: ExecutionPoint,
    },
    /// Entry point of the caller of the frame at a point
    ParentFrameEntry {
        /// Point inside the frame
        point: ExecutionPoint,
    },
    /// Frame entry of an event handler
    EventFrameEntry {
        /// The recorded event
        event: RecordedEvent,
    },
    /// Pause data at a point
    PauseData {
        /// Where to collect it
        point: ExecutionPoint,
    },
    /// Evaluate a logpoint at one of its hits
    Logpoint {
        /// Index into the installed logpoints
        logpoint: usize,
        /// The hit
        point: ExecutionPoint,
    },
}

/// A queued unit of background work
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncManifest {
    /// What to do
    pub task: AsyncTask,
    /// Where the child must be first, if anywhere
    pub point: Option<ExecutionPoint>,
    /// Region that, once scanned by a child, lets it run this anywhere
    pub scan_checkpoint: Option<CheckpointId>,
    /// Extra snapshot to take while traveling to `point`
    pub snapshot: Option<ExecutionPoint>,
    /// Only run when no normal work is available
    pub low_priority: bool,
    /// Child that must run this, if any
    pub owner: Option<ChildId>,
    /// How long it should take
    pub expected_duration: Option<Duration>,
}

impl AsyncManifest {
    /// Work that must run at `point`
    #[must_use]
    pub fn at_point(task: AsyncTask, point: ExecutionPoint) -> Self {
        Self {
            task,
            point: Some(point),
            scan_checkpoint: None,
            snapshot: None,
            low_priority: false,
            owner: None,
            expected_duration: None,
        }
    }

    /// Work answered from the scan of the region starting at `checkpoint`;
    /// only a child that scanned it may run this
    #[must_use]
    pub fn from_scan(task: AsyncTask, checkpoint: CheckpointId) -> Self {
        Self {
            task,
            point: None,
            scan_checkpoint: Some(checkpoint),
            snapshot: None,
            low_priority: false,
            owner: None,
            expected_duration: None,
        }
    }

    /// Mark as low priority
    #[must_use]
    pub fn low_priority(mut self) -> Self {
        self.low_priority = true;
        self
    }

    /// Restrict to one child
    #[must_use]
    pub fn owned_by(mut self, owner: Option<ChildId>) -> Self {
        self.owner = owner;
        self
    }

    /// Attach a duration estimate
    #[must_use]
    pub fn expecting(mut self, duration: Duration) -> Self {
        self.expected_duration = Some(duration);
        self
    }

    /// Whether `child` can run this without traveling
    #[must_use]
    pub fn runs_anywhere_on(&self, child: &ChildProcess) -> bool {
        self.scan_checkpoint
            .is_some_and(|checkpoint| child.scanned.contains(&checkpoint))
    }

    fn claimable_by(&self, child: &ChildProcess) -> bool {
        self.owner.map_or(true, |owner| owner == child.id())
    }
}

/// Pending async manifests, normal and low priority
#[derive(Debug, Default)]
pub struct AsyncWorklist {
    normal: Vec<AsyncManifest>,
    low: Vec<AsyncManifest>,
}

impl AsyncWorklist {
    /// Create an empty worklist
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a manifest on the list matching its priority
    pub fn push(&mut self, manifest: AsyncManifest) {
        if manifest.low_priority {
            self.low.push(manifest);
        } else {
            self.normal.push(manifest);
        }
    }

    /// Number of queued manifests
    #[must_use]
    pub fn len(&self) -> usize {
        self.normal.len() + self.low.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an equal task is already queued
    #[must_use]
    pub fn contains(&self, task: &AsyncTask) -> bool {
        self.normal
            .iter()
            .chain(self.low.iter())
            .any(|manifest| manifest.task == *task)
    }

    /// Clear the owner of manifests restricted to `child`
    pub fn release_owner(&mut self, child: ChildId) {
        for manifest in self.normal.iter_mut().chain(self.low.iter_mut()) {
            if manifest.owner == Some(child) {
                manifest.owner = None;
            }
        }
    }

    /// Claim a manifest for `child`
    ///
    /// Stale manifests are dropped first. A manifest whose region `child`
    /// has already scanned wins outright; otherwise the active child gets
    /// nothing, and other children get the point-bound manifest they can
    /// reach soonest. Scan-bound work never goes to a child that did not
    /// scan its region.
    pub fn pick(
        &mut self,
        child: &ChildProcess,
        is_active: bool,
        low_priority: bool,
        mut should_skip: impl FnMut(&AsyncTask) -> bool,
        time_to_reach: impl Fn(&ExecutionPoint) -> Duration,
    ) -> Option<AsyncManifest> {
        let list = if low_priority {
            &mut self.low
        } else {
            &mut self.normal
        };

        list.retain(|manifest| !should_skip(&manifest.task));

        if let Some(index) = list
            .iter()
            .position(|manifest| manifest.claimable_by(child) && manifest.runs_anywhere_on(child))
        {
            return Some(list.remove(index));
        }

        if is_active {
            return None;
        }

        let (index, _) = list
            .iter()
            .enumerate()
            .filter(|(_, manifest)| {
                manifest.claimable_by(child) && manifest.scan_checkpoint.is_none()
            })
            .map(|(index, manifest)| {
                let cost = manifest
                    .point
                    .as_ref()
                    .map_or(Duration::ZERO, &time_to_reach);
                (index, cost)
            })
            .min_by_key(|(_, cost)| *cost)?;
        Some(list.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(checkpoint: CheckpointId) -> AsyncManifest {
        AsyncManifest::at_point(
            AsyncTask::Scan { checkpoint },
            ExecutionPoint::checkpoint(checkpoint),
        )
    }

    fn hits(checkpoint: CheckpointId) -> AsyncManifest {
        AsyncManifest::from_scan(
            AsyncTask::FindHits {
                checkpoint,
                position: Position::breakpoint(1, 1),
            },
            checkpoint,
        )
    }

    fn distance_from(child_at: CheckpointId) -> impl Fn(&ExecutionPoint) -> Duration {
        move |point| {
            Duration::from_millis(point.checkpoint.abs_diff(child_at) as u64 * 100)
        }
    }

    #[test]
    fn test_pick_nearest() {
        let mut worklist = AsyncWorklist::new();
        worklist.push(scan(10));
        worklist.push(scan(4));
        worklist.push(scan(20));

        let child = ChildProcess::replaying(1);
        let picked = worklist
            .pick(&child, false, false, |_| false, distance_from(5))
            .unwrap();
        assert_eq!(picked.task, AsyncTask::Scan { checkpoint: 4 });
        assert_eq!(worklist.len(), 2);
    }

    #[test]
    fn test_active_child_only_takes_scanned_work() {
        let mut worklist = AsyncWorklist::new();
        worklist.push(scan(4));
        worklist.push(hits(10));

        let mut child = ChildProcess::replaying(1);
        assert!(worklist
            .pick(&child, true, false, |_| false, distance_from(5))
            .is_none());

        child.scanned.insert(10);
        let picked = worklist
            .pick(&child, true, false, |_| false, distance_from(5))
            .unwrap();
        assert!(matches!(picked.task, AsyncTask::FindHits { checkpoint: 10, .. }));
    }

    #[test]
    fn test_scanned_work_preferred() {
        let mut worklist = AsyncWorklist::new();
        worklist.push(scan(5));
        worklist.push(hits(30));

        let mut child = ChildProcess::replaying(1);
        child.scanned.insert(30);
        let picked = worklist
            .pick(&child, false, false, |_| false, distance_from(5))
            .unwrap();
        assert!(matches!(picked.task, AsyncTask::FindHits { .. }));
    }

    #[test]
    fn test_scan_bound_work_needs_the_scan() {
        let mut worklist = AsyncWorklist::new();
        worklist.push(hits(10));

        let idle = ChildProcess::replaying(1);
        assert!(worklist
            .pick(&idle, false, false, |_| false, distance_from(10))
            .is_none());
        assert_eq!(worklist.len(), 1);

        let mut scanner = ChildProcess::replaying(2);
        scanner.scanned.insert(10);
        assert!(worklist
            .pick(&scanner, false, false, |_| false, distance_from(40))
            .is_some());
    }

    #[test]
    fn test_stale_manifests_dropped() {
        let mut worklist = AsyncWorklist::new();
        worklist.push(scan(4));
        worklist.push(scan(8));

        let child = ChildProcess::replaying(1);
        let picked = worklist
            .pick(
                &child,
                false,
                false,
                |task| *task == AsyncTask::Scan { checkpoint: 4 },
                distance_from(4),
            )
            .unwrap();
        assert_eq!(picked.task, AsyncTask::Scan { checkpoint: 8 });
        assert!(worklist.is_empty());
    }

    #[test]
    fn test_owner_restriction() {
        let mut worklist = AsyncWorklist::new();
        worklist.push(scan(4).owned_by(Some(2)));

        let other = ChildProcess::replaying(1);
        assert!(worklist
            .pick(&other, false, false, |_| false, distance_from(4))
            .is_none());

        worklist.release_owner(2);
        assert!(worklist
            .pick(&other, false, false, |_| false, distance_from(4))
            .is_some());
    }

    #[test]
    fn test_priorities_are_separate() {
        let mut worklist = AsyncWorklist::new();
        worklist.push(scan(4).low_priority());

        let child = ChildProcess::replaying(1);
        assert!(worklist
            .pick(&child, false, false, |_| false, distance_from(4))
            .is_none());
        assert!(worklist
            .pick(&child, false, true, |_| false, distance_from(4))
            .is_some());
    }
}
