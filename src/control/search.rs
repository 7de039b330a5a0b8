//! Region scans and memoized searches over scanned regions
//!
//! Every search answer is cached under a structural key. An entry is
//! [`Lookup::AwaitingScan`] until its region is scanned, [`Lookup::Requested`]
//! while exactly one manifest computes it, and [`Lookup::Ready`] afterwards.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointId, RecordedEvent};
use crate::child::{ChildId, ChildPool};
use crate::error::ensure;
use crate::manifest::{AsyncManifest, AsyncTask, ManifestContents, ManifestResponse, ManifestResult};
use crate::point::{ExecutionPoint, Position, PositionKind};
use crate::{Result, RewindError};

use super::{Controller, PauseMode};

/// State of a memoized search
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    /// The region has not been scanned yet; the scan is queued
    AwaitingScan,
    /// A manifest computing the answer is queued or running
    Requested,
    /// The answer
    Ready(T),
}

impl<T> Lookup<T> {
    /// The answer, if known
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::AwaitingScan | Self::Requested => None,
        }
    }
}

type Cache<K, T> = HashMap<K, Lookup<T>>;

/// Memoized search results for the session; never evicted
#[derive(Debug, Default)]
pub(crate) struct SearchCaches {
    hits: Cache<(CheckpointId, Position), Vec<ExecutionPoint>>,
    frame_steps: Cache<ExecutionPoint, Vec<ExecutionPoint>>,
    parent_entries: Cache<ExecutionPoint, Option<ExecutionPoint>>,
    event_entries: Cache<RecordedEvent, Option<ExecutionPoint>>,
    pub(crate) pause_data: HashMap<ExecutionPoint, Value>,
    scans_requested: HashSet<CheckpointId>,
    logpoints_evaluated: HashSet<(usize, ExecutionPoint)>,
}

impl SearchCaches {
    fn hits_mut(&mut self) -> &mut Cache<(CheckpointId, Position), Vec<ExecutionPoint>> {
        &mut self.hits
    }

    fn frame_steps_mut(&mut self) -> &mut Cache<ExecutionPoint, Vec<ExecutionPoint>> {
        &mut self.frame_steps
    }

    fn parent_entries_mut(&mut self) -> &mut Cache<ExecutionPoint, Option<ExecutionPoint>> {
        &mut self.parent_entries
    }

    fn event_entries_mut(&mut self) -> &mut Cache<RecordedEvent, Option<ExecutionPoint>> {
        &mut self.event_entries
    }

    /// Known hits of `position` in every region searched so far
    pub(crate) fn known_hits(&self, position: &Position) -> Vec<ExecutionPoint> {
        let mut hits: Vec<ExecutionPoint> = self
            .hits
            .iter()
            .filter(|((_, key), _)| key == position)
            .filter_map(|(_, lookup)| match lookup {
                Lookup::Ready(points) => Some(points.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect();
        hits.sort();
        hits.dedup();
        hits
    }

    /// Frame steps already known for `point`
    pub(crate) fn known_frame_steps(&self, point: &ExecutionPoint) -> Option<Vec<ExecutionPoint>> {
        match self.frame_steps.get(point) {
            Some(Lookup::Ready(steps)) => Some(steps.clone()),
            _ => None,
        }
    }

    fn awaiting<K: Clone, T>(cache: &Cache<K, T>, mut in_region: impl FnMut(&K) -> bool) -> Vec<K> {
        cache
            .iter()
            .filter(|(key, lookup)| matches!(lookup, Lookup::AwaitingScan) && in_region(*key))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Whether a queued task's answer is already known
pub(crate) fn should_skip(task: &AsyncTask, caches: &SearchCaches, pool: &ChildPool) -> bool {
    fn ready<K: Hash + Eq, T>(cache: &Cache<K, T>, key: &K) -> bool {
        matches!(cache.get(key), Some(Lookup::Ready(_)))
    }

    match task {
        AsyncTask::Scan { checkpoint } => pool.region_scanned(*checkpoint),
        AsyncTask::FindHits {
            checkpoint,
            position,
        } => ready(&caches.hits, &(*checkpoint, position.clone())),
        AsyncTask::FrameSteps { point } => ready(&caches.frame_steps, point),
        AsyncTask::ParentFrameEntry { point } => ready(&caches.parent_entries, point),
        AsyncTask::EventFrameEntry { event } => ready(&caches.event_entries, event),
        AsyncTask::PauseData { point } => caches.pause_data.contains_key(point),
        AsyncTask::Logpoint { logpoint, point } => caches
            .logpoints_evaluated
            .contains(&(*logpoint, point.clone())),
    }
}

impl Controller {
    /// End of the flushed region starting at the saved checkpoint `checkpoint`
    pub(crate) fn region_end(&self, checkpoint: CheckpointId) -> Option<CheckpointId> {
        self.checkpoints
            .next_saved_checkpoint(checkpoint)
            .filter(|&end| end <= self.last_flush_checkpoint)
    }

    /// Saved checkpoints starting a flushed region
    pub(crate) fn flushed_regions(&self) -> Vec<CheckpointId> {
        self.checkpoints
            .saved_checkpoints()
            .filter(|&checkpoint| checkpoint < self.last_flush_checkpoint)
            .collect()
    }

    /// Queue a scan of the region starting at `checkpoint` unless one is
    /// done or queued
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if `checkpoint` is not saved
    pub fn scan_recording(&mut self, checkpoint: CheckpointId) -> Result<()> {
        if self.pool.region_scanned(checkpoint) || self.caches.scans_requested.contains(&checkpoint)
        {
            return Ok(());
        }
        ensure(self.checkpoints.is_saved(checkpoint), || {
            format!("scan of unsaved checkpoint {checkpoint}")
        })?;
        let Some(end) = self.region_end(checkpoint) else {
            debug!("Region {} is not flushed yet", checkpoint);
            return Ok(());
        };

        let owner = self
            .checkpoints
            .get(checkpoint)?
            .owner
            .filter(|&owner| self.pool.get(owner).is_ok_and(|child| child.is_live()));
        self.caches.scans_requested.insert(checkpoint);
        self.worklist.push(
            AsyncManifest::at_point(
                AsyncTask::Scan { checkpoint },
                ExecutionPoint::checkpoint(checkpoint),
            )
            .owned_by(owner)
            .expecting(self.checkpoints.range_duration(checkpoint, end)),
        );
        Ok(())
    }

    /// Shared memo protocol: serve the cached state, else wait for the
    /// region scan, else queue `task` on any child that scanned `region`
    fn memoized<K, T>(
        &mut self,
        region: CheckpointId,
        key: K,
        task: AsyncTask,
        cache: fn(&mut SearchCaches) -> &mut Cache<K, T>,
    ) -> Result<Lookup<T>>
    where
        K: Hash + Eq,
        T: Clone,
    {
        if let Some(state) = cache(&mut self.caches).get(&key) {
            return Ok(state.clone());
        }

        if !self.pool.region_scanned(region) {
            self.scan_recording(region)?;
            cache(&mut self.caches).insert(key, Lookup::AwaitingScan);
            self.poke_children()?;
            return Ok(Lookup::AwaitingScan);
        }

        cache(&mut self.caches).insert(key, Lookup::Requested);
        self.worklist.push(AsyncManifest::from_scan(task, region));
        self.poke_children()?;
        Ok(Lookup::Requested)
    }

    /// Hits of a script breakpoint in the region starting at `checkpoint`
    ///
    /// # Errors
    ///
    /// Returns an invariant violation for frame positions, which are found
    /// from frame steps instead
    pub fn find_hits(
        &mut self,
        checkpoint: CheckpointId,
        position: &Position,
    ) -> Result<Lookup<Vec<ExecutionPoint>>> {
        ensure(position.kind.is_script_breakpoint(), || {
            format!("hit search for {:?} position", position.kind)
        })?;
        self.memoized(
            checkpoint,
            (checkpoint, position.clone()),
            AsyncTask::FindHits {
                checkpoint,
                position: position.clone(),
            },
            SearchCaches::hits_mut,
        )
    }

    /// Steps of the frame executing at `point`
    ///
    /// # Errors
    ///
    /// Returns error if the region scan cannot be queued
    pub fn find_frame_steps(&mut self, point: &ExecutionPoint) -> Result<Lookup<Vec<ExecutionPoint>>> {
        let region = self.checkpoints.saved_checkpoint(point.checkpoint);
        self.memoized(
            region,
            point.clone(),
            AsyncTask::FrameSteps {
                point: point.clone(),
            },
            SearchCaches::frame_steps_mut,
        )
    }

    /// Where the caller of the frame at `point` was entered
    ///
    /// # Errors
    ///
    /// Returns error if the region scan cannot be queued
    pub fn find_parent_frame_entry_point(
        &mut self,
        point: &ExecutionPoint,
    ) -> Result<Lookup<Option<ExecutionPoint>>> {
        let region = self.checkpoints.saved_checkpoint(point.checkpoint);
        self.memoized(
            region,
            point.clone(),
            AsyncTask::ParentFrameEntry {
                point: point.clone(),
            },
            SearchCaches::parent_entries_mut,
        )
    }

    /// Frame entry of the handler run for a recorded event
    ///
    /// # Errors
    ///
    /// Returns error if the region scan cannot be queued
    pub fn find_event_frame_entry(
        &mut self,
        event: &RecordedEvent,
    ) -> Result<Lookup<Option<ExecutionPoint>>> {
        let region = self.checkpoints.saved_checkpoint(event.point.checkpoint);
        self.memoized(
            region,
            event.clone(),
            AsyncTask::EventFrameEntry {
                event: event.clone(),
            },
            SearchCaches::event_entries_mut,
        )
    }

    /// Cached hits of `position` in the region starting at `checkpoint`
    #[must_use]
    pub fn cached_hits(&self, checkpoint: CheckpointId, position: &Position) -> Option<&[ExecutionPoint]> {
        match self.caches.hits.get(&(checkpoint, position.clone())) {
            Some(Lookup::Ready(points)) => Some(points),
            _ => None,
        }
    }

    /// Manifest contents for an async task
    pub(crate) fn task_contents(&self, task: &AsyncTask) -> Result<ManifestContents> {
        let region_end = |checkpoint: CheckpointId| {
            self.region_end(checkpoint).ok_or_else(|| {
                RewindError::invariant(format!("region {checkpoint} is not flushed"))
            })
        };

        Ok(match task {
            AsyncTask::Scan { checkpoint } => ManifestContents::ScanRecording {
                checkpoint: *checkpoint,
                end_checkpoint: region_end(*checkpoint)?,
            },
            AsyncTask::FindHits {
                checkpoint,
                position,
            } => ManifestContents::FindHits {
                checkpoint: *checkpoint,
                end_checkpoint: region_end(*checkpoint)?,
                position: position.clone(),
            },
            AsyncTask::FrameSteps { point } => ManifestContents::FindFrameSteps {
                point: point.clone(),
            },
            AsyncTask::ParentFrameEntry { point } => ManifestContents::FindParentFrameEntryPoint {
                point: point.clone(),
            },
            AsyncTask::EventFrameEntry { event } => ManifestContents::FindEventFrameEntry {
                point: event.point.clone(),
                event: event.name.clone(),
            },
            AsyncTask::PauseData { .. } => ManifestContents::GetPauseData,
            AsyncTask::Logpoint { logpoint, .. } => {
                let logpoint = self.logpoints.get(*logpoint).ok_or_else(|| {
                    RewindError::invariant(format!("unknown logpoint {logpoint}"))
                })?;
                ManifestContents::HitLogpoint {
                    text: logpoint.text.clone(),
                    condition: logpoint.condition.clone(),
                }
            }
        })
    }

    /// Store an async task's answer
    pub(crate) fn task_finished(
        &mut self,
        id: ChildId,
        manifest: AsyncManifest,
        response: ManifestResponse,
        elapsed: Duration,
    ) -> Result<()> {
        let result = response.result;
        match manifest.task {
            AsyncTask::Scan { checkpoint } => {
                self.on_region_scanned(id, checkpoint, result, elapsed)
            }
            AsyncTask::FindHits {
                checkpoint,
                position,
            } => {
                let hits = points(result);
                for index in self.logpoints_at(&position) {
                    self.queue_logpoint_hits(index, &hits);
                }
                self.caches
                    .hits
                    .insert((checkpoint, position), Lookup::Ready(hits));
                self.poke_children()
            }
            AsyncTask::FrameSteps { point } => {
                self.frame_steps_found(&point, points(result));
                let settling = matches!(self.pause.mode, PauseMode::Arriving | PauseMode::Paused);
                if settling && point == self.pause.point {
                    self.prefetch(&point);
                }
                Ok(())
            }
            AsyncTask::ParentFrameEntry { point } => {
                self.caches
                    .parent_entries
                    .insert(point, Lookup::Ready(single_point(result)));
                Ok(())
            }
            AsyncTask::EventFrameEntry { event } => {
                self.caches
                    .event_entries
                    .insert(event, Lookup::Ready(single_point(result)));
                Ok(())
            }
            AsyncTask::PauseData { point } => {
                let data = match result {
                    ManifestResult::Value(value) => value,
                    _ => Value::Null,
                };
                self.caches.pause_data.insert(point, data);
                Ok(())
            }
            AsyncTask::Logpoint { logpoint, point } => {
                let message = match result {
                    ManifestResult::Value(value) => value,
                    _ => Value::Null,
                };
                self.caches
                    .logpoints_evaluated
                    .insert((logpoint, point.clone()));
                if let Some(debugger) = self.debugger() {
                    debugger.on_new_console_message(&point, &message);
                }
                Ok(())
            }
        }
    }

    /// One frame-steps answer also serves every step of the same frame and
    /// the parent lookups of the frames it calls
    fn frame_steps_found(&mut self, point: &ExecutionPoint, steps: Vec<ExecutionPoint>) {
        let frame = point.frame_index();
        let entry = steps
            .iter()
            .find(|step| {
                step.frame_index() == frame
                    && step
                        .position
                        .as_ref()
                        .is_some_and(|p| p.kind == PositionKind::EnterFrame)
            })
            .cloned();

        for step in &steps {
            if step.frame_index() == frame {
                self.caches
                    .frame_steps
                    .entry(step.clone())
                    .or_insert_with(|| Lookup::Ready(steps.clone()));
            } else if let Some(entry) = &entry {
                self.caches
                    .parent_entries
                    .entry(step.clone())
                    .or_insert_with(|| Lookup::Ready(Some(entry.clone())));
            }
        }
        self.caches
            .frame_steps
            .insert(point.clone(), Lookup::Ready(steps));
    }

    fn on_region_scanned(
        &mut self,
        id: ChildId,
        checkpoint: CheckpointId,
        result: ManifestResult,
        elapsed: Duration,
    ) -> Result<()> {
        let first = !self.pool.region_scanned(checkpoint);
        self.pool.get_mut(id)?.scanned.insert(checkpoint);

        let info = self.checkpoints.entry(checkpoint)?;
        if first && info.scan_time.is_none() {
            info.scan_time = Some(Instant::now());
            info.scan_duration = Some(elapsed);
        }
        if let ManifestResult::Scan {
            debugger_statements,
            events,
        } = result
        {
            info.debugger_statements = debugger_statements;
            info.events = events;
        }
        info!("Child {} scanned region {}", id, checkpoint);

        self.requeue_awaiting(checkpoint)?;
        let positions: Vec<Position> = self
            .logpoints
            .iter()
            .map(|logpoint| logpoint.position.clone())
            .filter(|position| position.kind.is_script_breakpoint())
            .collect();
        for position in positions {
            self.find_hits(checkpoint, &position)?;
        }
        self.poke_children()
    }

    /// Re-issue lookups that were waiting for the scan of `checkpoint`
    fn requeue_awaiting(&mut self, checkpoint: CheckpointId) -> Result<()> {
        let in_region = |registry: &crate::checkpoint::CheckpointRegistry, point: &ExecutionPoint| {
            registry.saved_checkpoint(point.checkpoint) == checkpoint
        };

        let hits = SearchCaches::awaiting(&self.caches.hits, |(region, _)| *region == checkpoint);
        let steps = SearchCaches::awaiting(&self.caches.frame_steps, |point| {
            in_region(&self.checkpoints, point)
        });
        let parents = SearchCaches::awaiting(&self.caches.parent_entries, |point| {
            in_region(&self.checkpoints, point)
        });
        let events = SearchCaches::awaiting(&self.caches.event_entries, |event| {
            in_region(&self.checkpoints, &event.point)
        });

        for key in hits {
            self.caches.hits.remove(&key);
            self.find_hits(key.0, &key.1)?;
        }
        for point in steps {
            self.caches.frame_steps.remove(&point);
            self.find_frame_steps(&point)?;
        }
        for point in parents {
            self.caches.parent_entries.remove(&point);
            self.find_parent_frame_entry_point(&point)?;
        }
        for event in events {
            self.caches.event_entries.remove(&event);
            self.find_event_frame_entry(&event)?;
        }
        Ok(())
    }

    /// Forget that regions scanned only by a crashed child were requested
    pub(crate) fn forget_scans(&mut self, regions: &[CheckpointId]) -> Result<()> {
        for &region in regions {
            if !self.pool.region_scanned(region) {
                self.caches.scans_requested.remove(&region);
                self.scan_recording(region)?;
            }
        }
        Ok(())
    }

    fn logpoints_at(&self, position: &Position) -> Vec<usize> {
        self.logpoints
            .iter()
            .enumerate()
            .filter(|(_, logpoint)| logpoint.position == *position)
            .map(|(index, _)| index)
            .collect()
    }

    /// Queue one low-priority evaluation per unevaluated hit
    pub(crate) fn queue_logpoint_hits(&mut self, logpoint: usize, hits: &[ExecutionPoint]) {
        for hit in hits {
            let task = AsyncTask::Logpoint {
                logpoint,
                point: hit.clone(),
            };
            if should_skip(&task, &self.caches, &self.pool) || self.worklist.contains(&task) {
                continue;
            }
            self.worklist
                .push(AsyncManifest::at_point(task, hit.clone()).low_priority());
        }
    }

    /// Progress-fraction ranges no live child has scanned, plus the
    /// unflushed tail of the recording
    #[must_use]
    pub fn unscanned_regions(&self) -> Vec<(f64, f64)> {
        let total = self.checkpoints.elapsed_before(self.checkpoints.last_id());
        if total.is_zero() {
            return vec![(0.0, 1.0)];
        }
        let fraction = |checkpoint: CheckpointId| {
            self.checkpoints.elapsed_before(checkpoint).as_secs_f64() / total.as_secs_f64()
        };

        let mut regions: Vec<(f64, f64)> = Vec::new();
        let gaps = self
            .flushed_regions()
            .into_iter()
            .filter(|&region| !self.pool.region_scanned(region))
            .filter_map(|region| Some((fraction(region), fraction(self.region_end(region)?))));
        let tail = (self.last_flush_checkpoint < self.checkpoints.last_id())
            .then(|| (fraction(self.last_flush_checkpoint), 1.0));

        for (start, end) in gaps.chain(tail) {
            match regions.last_mut() {
                Some(last) if last.1 >= start => last.1 = last.1.max(end),
                _ => regions.push((start, end)),
            }
        }
        regions
    }
}

fn points(result: ManifestResult) -> Vec<ExecutionPoint> {
    match result {
        ManifestResult::Points(mut points) => {
            points.sort();
            points
        }
        _ => Vec::new(),
    }
}

fn single_point(result: ManifestResult) -> Option<ExecutionPoint> {
    match result {
        ManifestResult::Point(point) => point,
        _ => None,
    }
}
