//! Speculative pause data around the pause point
//!
//! Planning is a pure function of the pause point, the breakpoint hits and
//! whatever frame steps are already known. The controller turns a plan into
//! low-priority `GetPauseData` work.

use std::collections::VecDeque;

use tracing::debug;

use crate::config::PrefetchConfig;
use crate::manifest::{AsyncManifest, AsyncTask};
use crate::point::ExecutionPoint;
use crate::Result;

use super::Controller;

/// Points worth collecting pause data for, nearest first
///
/// Takes up to `hits_per_side` breakpoint hits on each side of `origin`,
/// then walks the step graph breadth first to `depth`: from each point,
/// the previous and next step in the same frame and the first callee
/// entry after it. `steps` returns the known steps of a point's frame, or
/// `None` when they are unknown.
pub fn plan_prefetch<F>(
    origin: &ExecutionPoint,
    hits: &[ExecutionPoint],
    steps: F,
    config: &PrefetchConfig,
) -> Vec<ExecutionPoint>
where
    F: Fn(&ExecutionPoint) -> Option<Vec<ExecutionPoint>>,
{
    let mut plan: Vec<ExecutionPoint> = Vec::new();
    let push = |plan: &mut Vec<ExecutionPoint>, point: ExecutionPoint| {
        if point != *origin && !plan.contains(&point) {
            plan.push(point);
        }
    };

    let mut sorted = hits.to_vec();
    sorted.sort();
    sorted.dedup();
    let before = sorted
        .iter()
        .rev()
        .filter(|hit| *hit < origin)
        .take(config.hits_per_side);
    let after = sorted
        .iter()
        .filter(|hit| *hit > origin)
        .take(config.hits_per_side);
    for hit in before.chain(after) {
        push(&mut plan, hit.clone());
    }

    let mut budget = config.steps;
    let mut queue = VecDeque::from([(origin.clone(), 0)]);
    let mut visited = vec![origin.clone()];
    while let Some((point, depth)) = queue.pop_front() {
        if budget == 0 {
            break;
        }
        if depth >= config.depth {
            continue;
        }
        let Some(known) = steps(&point) else {
            continue;
        };
        for target in step_targets(&point, &known) {
            if budget == 0 {
                break;
            }
            if visited.contains(&target) {
                continue;
            }
            visited.push(target.clone());
            push(&mut plan, target.clone());
            budget -= 1;
            queue.push_back((target, depth + 1));
        }
    }
    plan
}

/// Step-over targets in both directions plus the step-in target
fn step_targets(point: &ExecutionPoint, steps: &[ExecutionPoint]) -> Vec<ExecutionPoint> {
    let Some(frame) = point.frame_index() else {
        return Vec::new();
    };
    let same_frame = |step: &&ExecutionPoint| step.frame_index() == Some(frame);
    let previous = steps.iter().filter(same_frame).filter(|step| *step < point).max();
    let next = steps.iter().filter(same_frame).filter(|step| *step > point).min();
    let callee = steps
        .iter()
        .filter(|step| step.frame_index() == Some(frame + 1) && *step > point)
        .min();

    previous
        .into_iter()
        .chain(next)
        .chain(callee)
        .cloned()
        .collect()
}

impl Controller {
    /// Queue pause data collection around `point`
    ///
    /// Best effort; failures are logged and dropped.
    pub(crate) fn prefetch(&mut self, point: &ExecutionPoint) {
        if let Err(e) = self.queue_prefetch(point) {
            debug!("Prefetch around checkpoint {} skipped: {}", point.checkpoint, e);
        }
    }

    fn queue_prefetch(&mut self, point: &ExecutionPoint) -> Result<()> {
        if !point.is_checkpoint() {
            self.find_frame_steps(point)?;
        }

        let mut hits: Vec<ExecutionPoint> = self
            .breakpoints
            .iter()
            .flat_map(|position| self.caches.known_hits(position))
            .collect();
        hits.sort();
        hits.dedup();

        let caches = &self.caches;
        let plan = plan_prefetch(
            point,
            &hits,
            |step| caches.known_frame_steps(step),
            &self.config.prefetch,
        );

        let mut queued = 0;
        for target in std::iter::once(point.clone()).chain(plan) {
            let task = AsyncTask::PauseData {
                point: target.clone(),
            };
            if self.caches.pause_data.contains_key(&target) || self.worklist.contains(&task) {
                continue;
            }
            self.worklist
                .push(AsyncManifest::at_point(task, target).low_priority());
            queued += 1;
        }
        if queued > 0 {
            debug!(
                "Queued pause data for {} points around checkpoint {}",
                queued, point.checkpoint
            );
        }
        Ok(())
    }
}
