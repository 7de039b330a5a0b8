//! Child pool with frontier tracking and round-robin assignment

use std::collections::BTreeMap;

use crate::{Result, RewindError};

use super::{ChildId, ChildProcess, Role};

/// Every child process of the session
#[derive(Debug, Default)]
pub struct ChildPool {
    children: BTreeMap<ChildId, ChildProcess>,
    frontier: Option<ChildId>,
    last_assigned: Option<ChildId>,
}

impl ChildPool {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child
    pub fn add(&mut self, child: ChildProcess) {
        self.children.insert(child.id(), child);
    }

    /// Make `id` the frontier child
    ///
    /// # Errors
    ///
    /// Returns error if the child is unknown
    pub fn set_frontier(&mut self, id: ChildId) -> Result<()> {
        self.get(id)?;
        self.frontier = Some(id);
        Ok(())
    }

    /// The frontier child id
    ///
    /// # Errors
    ///
    /// Returns an invariant violation before initialization
    pub fn frontier_id(&self) -> Result<ChildId> {
        self.frontier
            .ok_or_else(|| RewindError::invariant("no frontier child"))
    }

    /// Whether `id` is the frontier child
    #[must_use]
    pub fn is_frontier(&self, id: ChildId) -> bool {
        self.frontier == Some(id)
    }

    /// Look up a child
    ///
    /// # Errors
    ///
    /// Returns error if the child is unknown
    pub fn get(&self, id: ChildId) -> Result<&ChildProcess> {
        self.children.get(&id).ok_or(RewindError::UnknownChild(id))
    }

    /// Look up a child mutably
    ///
    /// # Errors
    ///
    /// Returns error if the child is unknown
    pub fn get_mut(&mut self, id: ChildId) -> Result<&mut ChildProcess> {
        self.children
            .get_mut(&id)
            .ok_or(RewindError::UnknownChild(id))
    }

    /// All children, crashed ones included
    pub fn iter(&self) -> impl Iterator<Item = &ChildProcess> {
        self.children.values()
    }

    /// Live replaying children other than the frontier
    pub fn replaying(&self) -> impl Iterator<Item = &ChildProcess> {
        self.children.values().filter(move |child| {
            child.is_live() && child.role() == Role::Replaying && !self.is_frontier(child.id())
        })
    }

    /// Ids of live replaying children
    #[must_use]
    pub fn replaying_ids(&self) -> Vec<ChildId> {
        self.replaying().map(ChildProcess::id).collect()
    }

    /// Pick the next live replaying child in round-robin order
    ///
    /// Picks the first live id after the last one assigned, wrapping
    /// around. Before any assignment the lowest live id counts as the last.
    pub fn next_assignee(&mut self) -> Option<ChildId> {
        let live = self.replaying_ids();
        let first = *live.first()?;
        let after = self.last_assigned.unwrap_or(first);
        let next = live.iter().copied().find(|&id| id > after).unwrap_or(first);
        self.last_assigned = Some(next);
        Some(next)
    }

    /// The child picked by the last [`ChildPool::next_assignee`] call
    #[must_use]
    pub fn last_assigned(&self) -> Option<ChildId> {
        self.last_assigned
    }

    /// Whether any live child has scanned the region starting at `checkpoint`
    #[must_use]
    pub fn region_scanned(&self, checkpoint: usize) -> bool {
        self.children
            .values()
            .any(|child| child.is_live() && child.scanned.contains(&checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(replaying: usize) -> ChildPool {
        let mut pool = ChildPool::new();
        pool.add(ChildProcess::recording(100));
        pool.set_frontier(100).unwrap();
        for id in 0..replaying {
            pool.add(ChildProcess::replaying(id));
        }
        pool
    }

    #[test]
    fn test_frontier_excluded() {
        let pool = pool_with(2);
        assert_eq!(pool.replaying_ids(), vec![0, 1]);
        assert!(pool.is_frontier(100));
        assert_eq!(pool.frontier_id().unwrap(), 100);
    }

    #[test]
    fn test_round_robin_order() {
        let mut pool = pool_with(4);
        let picks: Vec<_> = (0..4).map(|_| pool.next_assignee().unwrap()).collect();
        assert_eq!(picks, vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_round_robin_skips_crashed() {
        let mut pool = pool_with(3);
        pool.get_mut(1).unwrap().crashed = true;
        let picks: Vec<_> = (0..4).map(|_| pool.next_assignee().unwrap()).collect();
        assert_eq!(picks, vec![2, 0, 2, 0]);
    }

    #[test]
    fn test_round_robin_no_repeat_after_crash() {
        let mut pool = pool_with(3);
        assert_eq!(pool.next_assignee(), Some(1));
        assert_eq!(pool.next_assignee(), Some(2));

        pool.get_mut(0).unwrap().crashed = true;
        assert_eq!(pool.next_assignee(), Some(1));
        assert_eq!(pool.next_assignee(), Some(2));
        assert_eq!(pool.last_assigned(), Some(2));
    }

    #[test]
    fn test_round_robin_empty() {
        let mut pool = pool_with(0);
        assert!(pool.next_assignee().is_none());
        assert!(pool.get(7).is_err());
    }

    #[test]
    fn test_region_scanned_ignores_crashed() {
        let mut pool = pool_with(2);
        pool.get_mut(0).unwrap().scanned.insert(5);
        assert!(pool.region_scanned(5));
        pool.get_mut(0).unwrap().crashed = true;
        assert!(!pool.region_scanned(5));
    }
}
