//! Process-wide mutual exclusion on cluster names
//!
//! HTTP mutators acquire the name *before* launching the background task and
//! the guard travels into the task, so a duplicate request while a lifecycle
//! run is active is rejected immediately. Entries are reclaimed as soon as
//! the guard drops.

use std::sync::Arc;

use dashmap::DashMap;

/// Keyed busy-set over cluster names
#[derive(Clone, Default)]
pub struct TaskLocks {
    held: Arc<DashMap<String, ()>>,
}

impl TaskLocks {
    /// Fresh lock set
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take exclusive ownership of a cluster name
    ///
    /// Returns `None` when another task already holds it.
    pub fn try_acquire(&self, cluster_name: &str) -> Option<TaskGuard> {
        use dashmap::mapref::entry::Entry;
        match self.held.entry(cluster_name.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(TaskGuard {
                    held: Arc::clone(&self.held),
                    name: cluster_name.to_string(),
                })
            }
        }
    }

    /// True when a task currently owns the name
    pub fn is_held(&self, cluster_name: &str) -> bool {
        self.held.contains_key(cluster_name)
    }
}

/// Ownership of one cluster name; released on drop
pub struct TaskGuard {
    held: Arc<DashMap<String, ()>>,
    name: String,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.held.remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_guard_drops() {
        let locks = TaskLocks::new();

        let guard = locks.try_acquire("k1").expect("first acquire");
        assert!(locks.try_acquire("k1").is_none());
        // other names are unaffected
        assert!(locks.try_acquire("k2").is_some());

        drop(guard);
        assert!(locks.try_acquire("k1").is_some());
    }

    #[test]
    fn exactly_one_of_many_concurrent_acquires_wins() {
        let locks = TaskLocks::new();
        let winners: Vec<_> = (0..32)
            .map(|_| locks.try_acquire("contested"))
            .filter(|g| g.is_some())
            .collect();
        assert_eq!(winners.len(), 1);
    }
}
