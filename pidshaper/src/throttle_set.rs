use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

/// The set of PIDs whose outbound traffic is currently shaped.
///
/// Cloning yields another handle onto the same set. The interception worker
/// reads it once per packet while the control surface mutates it; a reader may
/// see the state from just before a concurrent toggle.
#[derive(Debug, Clone, Default)]
pub struct ThrottleSet {
    pids: Arc<RwLock<HashSet<i32>>>,
}

impl ThrottleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.pids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&pid)
    }

    /// Add a whole process group in one write so readers never see half of it
    pub fn add_group(&self, group: &HashSet<i32>) {
        let mut pids = self.pids.write().unwrap_or_else(PoisonError::into_inner);
        pids.extend(group.iter().copied());
    }

    pub fn remove_group(&self, group: &HashSet<i32>) {
        let mut pids = self.pids.write().unwrap_or_else(PoisonError::into_inner);
        pids.retain(|pid| !group.contains(pid));
    }

    pub fn clear(&self) {
        self.pids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Sorted copy for display
    pub fn snapshot(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self
            .pids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        pids.sort_unstable();
        pids
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(pids: &[i32]) -> HashSet<i32> {
        pids.iter().copied().collect()
    }

    #[test]
    fn test_add_and_remove_group() {
        let set = ThrottleSet::new();
        set.add_group(&group(&[100, 101, 102]));
        assert_eq!(set.snapshot(), vec![100, 101, 102]);

        set.remove_group(&group(&[101, 102]));
        assert_eq!(set.snapshot(), vec![100]);
        assert!(set.contains(100));
        assert!(!set.contains(101));
    }

    #[test]
    fn test_clones_share_state() {
        let set = ThrottleSet::new();
        let reader = set.clone();
        set.add_group(&group(&[5]));
        assert!(reader.contains(5));

        reader.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_concurrent_readers_see_whole_groups() {
        let set = ThrottleSet::new();
        let g = group(&(1000..1050).collect::<Vec<_>>());

        let reader = set.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..2000 {
                let len = reader.len();
                assert!(len == 0 || len == 50, "saw partial group of {}", len);
            }
        });

        for _ in 0..200 {
            set.add_group(&g);
            set.remove_group(&g);
        }
        handle.join().unwrap();
    }
}
