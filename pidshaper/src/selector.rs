//! Choosing which process a toggle applies to, and expanding it to its group.

use crate::backends::focus::ForegroundProvider;
use crate::backends::process::ProcessEntry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// Yields the root PID a toggle should act on
pub trait TargetSelector: Send + Sync {
    fn root_pid(&self) -> Option<i32>;
}

/// Whatever process owns the focused window
pub struct FocusSelector {
    provider: Option<Box<dyn ForegroundProvider>>,
}

impl FocusSelector {
    pub fn new(provider: Option<Box<dyn ForegroundProvider>>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> Option<&'static str> {
        self.provider.as_ref().map(|p| p.name())
    }
}

impl TargetSelector for FocusSelector {
    fn root_pid(&self) -> Option<i32> {
        self.provider.as_ref()?.foreground_pid()
    }
}

/// The process the user picked, shared with the control surface
#[derive(Clone, Default)]
pub struct FixedSelector {
    target: Arc<Mutex<Option<i32>>>,
}

impl FixedSelector {
    pub fn new(target: Option<i32>) -> Self {
        Self {
            target: Arc::new(Mutex::new(target)),
        }
    }

    pub fn set(&self, target: Option<i32>) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = target;
    }

    pub fn get(&self) -> Option<i32> {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TargetSelector for FixedSelector {
    fn root_pid(&self) -> Option<i32> {
        self.get()
    }
}

/// `root` plus every descendant in `processes`.
///
/// A root that is no longer in the table yields just `{root}` so a process that
/// already exited can still be toggled off.
pub fn process_group(processes: &[ProcessEntry], root: i32) -> HashSet<i32> {
    let mut group = HashSet::from([root]);
    if !processes.iter().any(|p| p.pid == root) {
        return group;
    }

    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for process in processes {
        if let Some(parent) = process.parent_pid {
            children.entry(parent).or_default().push(process.pid);
        }
    }

    let mut pending = vec![root];
    while let Some(pid) = pending.pop() {
        for child in children.get(&pid).into_iter().flatten() {
            // insert() guards against ppid cycles from PID reuse
            if group.insert(*child) {
                pending.push(*child);
            }
        }
    }

    group
}
