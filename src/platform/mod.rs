//! Host-specific process plumbing: port-to-PID resolution and tree kills.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sysinfo::{Pid, System};

use crate::error::TerminateError;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::NativePlatform;
#[cfg(windows)]
pub use windows::NativePlatform;

/// Operating-system services the terminator depends on.
pub trait Platform: Send + Sync {
    /// PID of the process listening on the local TCP `port`, if any.
    fn listener_pid(&self, port: u16) -> Option<u32>;

    /// Forcefully kills `pid` together with all of its descendants.
    fn kill_tree(&self, pid: u32) -> Result<(), TerminateError>;
}

/// The platform implementation for the current host.
pub fn native() -> Arc<dyn Platform> {
    Arc::new(NativePlatform)
}

/// Collects all transitive children of `root` from a process snapshot.
pub fn descendant_pids(system: &System, root: u32) -> HashSet<u32> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut found = HashSet::new();
    let mut stack = vec![Pid::from_u32(root)];
    while let Some(pid) = stack.pop() {
        for child in children.get(&pid).into_iter().flatten() {
            if child.as_u32() != root && found.insert(child.as_u32()) {
                stack.push(*child);
            }
        }
    }
    found
}
