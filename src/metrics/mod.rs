#![allow(missing_docs)]
//! CPU accounting for managed process trees.
use std::collections::{HashMap, HashSet, VecDeque, hash_map::Entry};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::constants::CPU_HISTORY_LEN;
use crate::platform::descendant_pids;

/// Rolling window of the most recent aggregated CPU percentages of a script.
///
/// Always holds exactly [`CPU_HISTORY_LEN`] values, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuHistory {
    samples: VecDeque<f32>,
}

impl Default for CpuHistory {
    fn default() -> Self {
        Self {
            samples: std::iter::repeat_n(0.0, CPU_HISTORY_LEN).collect(),
        }
    }
}

impl CpuHistory {
    /// A window of zeros.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refills the window with zeros.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.samples.extend(std::iter::repeat_n(0.0, CPU_HISTORY_LEN));
    }

    /// Appends a sample, evicting the oldest one.
    pub fn push(&mut self, percent: f32) {
        if self.samples.len() >= CPU_HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(percent);
    }

    /// Most recent sample.
    pub fn latest(&self) -> f32 {
        self.samples.back().copied().unwrap_or(0.0)
    }

    /// Number of samples held; always the window length.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Copy of the window, oldest first.
    pub fn to_vec(&self) -> Vec<f32> {
        self.samples.iter().copied().collect()
    }
}

/// Read access to the host's process table.
///
/// Implementations are refreshed once per sampling pass and then queried for
/// the process tree of every running script.
pub trait ProcessTable: Send {
    /// Takes a fresh snapshot of the table.
    fn refresh(&mut self);

    /// All transitive children of `root`, excluding `root` itself.
    fn descendants(&self, root: u32) -> HashSet<u32>;

    /// CPU usage of `pid` since the previous refresh, or `None` when the
    /// process vanished or cannot be inspected.
    fn cpu_usage(&self, pid: u32) -> Option<f32>;
}

/// [`ProcessTable`] backed by `sysinfo`.
pub struct SysinfoTable {
    system: System,
}

impl SysinfoTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoTable {
    fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );
    }

    fn descendants(&self, root: u32) -> HashSet<u32> {
        descendant_pids(&self.system, root)
    }

    fn cpu_usage(&self, pid: u32) -> Option<f32> {
        self.system
            .process(Pid::from_u32(pid))
            .map(|process| process.cpu_usage())
    }
}

/// Per-PID sampler. Creating a sampler primes it; the reading taken in the
/// pass that discovers a PID only establishes the reference point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PidSampler {
    last_percent: f32,
}

/// The samplers tracking one script's process tree.
#[derive(Debug, Clone)]
pub struct CpuSampleSet {
    root: u32,
    samplers: HashMap<u32, PidSampler>,
}

impl CpuSampleSet {
    /// Creates a set tracking only `root`, already primed.
    pub fn new(root: u32) -> Self {
        let mut samplers = HashMap::new();
        samplers.insert(root, PidSampler::default());
        Self { root, samplers }
    }

    /// Root PID of the tracked tree.
    pub fn root(&self) -> u32 {
        self.root
    }

    /// PIDs currently tracked by this set.
    pub fn tracked(&self) -> HashSet<u32> {
        self.samplers.keys().copied().collect()
    }

    /// Reading taken for `pid` in the most recent pass.
    pub fn last_reading(&self, pid: u32) -> Option<f32> {
        self.samplers.get(&pid).map(|sampler| sampler.last_percent)
    }

    /// Reconciles the tracked PIDs with the live tree and returns the summed
    /// CPU usage of the PIDs sampled in this pass.
    ///
    /// Newly discovered descendants are primed and contribute nothing until
    /// the next pass. PIDs that vanished or cannot be read are dropped.
    pub fn sample(&mut self, table: &dyn ProcessTable) -> f32 {
        let mut live = table.descendants(self.root);
        live.insert(self.root);

        self.samplers.retain(|pid, _| live.contains(pid));

        let mut total = 0.0;
        for pid in live {
            let reading = table.cpu_usage(pid);
            match self.samplers.entry(pid) {
                Entry::Vacant(slot) => {
                    if reading.is_some() {
                        debug!("Tracking new descendant PID {pid} of {}", self.root);
                        slot.insert(PidSampler::default());
                    }
                }
                Entry::Occupied(mut slot) => match reading {
                    Some(percent) => {
                        slot.get_mut().last_percent = percent;
                        total += percent;
                    }
                    None => {
                        debug!("Dropping PID {pid}; it can no longer be sampled");
                        slot.remove();
                    }
                },
            }
        }

        total
    }
}

/// Periodic CPU accounting over the host process table.
pub struct CpuMonitor {
    table: Box<dyn ProcessTable>,
}

impl CpuMonitor {
    /// Creates a monitor over the native process table. Returns `None` when
    /// process accounting is unavailable on this host.
    pub fn new() -> Option<Self> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            warn!("Process accounting unsupported on this host; CPU sampling disabled");
            return None;
        }
        Some(Self::with_table(Box::new(SysinfoTable::new())))
    }

    pub fn with_table(table: Box<dyn ProcessTable>) -> Self {
        Self { table }
    }

    /// Starts tracking a freshly launched process tree.
    pub fn register(&self, root: u32) -> CpuSampleSet {
        CpuSampleSet::new(root)
    }

    /// Refreshes the process table. Called once at the start of each pass.
    pub fn refresh(&mut self) {
        self.table.refresh();
    }

    pub fn sample(&self, set: &mut CpuSampleSet) -> f32 {
        set.sample(self.table.as_ref())
    }
}
