//! The managed set of scripts and their per-script runtime state.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::process::Child;
use tracing::warn;

use crate::config::ScriptDefinition;
use crate::error::SupervisorError;
use crate::metrics::{CpuHistory, CpuSampleSet};
use crate::output::RawOutputLog;

/// Generation counter distinguishing successive launches of the same script.
pub type LaunchId = u64;

/// Lifecycle state of a script's process record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ScriptStatus {
    Stopped,
    Running,
    /// The last launch failed; carries the reason.
    Error(String),
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptStatus::Stopped => f.write_str("Stopped"),
            ScriptStatus::Running => f.write_str("Running"),
            ScriptStatus::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

/// A launched process (or a failed launch attempt).
#[derive(Debug)]
pub struct ProcessRecord {
    pub(crate) status: ScriptStatus,
    pub(crate) pid: Option<u32>,
    pub(crate) child: Option<Child>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) launch_id: LaunchId,
    pub(crate) samples: Option<CpuSampleSet>,
}

impl ProcessRecord {
    pub(crate) fn running(child: Child, launch_id: LaunchId, samples: Option<CpuSampleSet>) -> Self {
        Self {
            status: ScriptStatus::Running,
            pid: Some(child.id()),
            child: Some(child),
            started_at: Utc::now(),
            launch_id,
            samples,
        }
    }

    pub(crate) fn failed(reason: String, launch_id: LaunchId) -> Self {
        Self {
            status: ScriptStatus::Error(reason),
            pid: None,
            child: None,
            started_at: Utc::now(),
            launch_id,
            samples: None,
        }
    }

    /// Lifecycle state of this launch.
    pub fn status(&self) -> &ScriptStatus {
        &self.status
    }

    /// Root PID; cleared once the launch is stopped.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the launch was attempted.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Generation of this launch.
    pub fn launch_id(&self) -> LaunchId {
        self.launch_id
    }

    /// Whether the record is in the `Running` state.
    pub fn is_running(&self) -> bool {
        self.status == ScriptStatus::Running
    }

    /// Polls the process handle without blocking. Returns `true` while the
    /// root process has not exited.
    pub(crate) fn poll_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(err) => {
                warn!("Failed to poll PID {}: {err}", child.id());
                true
            }
        }
    }
}

/// Runtime state kept alongside each definition.
#[derive(Debug, Default)]
pub struct ScriptRuntimeState {
    pub(crate) record: Option<ProcessRecord>,
    pub(crate) history: CpuHistory,
    pub(crate) output: RawOutputLog,
}

impl ScriptRuntimeState {
    /// Record of the most recent launch, if any.
    pub fn record(&self) -> Option<&ProcessRecord> {
        self.record.as_ref()
    }

    /// Rolling CPU history.
    pub fn history(&self) -> &CpuHistory {
        &self.history
    }

    /// Output captured since the last start.
    pub fn output(&self) -> &RawOutputLog {
        &self.output
    }

    /// Effective status: a script that was never launched is stopped.
    pub fn status(&self) -> ScriptStatus {
        self.record
            .as_ref()
            .map(|record| record.status.clone())
            .unwrap_or(ScriptStatus::Stopped)
    }

    /// Whether the current record is running.
    pub fn is_running(&self) -> bool {
        self.record.as_ref().is_some_and(ProcessRecord::is_running)
    }
}

#[derive(Debug)]
pub(crate) struct ScriptEntry {
    pub(crate) definition: ScriptDefinition,
    pub(crate) runtime: ScriptRuntimeState,
}

/// Ordered collection of script definitions keyed by name.
///
/// Insertion order is the order of autostart and start-all.
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    entries: Vec<ScriptEntry>,
}

impl ScriptRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from definitions in order, rejecting duplicates.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ScriptDefinition>,
    ) -> Result<Self, SupervisorError> {
        let mut registry = Self::new();
        for definition in definitions {
            if registry.contains(&definition.name) {
                return Err(SupervisorError::DuplicateName(definition.name));
            }
            registry.upsert(definition)?;
        }
        Ok(registry)
    }

    /// Number of scripts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a script named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Definition of `name`.
    pub fn get(&self, name: &str) -> Option<&ScriptDefinition> {
        self.entry(name).map(|entry| &entry.definition)
    }

    /// Definitions in insertion order.
    pub fn list(&self) -> impl Iterator<Item = &ScriptDefinition> {
        self.entries.iter().map(|entry| &entry.definition)
    }

    /// Script names in registry order.
    pub fn names(&self) -> Vec<String> {
        self.list().map(|definition| definition.name.clone()).collect()
    }

    /// Names of the scripts whose record is running, in registry order.
    pub fn running_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.runtime.is_running())
            .map(|entry| entry.definition.name.clone())
            .collect()
    }

    /// Runtime state of `name`.
    pub fn runtime(&self, name: &str) -> Option<&ScriptRuntimeState> {
        self.entry(name).map(|entry| &entry.runtime)
    }

    /// Inserts a new definition at the end, or replaces the definition of an
    /// existing name in place. Runtime state is preserved on replacement.
    pub fn upsert(&mut self, definition: ScriptDefinition) -> Result<(), SupervisorError> {
        definition
            .validate()
            .map_err(SupervisorError::InvalidDefinition)?;

        match self.position(&definition.name) {
            Some(index) => self.entries[index].definition = definition,
            None => self.entries.push(ScriptEntry {
                definition,
                runtime: ScriptRuntimeState::default(),
            }),
        }
        Ok(())
    }

    /// Replaces the entry `old_name` with `definition`, keeping its position
    /// and runtime state. Fails if the new name belongs to another script.
    pub fn rename(
        &mut self,
        old_name: &str,
        definition: ScriptDefinition,
    ) -> Result<(), SupervisorError> {
        definition
            .validate()
            .map_err(SupervisorError::InvalidDefinition)?;

        let index = self
            .position(old_name)
            .ok_or_else(|| SupervisorError::UnknownScript(old_name.to_string()))?;
        if definition.name != old_name && self.contains(&definition.name) {
            return Err(SupervisorError::DuplicateName(definition.name));
        }

        self.entries[index].definition = definition;
        Ok(())
    }

    /// Removes a script. Refused while its process is still alive.
    pub fn remove(&mut self, name: &str) -> Result<ScriptDefinition, SupervisorError> {
        let index = self
            .position(name)
            .ok_or_else(|| SupervisorError::UnknownScript(name.to_string()))?;

        let entry = &mut self.entries[index];
        if let Some(record) = entry.runtime.record.as_mut()
            && record.is_running()
            && record.poll_alive()
        {
            return Err(SupervisorError::InUse(name.to_string()));
        }

        Ok(self.entries.remove(index).definition)
    }

    pub(crate) fn entry(&self, name: &str) -> Option<&ScriptEntry> {
        self.entries.iter().find(|entry| entry.definition.name == name)
    }

    pub(crate) fn entry_mut(&mut self, name: &str) -> Option<&mut ScriptEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.definition.name == name)
    }

    /// The entry whose current record belongs to `launch`.
    pub(crate) fn entry_by_launch_mut(&mut self, launch: LaunchId) -> Option<&mut ScriptEntry> {
        self.entries.iter_mut().find(|entry| {
            entry
                .runtime
                .record
                .as_ref()
                .is_some_and(|record| record.launch_id == launch)
        })
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut ScriptEntry> {
        self.entries.iter_mut()
    }

    /// Consumes the registry, yielding each script's runtime state by name.
    pub(crate) fn into_runtimes(self) -> impl Iterator<Item = (String, ScriptRuntimeState)> {
        self.entries
            .into_iter()
            .map(|entry| (entry.definition.name, entry.runtime))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.definition.name == name)
    }
}
