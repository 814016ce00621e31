//! Scriptvisor supervises a small fleet of independently defined scripts: it
//! starts them in their own process groups, streams their merged output,
//! tracks liveness and process-tree CPU usage, and stops them reliably, even
//! when the real owner of a service is a process the script forked onto a
//! known port.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Timing and platform constants.
pub mod constants;

/// Error handling.
pub mod error;

/// Events exposed to presentation and notification layers.
pub mod events;

/// Script process spawning.
pub mod launcher;

/// CPU accounting.
pub mod metrics;

/// Output capture, filtering and keyword tagging.
pub mod output;

/// Host-specific process services.
pub mod platform;

/// Script definitions and runtime state.
pub mod registry;

/// Ordered start sequences.
pub mod sequencer;

/// The coordination point.
pub mod supervisor;

/// Process tree termination.
pub mod terminator;

pub use config::{Config, ScriptDefinition};
pub use error::SupervisorError;
pub use events::SupervisorEvent;
pub use launcher::StartOutcome;
pub use registry::ScriptStatus;
pub use supervisor::Supervisor;
