//! Error handling for scriptvisor.
use thiserror::Error;

/// Defines the errors surfaced by the supervisor's public operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The named script is not present in the registry.
    #[error("Unknown script '{0}'")]
    UnknownScript(String),

    /// The script cannot be removed while its process is running.
    #[error("Script '{0}' is running; stop it before removing it")]
    InUse(String),

    /// Another script already uses the requested name.
    #[error("A script named '{0}' already exists")]
    DuplicateName(String),

    /// A script definition failed validation.
    #[error("Invalid script definition: {0}")]
    InvalidDefinition(String),

    /// Launching the script's process failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Loading the configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker thread (output pump, terminator, sequencer) could not be spawned.
    #[error("Failed to spawn worker thread: {0}")]
    Worker(#[source] std::io::Error),
}

/// Reasons a script's process could not be spawned. Never retried automatically.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The script path does not exist.
    #[error("Executable for '{script}' not found at {path}")]
    MissingExecutable {
        /// The script name.
        script: String,
        /// The configured path.
        path: String,
    },

    /// The script path exists but may not be executed.
    #[error("Permission denied executing {path} for '{script}'")]
    PermissionDenied {
        /// The script name.
        script: String,
        /// The configured path.
        path: String,
    },

    /// The operating system refused to spawn the process.
    #[error("Failed to start script '{script}': {source}")]
    Spawn {
        /// The script name.
        script: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a failed forceful terminate.
#[derive(Debug, Error)]
pub enum TerminateError {
    /// The target exited before the kill was delivered. Informational only.
    #[error("PID {pid} is already gone")]
    AlreadyGone {
        /// The PID that was targeted.
        pid: u32,
    },

    /// The kill could not be delivered.
    #[error("Failed to terminate PID {pid}: {source}")]
    Failed {
        /// The PID that was targeted.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the configuration file.
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing the configuration document.
    #[error("Invalid config format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The document parsed but describes an unusable script list.
    #[error("Invalid config: {0}")]
    Invalid(String),
}
