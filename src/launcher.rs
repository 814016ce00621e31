//! Spawning of script processes.
use std::io::{self, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::debug;

use crate::config::ScriptDefinition;
use crate::constants::{DEFAULT_SHELL, SHELL_COMMAND_FLAG};
use crate::error::LaunchError;

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was spawned.
    Started(u32),
    /// The script already had a live process; nothing was spawned.
    AlreadyRunning(u32),
}

impl StartOutcome {
    /// PID of the started or already running process.
    pub fn pid(&self) -> u32 {
        match self {
            StartOutcome::Started(pid) | StartOutcome::AlreadyRunning(pid) => *pid,
        }
    }
}

/// A spawned script process together with the read end of its merged
/// stdout/stderr pipe.
#[derive(Debug)]
pub(crate) struct Launched {
    pub(crate) child: Child,
    pub(crate) output: PipeReader,
}

/// Spawns script processes through the host shell.
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Launches `definition` through the host shell, in its own process group,
    /// with its working directory set to the directory containing the script.
    ///
    /// Standard output and standard error share one pipe so their relative
    /// order is preserved. Standard input is closed.
    pub(crate) fn spawn(definition: &ScriptDefinition) -> Result<Launched, LaunchError> {
        let executable = Self::resolve_executable(definition)?;
        let working_dir = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| definition.working_dir());

        let spawn_error = |source: io::Error| LaunchError::Spawn {
            script: definition.name.clone(),
            source,
        };

        let (reader, writer) = io::pipe().map_err(spawn_error)?;
        let stderr_writer = writer.try_clone().map_err(spawn_error)?;

        let mut cmd = Self::shell_command(&executable);
        cmd.current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer);

        debug!("Executing command for '{}': {cmd:?}", definition.name);

        let child = cmd.spawn().map_err(spawn_error)?;
        // The command still owns the write ends; the reader only sees EOF once
        // every copy outside the child is closed.
        drop(cmd);

        debug!("Script '{}' started with PID: {}", definition.name, child.id());
        Ok(Launched {
            child,
            output: reader,
        })
    }

    /// Checks that the configured path can be executed and returns it in
    /// absolute form.
    fn resolve_executable(definition: &ScriptDefinition) -> Result<PathBuf, LaunchError> {
        let missing = || LaunchError::MissingExecutable {
            script: definition.name.clone(),
            path: definition.path.clone(),
        };

        let path = Path::new(&definition.path);
        let metadata = std::fs::metadata(path).map_err(|err| match err.kind() {
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied {
                script: definition.name.clone(),
                path: definition.path.clone(),
            },
            _ => missing(),
        })?;
        if !metadata.is_file() {
            return Err(missing());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(LaunchError::PermissionDenied {
                    script: definition.name.clone(),
                    path: definition.path.clone(),
                });
            }
        }

        std::path::absolute(path).map_err(|source| LaunchError::Spawn {
            script: definition.name.clone(),
            source,
        })
    }

    #[cfg(unix)]
    fn shell_command(executable: &Path) -> Command {
        use crate::constants::SHELL_RUN_PATH;
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(DEFAULT_SHELL);
        cmd.arg(SHELL_COMMAND_FLAG).arg(SHELL_RUN_PATH).arg(executable);

        unsafe {
            cmd.pre_exec(|| {
                // Own process group so the whole tree can be signalled without
                // touching the supervisor's group.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd
    }

    #[cfg(windows)]
    fn shell_command(executable: &Path) -> Command {
        use crate::constants::{CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW};
        use std::os::windows::process::CommandExt;

        let mut cmd = Command::new(DEFAULT_SHELL);
        cmd.arg(SHELL_COMMAND_FLAG)
            .arg(executable)
            .creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
        cmd
    }
}
