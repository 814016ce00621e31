//! Constants and timing values for the scriptvisor coordination loop.
//!
//! This module centralizes the periods, delays and buffer sizes used by the
//! supervisor so that the host loop, the sequencer and the tests agree on them.

use std::time::Duration;

// ============================================================================
// Coordination Loop Timing
// ============================================================================

/// Period at which the coordination point drains the output queue and runs
/// scheduled actions.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on worker messages applied per tick, so a chatty script cannot
/// starve scheduled actions.
pub const MAX_MESSAGES_PER_TICK: usize = 10_000;

/// Period of the liveness/CPU sampling pass.
pub const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Pause between the stop and the start of a restart. Not configurable.
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Longest a reload waits for the previous scripts to exit before swapping
/// in the new definitions.
pub const RELOAD_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Inter-script delay used when the configuration does not specify one.
pub const DEFAULT_START_DELAY_SECS: u64 = 2;

// ============================================================================
// CPU Accounting
// ============================================================================

/// Number of aggregated CPU samples retained per script.
pub const CPU_HISTORY_LEN: usize = 20;

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Shell used to run script paths on unix hosts.
#[cfg(unix)]
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
#[cfg(unix)]
pub const SHELL_COMMAND_FLAG: &str = "-c";

/// Command string handed to the shell; `$0` is bound to the script path so
/// paths containing spaces need no quoting.
#[cfg(unix)]
pub const SHELL_RUN_PATH: &str = "\"$0\"";

/// Command interpreter used to run script paths on windows hosts.
#[cfg(windows)]
pub const DEFAULT_SHELL: &str = "cmd";

/// Interpreter flag for executing a single command.
#[cfg(windows)]
pub const SHELL_COMMAND_FLAG: &str = "/C";

/// `CREATE_NEW_PROCESS_GROUP` process creation flag.
#[cfg(windows)]
pub const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// `CREATE_NO_WINDOW` process creation flag.
#[cfg(windows)]
pub const CREATE_NO_WINDOW: u32 = 0x0800_0000;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration file names probed when no path is given, in order.
pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["scriptvisor.yaml", "config.json"];
