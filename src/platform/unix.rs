use std::io;

use nix::{errno::Errno, sys::signal, unistd::Pid};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

use super::{Platform, descendant_pids};
use crate::error::TerminateError;

/// Unix implementation: process-group kills plus a descendant sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePlatform;

fn errno_to_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

impl Platform for NativePlatform {
    fn listener_pid(&self, port: u16) -> Option<u32> {
        listener::find(port)
    }

    fn kill_tree(&self, pid: u32) -> Result<(), TerminateError> {
        let target = Pid::from_raw(pid as i32);

        match signal::kill(target, None) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Err(TerminateError::AlreadyGone { pid }),
            Err(err) => {
                return Err(TerminateError::Failed {
                    pid,
                    source: errno_to_io(err),
                });
            }
        }

        // Snapshot the tree before anything dies so reparented grandchildren
        // are still attributed to the target.
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let descendants = descendant_pids(&system, pid);

        let supervisor_pgid = unsafe { libc::getpgid(0) };
        let target_pgid = unsafe { libc::getpgid(target.as_raw()) };
        if target_pgid >= 0 && target_pgid != supervisor_pgid {
            let kill_result = unsafe { libc::killpg(target_pgid, libc::SIGKILL) };
            if kill_result < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(code) if code == libc::ESRCH => {
                        debug!("Process group {target_pgid} already empty");
                    }
                    _ => warn!("Failed to kill process group {target_pgid}: {err}"),
                }
            }
        }

        match signal::kill(target, Some(signal::SIGKILL)) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => {
                return Err(TerminateError::Failed {
                    pid,
                    source: errno_to_io(err),
                });
            }
        }

        for child in descendants {
            if let Err(err) = signal::kill(Pid::from_raw(child as i32), Some(signal::SIGKILL))
                && err != Errno::ESRCH
            {
                debug!("Failed to kill descendant PID {child} of {pid}: {err}");
            }
        }

        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod listener {
    use std::{collections::HashSet, fs};

    const TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];
    const TCP_LISTEN: &str = "0A";

    pub(super) fn find(port: u16) -> Option<u32> {
        let mut inodes = HashSet::new();
        for table in TCP_TABLES {
            if let Ok(content) = fs::read_to_string(table) {
                inodes.extend(listening_inodes(&content, port));
            }
        }
        if inodes.is_empty() {
            return None;
        }
        owner_of(&inodes)
    }

    /// Socket inodes of LISTEN rows bound to `port` in a `/proc/net/tcp*` table.
    pub(super) fn listening_inodes(content: &str, port: u16) -> Vec<u64> {
        content
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 || fields[3] != TCP_LISTEN {
                    return None;
                }
                let (_, port_hex) = fields[1].rsplit_once(':')?;
                if u16::from_str_radix(port_hex, 16).ok()? != port {
                    return None;
                }
                fields[9].parse::<u64>().ok().filter(|inode| *inode != 0)
            })
            .collect()
    }

    /// Parses an fd link target of the form `socket:[12345]`.
    pub(super) fn socket_inode(target: &str) -> Option<u64> {
        target
            .strip_prefix("socket:[")?
            .strip_suffix(']')?
            .parse()
            .ok()
    }

    fn owner_of(inodes: &HashSet<u64>) -> Option<u32> {
        for entry in fs::read_dir("/proc").ok()?.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(target) = fs::read_link(fd.path())
                    && let Some(inode) = socket_inode(&target.to_string_lossy())
                    && inodes.contains(&inode)
                {
                    return Some(pid);
                }
            }
        }
        None
    }
}

#[cfg(not(target_os = "linux"))]
mod listener {
    use std::process::Command;

    pub(super) fn find(port: u16) -> Option<u32> {
        let output = Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
            .output()
            .ok()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(|line| line.trim().parse().ok())
    }
}
