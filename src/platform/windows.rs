use std::io;
use std::os::windows::process::CommandExt;
use std::process::Command;

use tracing::debug;

use super::Platform;
use crate::constants::CREATE_NO_WINDOW;
use crate::error::TerminateError;

/// Exit code `taskkill` reports when the PID does not exist.
const TASKKILL_NOT_FOUND: i32 = 128;

/// Windows implementation backed by `netstat` and `taskkill`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePlatform;

impl Platform for NativePlatform {
    fn listener_pid(&self, port: u16) -> Option<u32> {
        let output = Command::new("netstat")
            .args(["-ano", "-p", "TCP"])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .ok()?;
        listening_pid(&String::from_utf8_lossy(&output.stdout), port)
    }

    fn kill_tree(&self, pid: u32) -> Result<(), TerminateError> {
        let output = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|source| TerminateError::Failed { pid, source })?;

        if output.status.success() {
            debug!("taskkill terminated tree of PID {pid}");
            return Ok(());
        }
        if output.status.code() == Some(TASKKILL_NOT_FOUND) {
            return Err(TerminateError::AlreadyGone { pid });
        }
        Err(TerminateError::Failed {
            pid,
            source: io::Error::other(String::from_utf8_lossy(&output.stderr).trim().to_string()),
        })
    }
}

/// Finds the owner of a listening socket in `netstat -ano` output.
///
/// The state column is localized, so listening rows are recognized by their
/// foreign address having port 0.
fn listening_pid(output: &str, port: u16) -> Option<u32> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("TCP") {
            return None;
        }
        let (_, local_port) = fields[1].rsplit_once(':')?;
        let (_, remote_port) = fields[2].rsplit_once(':')?;
        if local_port.parse::<u16>().ok()? != port || remote_port != "0" {
            return None;
        }
        fields[fields.len() - 1].parse().ok()
    })
}
