#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use scriptvisor::{Supervisor, registry::ScriptStatus};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Writes an executable `/bin/sh` script named `<name>.sh` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(format!("{name}.sh"));
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Writes a configuration file and returns its path.
pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("scriptvisor.yaml");
    fs::write(&path, contents).unwrap();
    path
}

/// Polls the supervisor until `done` holds, panicking after `timeout`.
pub fn drive_until<F>(supervisor: &mut Supervisor, timeout: Duration, what: &str, mut done: F)
where
    F: FnMut(&Supervisor) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        supervisor.poll();
        if done(supervisor) {
            return;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {what}");
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_status(supervisor: &mut Supervisor, name: &str, expected: ScriptStatus) {
    let what = format!("'{name}' to become {expected}");
    drive_until(supervisor, Duration::from_secs(10), &what, |s| {
        s.status(name).as_ref() == Some(&expected)
    });
}

pub fn wait_for_pid(supervisor: &mut Supervisor, name: &str) -> u32 {
    let what = format!("a PID for '{name}'");
    drive_until(supervisor, Duration::from_secs(10), &what, |s| {
        s.pid(name).is_some()
    });
    supervisor.pid(name).unwrap()
}

pub fn wait_for_output(supervisor: &mut Supervisor, name: &str, expected: usize) -> Vec<String> {
    let what = format!("{expected} output lines from '{name}'");
    drive_until(supervisor, Duration::from_secs(10), &what, |s| {
        s.output(name).is_some_and(|log| log.len() >= expected)
    });
    supervisor.output(name).unwrap().lines().to_vec()
}

pub fn wait_for_file_value(path: &Path) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && !content.trim().is_empty()
        {
            return content.trim().to_string();
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for a value in {:?}", path);
        }

        thread::sleep(Duration::from_millis(100));
    }
}

/// Whether `pid` names a live, non-zombie process.
pub fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system
        .process(target)
        .is_some_and(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Process {pid} still alive");
}

/// Stops everything and waits for the records to settle.
pub fn shutdown(supervisor: &mut Supervisor) {
    supervisor.stop_all();
    assert!(
        supervisor.wait_until_stopped(Duration::from_secs(10)),
        "scripts still running after stop-all"
    );
}
