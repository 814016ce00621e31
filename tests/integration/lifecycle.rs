#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use common::{
    process_alive, shutdown, wait_for_file_value, wait_for_output, wait_for_pid,
    wait_for_process_exit, wait_for_status, write_script,
};
use scriptvisor::{
    Config, ScriptDefinition, ScriptStatus, Supervisor, SupervisorEvent,
    constants::CPU_SAMPLE_INTERVAL,
    output::{LineTag, tag_keywords},
};
use std::{thread, time::Duration, time::Instant};
use tempfile::tempdir;

fn config(scripts: Vec<ScriptDefinition>) -> Config {
    Config {
        scripts,
        global_start_delay_seconds: 0,
        autostart_enabled: false,
    }
}

#[test]
fn start_streams_output_and_stop_ends_the_tree() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let child_pid_file = dir.join("child.pid");
    let script = write_script(
        dir,
        "server",
        &format!(
            "sleep 30 &\necho $! > '{}'\necho 'Server starting'\necho 'listening' >&2\nexec sleep 30",
            child_pid_file.display()
        ),
    );

    let (mut supervisor, events) = Supervisor::new(config(vec![ScriptDefinition::new(
        "server",
        script.to_string_lossy(),
    )]))
    .unwrap();

    supervisor.start("server").unwrap();
    let root = wait_for_pid(&mut supervisor, "server");
    let lines = wait_for_output(&mut supervisor, "server", 2);
    assert_eq!(lines, vec!["Server starting\n", "listening\n"]);

    let background: u32 = wait_for_file_value(&child_pid_file).parse().unwrap();
    assert!(process_alive(background));

    supervisor.stop("server").unwrap();
    wait_for_status(&mut supervisor, "server", ScriptStatus::Stopped);
    wait_for_process_exit(root);
    wait_for_process_exit(background);

    let outputs: Vec<_> = events
        .try_iter()
        .filter_map(|event| match event {
            SupervisorEvent::OutputLine { name, text } => Some((name, text)),
            _ => None,
        })
        .collect();
    assert_eq!(outputs.len(), 2);
    assert!(outputs.iter().all(|(name, _)| name == "server"));
}

#[test]
fn external_kill_is_detected_within_one_sampling_period() {
    let temp = tempdir().unwrap();
    let script = write_script(temp.path(), "fragile", "exec sleep 30");

    let (mut supervisor, _events) = Supervisor::new(config(vec![ScriptDefinition::new(
        "fragile",
        script.to_string_lossy(),
    )]))
    .unwrap();

    let pid = supervisor.start("fragile").unwrap().pid();
    let killed_at = Instant::now();
    unsafe {
        libc::killpg(pid as i32, libc::SIGKILL);
    }

    wait_for_status(&mut supervisor, "fragile", ScriptStatus::Stopped);
    assert!(killed_at.elapsed() <= CPU_SAMPLE_INTERVAL + Duration::from_secs(1));
    assert_eq!(supervisor.pid("fragile"), None);
}

#[test]
fn restart_replaces_the_process() {
    let temp = tempdir().unwrap();
    let script = write_script(temp.path(), "svc", "echo up\nexec sleep 30");

    let (mut supervisor, _events) = Supervisor::new(config(vec![ScriptDefinition::new(
        "svc",
        script.to_string_lossy(),
    )]))
    .unwrap();

    let first = supervisor.start("svc").unwrap().pid();
    wait_for_output(&mut supervisor, "svc", 1);

    supervisor.restart("svc").unwrap();
    wait_for_status(&mut supervisor, "svc", ScriptStatus::Stopped);
    let second = wait_for_pid(&mut supervisor, "svc");
    assert_ne!(first, second);

    // The new launch starts with a fresh output log.
    let lines = wait_for_output(&mut supervisor, "svc", 1);
    assert_eq!(lines, vec!["up\n"]);

    shutdown(&mut supervisor);
}

#[test]
fn output_log_replays_through_filter_and_tags() {
    let temp = tempdir().unwrap();
    let script = write_script(
        temp.path(),
        "noisy",
        "echo 'Worker starting'\necho 'ERROR: disk full'\necho 'job completed'\nprintf 'exit pending'",
    );

    let (mut supervisor, _events) = Supervisor::new(config(vec![ScriptDefinition::new(
        "noisy",
        script.to_string_lossy(),
    )]))
    .unwrap();

    supervisor.start("noisy").unwrap();
    wait_for_status(&mut supervisor, "noisy", ScriptStatus::Stopped);

    let log = supervisor.output("noisy").unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log.filter("error"), vec!["ERROR: disk full\n"]);
    let replayed: Vec<String> = log.filter("").into_iter().map(str::to_string).collect();
    assert_eq!(replayed, log.lines());
    assert_eq!(log.lines().last().map(String::as_str), Some("exit pending"));

    let tags: Vec<_> = log
        .lines()
        .iter()
        .flat_map(|line| tag_keywords(line))
        .map(|span| span.tag)
        .collect();
    assert_eq!(tags, vec![LineTag::Info, LineTag::Error, LineTag::Success]);

    supervisor.clear_output("noisy").unwrap();
    assert!(supervisor.output("noisy").unwrap().is_empty());
}

#[test]
fn busy_process_tree_shows_up_in_history() {
    let temp = tempdir().unwrap();
    let script = write_script(temp.path(), "spin", "while :; do :; done");

    let (mut supervisor, _events) = Supervisor::new(config(vec![ScriptDefinition::new(
        "spin",
        script.to_string_lossy(),
    )]))
    .unwrap();

    supervisor.start("spin").unwrap();
    for _ in 0..3 {
        thread::sleep(Duration::from_millis(700));
        supervisor.sample();
    }

    let history = supervisor.history("spin").unwrap();
    assert_eq!(history.len(), 20);
    assert!(
        history.last().copied().unwrap_or_default() > 1.0,
        "expected CPU usage, got {history:?}"
    );
    assert!(supervisor.total_cpu() > 1.0);

    shutdown(&mut supervisor);
}

#[test]
fn launch_errors_are_reported_not_retried() {
    let temp = tempdir().unwrap();
    let missing = temp.path().join("nope.sh");

    let (mut supervisor, _events) = Supervisor::new(config(vec![ScriptDefinition::new(
        "missing",
        missing.to_string_lossy(),
    )]))
    .unwrap();

    assert!(supervisor.start("missing").is_err());
    for _ in 0..5 {
        supervisor.poll();
        thread::sleep(Duration::from_millis(50));
    }
    assert!(matches!(
        supervisor.status("missing"),
        Some(ScriptStatus::Error(_))
    ));
    assert!(supervisor.is_idle());
}
