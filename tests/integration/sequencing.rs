#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use common::{drive_until, shutdown, wait_for_pid, wait_for_status, write_script};
use scriptvisor::{Config, ScriptDefinition, ScriptStatus, Supervisor, config::parse_config};
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn autostart_starts_flagged_scripts_in_order_with_delay() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let a = write_script(dir, "a", "exec sleep 30");
    let b = write_script(dir, "b", "exec sleep 30");
    let c = write_script(dir, "c", "exec sleep 30");

    let config = parse_config(&format!(
        r#"
scripts:
  A:
    path: "{}"
    autostart: true
  C:
    path: "{}"
  B:
    path: "{}"
    autostart: true
global_start_delay_seconds: 1
"#,
        a.display(),
        c.display(),
        b.display()
    ))
    .unwrap();

    let (mut supervisor, _events) = Supervisor::new(config).unwrap();
    let requested = Instant::now();
    assert!(supervisor.autostart().unwrap());

    wait_for_pid(&mut supervisor, "A");
    assert!(requested.elapsed() < Duration::from_secs(1));
    wait_for_pid(&mut supervisor, "B");

    let started = |name: &str| {
        supervisor
            .registry()
            .runtime(name)
            .and_then(|runtime| runtime.record())
            .map(|record| record.started_at())
            .unwrap()
    };
    let gap = started("B") - started("A");
    assert!(
        gap >= chrono::Duration::milliseconds(1000),
        "B started only {gap} after A"
    );
    assert_eq!(supervisor.status("C"), Some(ScriptStatus::Stopped));
    assert!(supervisor.registry().runtime("C").unwrap().record().is_none());

    drive_until(&mut supervisor, Duration::from_secs(5), "autostart to finish", |s| {
        s.active_sequences() == 0
    });
    shutdown(&mut supervisor);
    assert!(supervisor.is_idle());
}

#[test]
fn autostart_disabled_starts_nothing() {
    let temp = tempdir().unwrap();
    let a = write_script(temp.path(), "a", "exec sleep 30");

    let config = Config {
        scripts: vec![ScriptDefinition::new("A", a.to_string_lossy()).with_autostart(true)],
        global_start_delay_seconds: 0,
        autostart_enabled: false,
    };
    let (mut supervisor, _events) = Supervisor::new(config).unwrap();

    assert!(!supervisor.autostart().unwrap());
    supervisor.poll();
    assert!(supervisor.is_idle());
    assert_eq!(supervisor.status("A"), Some(ScriptStatus::Stopped));
}

#[test]
fn start_all_skips_failures_and_keeps_going() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let first = write_script(dir, "first", "exec sleep 30");
    let last = write_script(dir, "last", "exec sleep 30");
    let missing = dir.join("missing.sh");

    let config = Config {
        scripts: vec![
            ScriptDefinition::new("first", first.to_string_lossy()),
            ScriptDefinition::new("broken", missing.to_string_lossy()),
            ScriptDefinition::new("last", last.to_string_lossy()),
        ],
        global_start_delay_seconds: 0,
        autostart_enabled: true,
    };
    let (mut supervisor, _events) = Supervisor::new(config).unwrap();

    supervisor.start_all().unwrap();
    wait_for_pid(&mut supervisor, "last");

    assert!(supervisor.pid("first").is_some());
    assert!(matches!(
        supervisor.status("broken"),
        Some(ScriptStatus::Error(_))
    ));

    shutdown(&mut supervisor);
    assert_eq!(supervisor.status("first"), Some(ScriptStatus::Stopped));
    assert_eq!(supervisor.status("last"), Some(ScriptStatus::Stopped));
}

#[test]
fn start_all_does_not_duplicate_running_scripts() {
    let temp = tempdir().unwrap();
    let only = write_script(temp.path(), "only", "exec sleep 30");

    let config = Config {
        scripts: vec![ScriptDefinition::new("only", only.to_string_lossy())],
        global_start_delay_seconds: 0,
        autostart_enabled: true,
    };
    let (mut supervisor, _events) = Supervisor::new(config).unwrap();

    let pid = supervisor.start("only").unwrap().pid();
    supervisor.start_all().unwrap();
    drive_until(&mut supervisor, Duration::from_secs(5), "start-all to finish", |s| {
        s.active_sequences() == 0
    });
    assert_eq!(supervisor.pid("only"), Some(pid));

    shutdown(&mut supervisor);
    wait_for_status(&mut supervisor, "only", ScriptStatus::Stopped);
}
