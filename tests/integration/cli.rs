#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::{write_config, write_script};
use predicates::boolean::PredicateBooleanExt;
use predicates::str::contains;
use tempfile::tempdir;

#[test]
fn list_prints_scripts_in_file_order() {
    let temp = tempdir().unwrap();
    let config = write_config(
        temp.path(),
        r#"
scripts:
  zeta:
    path: /opt/zeta/run.sh
    autostart: true
  alpha:
    path: /opt/alpha/run.sh
    port: 8080
"#,
    );

    let output = Command::cargo_bin("svisor")
        .unwrap()
        .args(["list", "-c", config.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let zeta = stdout.find("zeta").expect("zeta listed");
    let alpha = stdout.find("alpha").expect("alpha listed");
    assert!(zeta < alpha, "unexpected order:\n{stdout}");
    assert!(stdout.contains("8080"));
}

#[test]
fn list_json_is_machine_readable() {
    let temp = tempdir().unwrap();
    let config = write_config(
        temp.path(),
        "scripts:\n  web:\n    path: /srv/web/start.sh\n    port: 5000\n",
    );

    let output = Command::cargo_bin("svisor")
        .unwrap()
        .args(["list", "--json", "-c", config.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(output.status.success());

    let scripts: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(scripts[0]["name"], "web");
    assert_eq!(scripts[0]["port"], 5000);
    assert_eq!(scripts[0]["autostart"], false);
}

#[test]
fn run_start_all_prints_output_and_exits_when_idle() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let hello = write_script(dir, "hello", "echo 'hi there'");
    let bye = write_script(dir, "bye", "echo 'see you' >&2");
    let config = write_config(
        dir,
        &format!(
            "scripts:\n  hello:\n    path: \"{}\"\n  bye:\n    path: \"{}\"\nglobal_start_delay_seconds: 0\n",
            hello.display(),
            bye.display()
        ),
    );

    Command::cargo_bin("svisor")
        .unwrap()
        .args([
            "run",
            "-c",
            config.to_str().unwrap(),
            "--start-all",
            "--exit-when-idle",
        ])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(
            contains("[hello] hi there")
                .and(contains("[bye] see you"))
                .and(contains("* hello: Running")),
        );
}

#[test]
fn run_filter_hides_non_matching_lines() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_script(dir, "mixed", "echo 'INFO ready'\necho 'ERROR broken'");
    let config = write_config(
        dir,
        &format!(
            "scripts:\n  mixed:\n    path: \"{}\"\n    autostart: true\n",
            script.display()
        ),
    );

    Command::cargo_bin("svisor")
        .unwrap()
        .args([
            "run",
            "-c",
            config.to_str().unwrap(),
            "--exit-when-idle",
            "--filter",
            "error",
        ])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(contains("[mixed] ERROR broken").and(contains("INFO ready").not()));
}

#[test]
fn run_json_emits_one_event_per_line() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_script(dir, "once", "echo done");
    let config = write_config(
        dir,
        &format!(
            "scripts:\n  once:\n    path: \"{}\"\n",
            script.display()
        ),
    );

    let output = Command::cargo_bin("svisor")
        .unwrap()
        .args([
            "run",
            "-c",
            config.to_str().unwrap(),
            "--no-autostart",
            "-s",
            "once",
            "--exit-when-idle",
            "--json",
        ])
        .timeout(std::time::Duration::from_secs(20))
        .output()
        .unwrap();
    assert!(output.status.success());

    let events: Vec<serde_json::Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(events.iter().any(|event| event["event"] == "status_changed"
        && event["status"]["state"] == "running"));
    assert!(events
        .iter()
        .any(|event| event["event"] == "output_line" && event["text"] == "done\n"));
}

#[test]
fn run_without_config_file_exits_cleanly() {
    let temp = tempdir().unwrap();
    let absent = temp.path().join("absent.yaml");

    Command::cargo_bin("svisor")
        .unwrap()
        .args(["run", "-c", absent.to_str().unwrap(), "--exit-when-idle"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success();
}
