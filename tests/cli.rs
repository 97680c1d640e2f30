//! End-to-end tests of the `targetrun` binary.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn targetrun(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("targetrun").unwrap();
    cmd.current_dir(dir).env_remove("RUST_LOG");
    cmd
}

#[cfg(unix)]
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn test_profiles_lists_builtins() {
    let dir = TempDir::new().unwrap();
    targetrun(dir.path())
        .arg("profiles")
        .assert()
        .success()
        .stdout(predicate::str::contains("adb"))
        .stdout(predicate::str::contains("native"))
        .stdout(predicate::str::contains("qemu"));
}

#[test]
fn test_profiles_includes_descriptors() {
    let dir = TempDir::new().unwrap();
    let ext = dir.path().join("ext");
    std::fs::create_dir(&ext).unwrap();
    std::fs::write(
        ext.join("board.toml"),
        "kind = \"adb\"\ndescription = \"Bench board\"\n",
    )
    .unwrap();

    let output = targetrun(dir.path())
        .args(["profiles", "--format", "json", "--extensions-dir"])
        .arg(&ext)
        .output()
        .unwrap();
    assert!(output.status.success());

    let profiles: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let board = profiles
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == "board")
        .unwrap();
    assert_eq!(board["description"], "Bench board");
}

#[test]
fn test_run_without_tests() {
    let dir = TempDir::new().unwrap();
    targetrun(dir.path())
        .args(["run", "native"])
        .assert()
        .code(4);
}

#[test]
fn test_unknown_profile() {
    let dir = TempDir::new().unwrap();
    targetrun(dir.path())
        .args(["run", "fpga"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown profile 'fpga'"));
}

#[test]
fn test_qemu_requires_emulator() {
    let dir = TempDir::new().unwrap();
    targetrun(dir.path())
        .args(["run", "qemu", "/bin/true"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--qemu"));
}

#[test]
fn test_zero_jobs_rejected() {
    let dir = TempDir::new().unwrap();
    targetrun(dir.path())
        .args(["run", "native", "--jobs", "0", "/bin/true"])
        .assert()
        .code(2);
}

#[test]
fn test_validate_bad_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("targetrun.toml"), "[run]\njobs = 0\n").unwrap();
    targetrun(dir.path()).arg("validate").assert().code(2);
}

#[test]
fn test_validate_good_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("targetrun.toml"),
        "[run]\njobs = 3\ntimeout_secs = 30\n",
    )
    .unwrap();
    targetrun(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Jobs: 3"))
        .stdout(predicate::str::contains("Test timeout: 30s"));
}

#[test]
fn test_validate_missing_config() {
    let dir = TempDir::new().unwrap();
    targetrun(dir.path())
        .arg("validate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[cfg(unix)]
#[test]
fn test_run_passing_tests() {
    let dir = TempDir::new().unwrap();
    let a = script(dir.path(), "pass_a", "exit 0");
    let b = script(dir.path(), "pass_b", "echo hello");

    targetrun(dir.path())
        .args(["run", "native", "-j", "2"])
        .arg(&a)
        .arg(&b)
        .assert()
        .code(0);
}

#[cfg(unix)]
#[test]
fn test_run_failing_test_writes_junit() {
    let dir = TempDir::new().unwrap();
    let pass = script(dir.path(), "ok", "exit 0");
    let fail = script(dir.path(), "broken", "echo 'assertion failed' >&2; exit 3");
    let junit = dir.path().join("out/junit.xml");

    targetrun(dir.path())
        .args(["run", "native", "--junit"])
        .arg(&junit)
        .arg(&pass)
        .arg(&fail)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("broken"));

    let xml = std::fs::read_to_string(&junit).unwrap();
    assert!(xml.contains(r#"tests="2" failures="1" errors="0""#));
    assert!(xml.contains("assertion failed"));
    assert!(xml.contains(r#"classname="targetrun.native""#));
}

#[cfg(unix)]
#[test]
fn test_run_timeout() {
    let dir = TempDir::new().unwrap();
    let slow = script(dir.path(), "slow", "sleep 30");

    targetrun(dir.path())
        .args(["run", "native", "--timeout", "1"])
        .arg(&slow)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("TIME"));
}

#[cfg(unix)]
#[test]
fn test_run_manifest_with_filter() {
    let dir = TempDir::new().unwrap();
    script(dir.path(), "alpha", "exit 0");
    script(dir.path(), "beta", "exit 1");
    std::fs::write(
        dir.path().join("suite.toml"),
        "[[test]]\npath = \"alpha\"\n\n[[test]]\npath = \"beta\"\n",
    )
    .unwrap();

    targetrun(dir.path())
        .args(["run", "native", "--manifest", "suite.toml", "--filter", "alpha"])
        .assert()
        .code(0);
}

#[cfg(unix)]
#[test]
fn test_list_json() {
    let dir = TempDir::new().unwrap();
    let test = script(dir.path(), "probe", "exit 0");

    let output = targetrun(dir.path())
        .args(["list", "native", "--format", "json", "--env", "MODE=fast"])
        .arg(&test)
        .output()
        .unwrap();
    assert!(output.status.success());

    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entry = &listed[0];
    assert_eq!(entry["name"], "probe");
    assert_eq!(entry["program"], test.to_string_lossy().as_ref());
    assert_eq!(entry["env"]["MODE"], "fast");
}

#[cfg(unix)]
fn is_running(pid: libc::pid_t) -> bool {
    if unsafe { libc::kill(pid, 0) } != 0 {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .is_none_or(|(_, rest)| !rest.starts_with('Z')),
        Err(_) => !Path::new("/proc/self").exists(),
    }
}

#[cfg(unix)]
#[test]
fn test_interrupt_stops_run() {
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("hang.pid");
    let hang = script(
        dir.path(),
        "hang",
        &format!("echo $$ > {}\nexec sleep 60", pid_file.display()),
    );

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("targetrun"))
        .current_dir(dir.path())
        .env_remove("RUST_LOG")
        .args(["run", "native"])
        .arg(&hang)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let start = Instant::now();
    let test_pid: libc::pid_t = loop {
        if let Some(pid) = std::fs::read_to_string(&pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            break pid;
        }
        assert!(start.elapsed() < Duration::from_secs(20), "test never started");
        std::thread::sleep(Duration::from_millis(20));
    };
    std::thread::sleep(Duration::from_millis(200));

    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGINT);
    }

    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if start.elapsed() > Duration::from_secs(30) {
            let _ = child.kill();
            panic!("targetrun did not stop after SIGINT");
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    assert_eq!(status.code(), Some(130));
    assert!(!is_running(test_pid));
}

#[test]
fn test_list_adb_shows_remote_command() {
    let dir = TempDir::new().unwrap();
    targetrun(dir.path())
        .args(["list", "adb", "-s", "emulator-5554", "--binary-path", "/data/t", "bin/unit"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-s emulator-5554 shell"))
        .stdout(predicate::str::contains("/data/t/unit"));
}
