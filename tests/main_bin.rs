//! Integration tests that lock binary startup behavior and end-to-end supervised runs.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_script(name: &str, body: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("runsup-bin-{name}-{nanos}"));
    std::fs::create_dir_all(&dir).expect("create script dir");
    let path = dir.join(format!("{name}.sh"));
    std::fs::write(&path, body).expect("write script");
    path
}

fn runsup(script: &PathBuf, extra: &[&str], stdin: &str) -> Output {
    let missing_config = script.with_extension("toml");
    let mut child = Command::new(env!("CARGO_BIN_EXE_runsup"))
        .arg("--interpreter")
        .arg("sh")
        .arg("--client")
        .arg(env!("CARGO_BIN_EXE_runsup-client"))
        .arg("--config")
        .arg(&missing_config)
        .arg("--no-logs")
        .args(extra)
        .arg(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("run runsup");
    if let Some(mut pipe) = child.stdin.take() {
        pipe.write_all(stdin.as_bytes()).expect("write stdin");
    }
    child.wait_with_output().expect("wait runsup")
}

#[test]
fn main_prints_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_runsup"))
        .arg("--help")
        .output()
        .expect("run runsup");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Run a script under an out-of-process supervisor"));
    assert!(stdout.contains("--console-reuse"));
}

#[test]
fn client_requires_a_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_runsup-client"))
        .args(["--port", "1", "--procuuid", "x"])
        .output()
        .expect("run runsup-client");
    assert!(!output.status.success());
}

#[cfg(unix)]
#[test]
fn redirected_run_tunnels_output_and_exit_code() {
    let script = unique_script(
        "tunnel",
        "echo hello-from-script\necho warn-line >&2\nexit 3\n",
    );
    let output = runsup(&script, &[], "");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(3), "stderr: {stderr}");
    assert!(stdout.contains("hello-from-script"));
    assert!(stderr.contains("warn-line"));
    assert!(stderr.contains("[runsup] Started"));
    assert!(stderr.contains("Script finished with exit code 3"));
}

#[cfg(unix)]
#[test]
fn terminal_lines_reach_the_script_stdin() {
    let script = unique_script("greet", "read name\necho \"hello $name\"\n");
    let output = runsup(&script, &[], "world\n");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("hello world"));
}

#[cfg(unix)]
#[test]
fn detached_run_reports_os_exit_status() {
    let script = unique_script("detached", "exit 5\n");
    let output = runsup(&script, &["--detached"], "");
    assert_eq!(output.status.code(), Some(5));
    assert!(!String::from_utf8_lossy(&output.stderr).contains("[runsup]"));
}
