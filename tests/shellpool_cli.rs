//! Integration tests that lock shellpool CLI flags and output behavior.

use std::io::Write;
use std::process::{Command, Stdio};

fn combined_output(output: &std::process::Output) -> String {
    let mut combined = String::new();
    combined.push_str(&String::from_utf8_lossy(&output.stdout));
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

fn shellpool_bin() -> &'static str {
    option_env!("CARGO_BIN_EXE_shellpool").expect("shellpool test binary not built")
}

#[test]
fn help_lists_session_and_pool_flags() {
    let output = Command::new(shellpool_bin())
        .arg("--help")
        .output()
        .expect("run shellpool --help");
    assert!(output.status.success());
    let combined = combined_output(&output);
    assert!(combined.contains("--io-mode"));
    assert!(combined.contains("--stage-to"));
    assert!(combined.contains("--copy-mode"));
    assert!(combined.contains("--idle-timeout"));
}

#[test]
fn json_mode_reports_each_command() {
    let output = Command::new(shellpool_bin())
        .args(["--json", "fork://localhost", "printf hi", "echo oops >&2; false"])
        .output()
        .expect("run shellpool --json");
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let reports: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0]["status"], 0);
    assert_eq!(reports[0]["stdout"], "hi");
    assert_eq!(reports[1]["status"], 1);
    assert_eq!(reports[1]["stderr"], "oops\n");
    assert_eq!(reports[1]["command"], "echo oops >&2; false");
}

#[test]
fn stage_flags_move_stdin_and_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("staged.txt");
    let target = target.to_str().expect("utf-8 path");

    let mut child = Command::new(shellpool_bin())
        .args(["--stage-to", target, "--stage-from", target, "fork://localhost"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn shellpool");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"through the pool\n")
        .expect("write stdin");
    let output = child.wait_with_output().expect("wait shellpool");
    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(output.stdout, b"through the pool\n");
}

#[test]
fn unsupported_scheme_fails_with_context() {
    let output = Command::new(shellpool_bin())
        .args(["gopher://example.org", "true"])
        .output()
        .expect("run shellpool");
    assert!(!output.status.success());
    let combined = combined_output(&output);
    assert!(combined.contains("cannot open a shell on gopher://example.org"));
}
