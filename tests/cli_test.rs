//! End-to-end tests for the iacflow CLI against an isolated working directory.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

mod common;

/// Builds an `iacflow` Command with the given settings file and work dir.
fn iacflow_cmd(config: &Path, work_dir: &Path) -> Command {
    let mut cmd = assert_cmd::cargo_bin_cmd!("iacflow");
    cmd.arg("-c")
        .arg(config)
        .arg("-w")
        .arg(work_dir)
        .env("NO_COLOR", "1");
    cmd
}

/// Run a command expected to succeed and return its stdout.
fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

/// The id printed on the last line by the `add` commands.
fn last_line(stdout: &str) -> String {
    stdout.lines().last().unwrap().trim().to_string()
}

/// The id column of a printed task line.
fn task_id(stdout: &str) -> String {
    let line = stdout.lines().find(|l| l.contains(" on ")).unwrap();
    line.split_whitespace().nth(2).unwrap().to_string()
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn with_runner() -> Self {
        let ws = Self::new();
        std::fs::write(
            ws.config(),
            "runners:\n  - id: runner-1\n    address: http://127.0.0.1:1\n",
        )
        .unwrap();
        ws
    }

    fn config(&self) -> std::path::PathBuf {
        self.dir.path().join("iacflow.yaml")
    }

    fn work(&self) -> std::path::PathBuf {
        self.dir.path().join("work")
    }

    fn cmd(&self) -> Command {
        iacflow_cmd(&self.config(), &self.work())
    }
}

#[test]
fn test_init_creates_database() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("State database ready"));
    assert!(ws.work().join("state.db").exists());
    assert!(ws.work().join("logs").is_dir());
}

#[test]
fn test_scan_without_compliance_is_rejected() {
    let ws = Workspace::with_runner();
    let template = last_line(&stdout_of(ws.cmd().args(["template", "add", "network"])));

    ws.cmd()
        .args(["scan", template.as_str()])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("scan_not_enabled"));

    // Parse-only scans skip the compliance flag.
    ws.cmd()
        .args(["scan", template.as_str(), "--parse-only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tpl_parse"));
}

#[test]
fn test_run_without_runners_fails() {
    let ws = Workspace::new();
    let template = last_line(&stdout_of(ws.cmd().args(["template", "add", "network"])));

    ws.cmd()
        .args(["run", template.as_str(), "-t", "plan"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("no_runner_available"));
}

#[test]
fn test_invalid_ttl_rejected() {
    let ws = Workspace::new();
    let template = last_line(&stdout_of(ws.cmd().args(["template", "add", "network"])));

    ws.cmd()
        .args(["env", "add", template.as_str(), "dev", "--ttl", "soon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid ttl"));
}

#[test]
fn test_apply_lifecycle_through_cli() {
    let ws = Workspace::with_runner();
    let template = last_line(&stdout_of(ws.cmd().args(["template", "add", "network"])));
    let env = last_line(&stdout_of(
        ws.cmd().args(["env", "add", template.as_str(), "dev", "--ttl", "12h"]),
    ));

    let task = task_id(&stdout_of(
        ws.cmd().args(["run", template.as_str(), "-e", env.as_str(), "-t", "apply"]),
    ));

    // A second execution on the same environment conflicts.
    ws.cmd()
        .args(["run", template.as_str(), "-e", env.as_str(), "-t", "plan"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("conflict"));

    ws.cmd().args(["start", task.as_str(), "ctr-1"]).assert().success();

    let state_file = ws.dir.path().join("state.json");
    std::fs::write(&state_file, common::STATE_JSON).unwrap();
    ws.cmd()
        .args(["artifact", "put", task.as_str(), "state"])
        .arg(&state_file)
        .assert()
        .success();

    ws.cmd()
        .args(["finalize", task.as_str(), "complete"])
        .assert()
        .success()
        .stdout(predicate::str::contains("complete"));

    ws.cmd()
        .args(["show", task.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("aws_vpc.main"))
        .stdout(predicate::str::contains("hunter2").not());

    ws.cmd()
        .args(["env", "show", env.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"Status:\s+active").unwrap());
}

#[test]
fn test_unknown_artifact_name_rejected() {
    let ws = Workspace::with_runner();
    let template = last_line(&stdout_of(ws.cmd().args(["template", "add", "network"])));
    let task = task_id(&stdout_of(ws.cmd().args(["run", template.as_str(), "-t", "plan"])));

    ws.cmd()
        .args(["artifact", "put", task.as_str(), "bogus", "missing.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown artifact 'bogus'"));
}

#[test]
fn test_summary_and_report_print_json() {
    let ws = Workspace::new();

    let summary = stdout_of(ws.cmd().arg("summary"));
    let summary: serde_json::Value = serde_json::from_str(&summary).unwrap();
    assert_eq!(summary["active_policy"]["total"], 0);
    assert!(summary["policy_violated"].as_array().unwrap().is_empty());

    let report = stdout_of(ws.cmd().args(["report", "--days", "3"]));
    let report: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(report["scan_count"]["column"].as_array().unwrap().len(), 0);

    ws.cmd()
        .args(["report", "--days", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--days must be at least 1"));
}

#[test]
fn test_policy_test_reports_bad_input() {
    let ws = Workspace::new();
    let rule = ws.dir.path().join("rule.rego");
    let input = ws.dir.path().join("input.json");
    std::fs::write(&rule, "package iac\n").unwrap();
    std::fs::write(&input, "{not json").unwrap();

    let out = stdout_of(ws.cmd().args(["policy", "test"]).arg(&rule).arg(&input));
    let out: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert!(out["status"].is_null());
    assert!(out["error"].as_str().unwrap().starts_with("invalid input"));
}
