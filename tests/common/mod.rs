#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use drift_ledger::core::config::Config;
use tempfile::TempDir;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// Parse stdout as one JSON document per line.
    pub fn json_lines(&self) -> Vec<serde_json::Value> {
        self.stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).unwrap_or_else(|e| {
                    panic!("stdout is not JSON ({e}); log: {}", self.log_path.display())
                })
            })
            .collect()
    }

    /// The `result` field of the single JSON line.
    pub fn result(&self) -> serde_json::Value {
        let mut lines = self.json_lines();
        assert_eq!(lines.len(), 1, "log: {}", self.log_path.display());
        lines.remove(0)["result"].take()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_dlg") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "dlg.exe" } else { "dlg" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve dlg binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("dlg-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env_remove("DLG_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1")
        .stdin(Stdio::null())
        .output()
        .expect("execute dlg command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// An isolated engine home: config file, database, activity log and inbox
/// inside one temp directory.
pub struct Workspace {
    pub dir: TempDir,
    pub config: Config,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create workspace dir");
        let mut config = Config::default();
        config.paths.sqlite_db = dir.path().join("dlg.sqlite3");
        config.paths.jsonl_log = dir.path().join("activity.jsonl");
        config.paths.inbox_dir = dir.path().join("inbox");
        config.paths.config_file = dir.path().join("config.toml");
        config.reconcile.parallelism = 2;
        let raw = toml::to_string_pretty(&config).expect("serialize config");
        fs::write(&config.paths.config_file, raw).expect("write config");
        Self { dir, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> String {
        self.config.paths.config_file.display().to_string()
    }

    /// Write a file into the workspace and return its path as a string.
    pub fn write(&self, name: &str, contents: &str) -> String {
        let path = self.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write workspace file");
        path.display().to_string()
    }

    /// Run `dlg --config <ws> --json <args...>`.
    pub fn run(&self, case_name: &str, args: &[&str]) -> CmdResult {
        let config = self.config_path();
        let mut full = vec!["--config", config.as_str(), "--json"];
        full.extend_from_slice(args);
        run_cli_case(case_name, &full)
    }
}

// ──────────────────── fixtures ────────────────────

fn spec(service: &str, tag: &str, domains: &[&str], at: &str) -> serde_json::Value {
    serde_json::json!({
        "app": "shop", "service": service, "environment": "prod",
        "image": format!("ghcr.io/acme/{service}"), "tag": tag,
        "domains": domains, "networks": ["edge"],
        "source_file": "shop/compose.yml", "loaded_at": at
    })
}

fn running(service: &str, tag: &str, snapshot_id: &str, at: &str) -> serde_json::Value {
    serde_json::json!({
        "service": service, "host": "node-1",
        "container_name": format!("{service}-1"),
        "image": format!("ghcr.io/acme/{service}"), "tag": tag,
        "replicas": "1/1", "state": "running", "networks": ["edge"],
        "observed_at": at, "snapshot_id": snapshot_id
    })
}

/// Three services on one network. `api` serves `api.example.com`; when
/// `api_up` is false it is missing from the snapshot.
pub fn fleet_batch(batch_id: &str, at: &str, api_up: bool) -> serde_json::Value {
    let snapshot_id = format!("snap-{batch_id}");
    let mut observed = vec![
        running("web", "2.0.0", &snapshot_id, at),
        running("worker", "3.1.0", &snapshot_id, at),
    ];
    if api_up {
        observed.push(running("api", "1.5.0", &snapshot_id, at));
    }
    serde_json::json!({
        "batch_id": batch_id,
        "desired_specs": [
            spec("api", "1.5.0", &["api.example.com"], at),
            spec("web", "2.0.0", &["www.example.com"], at),
            spec("worker", "3.1.0", &[], at),
        ],
        "observed_states": observed,
        "snapshots": [{
            "snapshot_id": snapshot_id, "host": "node-1",
            "disk_usage_pct": 88.0, "memory_usage_pct": 40.0,
            "service_count": 3, "captured_at": at
        }]
    })
}

/// Deploy and container events around 2026-05-01T06:00Z, plus version checks.
pub fn events_batch() -> serde_json::Value {
    serde_json::json!({
        "batch_id": "events-1",
        "deploy_events": [
            { "event_type": "started", "app": "api", "environment": "prod",
              "occurred_at": "2026-05-01T05:50:00Z" },
            { "event_type": "succeeded", "app": "api", "environment": "prod",
              "occurred_at": "2026-05-01T05:58:00Z" },
            { "event_type": "failed", "app": "web", "environment": "prod",
              "occurred_at": "2026-04-30T12:00:00Z" }
        ],
        "docker_events": [
            { "event_type": "die", "container_name": "api-1", "service": "api",
              "host": "node-1", "exit_code": 137, "occurred_at": "2026-05-01T05:30:00Z" },
            { "event_type": "oom", "container_name": "api-1", "service": "api",
              "host": "node-1", "occurred_at": "2026-05-01T06:10:00Z" },
            { "event_type": "die", "container_name": "api-1", "service": "api",
              "host": "node-1", "exit_code": 137, "occurred_at": "2026-05-01T06:40:00Z" },
            { "event_type": "start", "container_name": "worker-7", "host": "node-2",
              "occurred_at": "2026-05-01T06:55:00Z" }
        ],
        "version_checks": [
            { "service": "api", "deployed_version": "1.5.0",
              "latest_version": "2.0.0", "checked_at": "2026-05-01T07:00:00Z" },
            { "service": "web", "deployed_version": "2.0.0",
              "latest_version": "2.0.0", "checked_at": "2026-05-01T07:00:00Z" }
        ]
    })
}

/// Four `die` events of `worker-7` spread over 45 minutes before `07:00Z`.
pub fn crash_loop_batch() -> serde_json::Value {
    let die = |at: &str| {
        serde_json::json!({
            "event_type": "die", "container_name": "worker-7", "host": "node-2",
            "exit_code": 1, "occurred_at": at
        })
    };
    serde_json::json!({
        "batch_id": "crash-1",
        "docker_events": [
            die("2026-05-01T06:10:00Z"),
            die("2026-05-01T06:25:00Z"),
            die("2026-05-01T06:40:00Z"),
            die("2026-05-01T06:55:00Z")
        ]
    })
}
