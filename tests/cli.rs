//! End-to-end tests for the `mmsync` binary against a temporary checkpoint store.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use mm_semantic_sync::checkpoint::SqliteCheckpointStore;
use mm_semantic_sync::db;
use mm_semantic_sync::traits::CheckpointStore;

fn setup_test_env() -> (TempDir, PathBuf) {
    let (tmp, config_path, _) = setup_test_env_with_db();
    (tmp, config_path)
}

fn setup_test_env_with_db() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/mmsync.sqlite"

[upstream]
base_url = "http://127.0.0.1:9/api/v4"

[sink]
base_url = "http://127.0.0.1:9"

[sync]
fetch_interval_secs = 20

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("mmsync.toml");
    fs::write(&config_path, config_content).unwrap();

    let db_path = root.join("data").join("mmsync.sqlite");
    (tmp, config_path, db_path)
}

async fn put_sync_key(db_path: &Path, key: &str, value: &str) {
    let pool = db::connect_path(db_path).await.unwrap();
    let store = SqliteCheckpointStore::open(pool).await.unwrap();
    store.put("sync", key, value.as_bytes()).await.unwrap();
}

fn run_mmsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = env!("CARGO_BIN_EXE_mmsync");
    let output = Command::new(binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run mmsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_status_requires_init() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_mmsync(&config_path, &["status"]);
    assert!(!success);
    assert!(stderr.contains("mmsync init"), "stderr={}", stderr);
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_mmsync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(stdout.contains("fetch interval: 20s"));

    let (_, _, success) = run_mmsync(&config_path, &["init"]);
    assert!(success, "second init failed (not idempotent)");
}

#[test]
fn test_status_reports_defaults() {
    let (_tmp, config_path) = setup_test_env();
    run_mmsync(&config_path, &["init"]);

    let (stdout, _, success) = run_mmsync(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("fetch interval:      20s"));
    assert!(stdout.contains("last fetched at:     never"));

    let (stdout, _, success) = run_mmsync(&config_path, &["status", "--json"]);
    assert!(success);
    let snapshot: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(snapshot["fetch_interval"], 20);
    assert_eq!(snapshot["total_fetched_posts"], 0);
    assert_eq!(snapshot["is_sync_in_progress"], false);
    assert!(snapshot["last_fetched_at"].is_null());
}

#[test]
fn test_interval_persists() {
    let (_tmp, config_path) = setup_test_env();
    run_mmsync(&config_path, &["init"]);

    let (stdout, _, success) = run_mmsync(&config_path, &["interval", "45"]);
    assert!(success);
    assert!(stdout.contains("45s"));

    let (stdout, _, success) = run_mmsync(&config_path, &["interval"]);
    assert!(success);
    assert_eq!(stdout.trim(), "45");

    // Re-running init keeps the stored value.
    run_mmsync(&config_path, &["init"]);
    let (stdout, _, _) = run_mmsync(&config_path, &["interval"]);
    assert_eq!(stdout.trim(), "45");
}

#[test]
fn test_interval_rejects_non_positive() {
    let (_tmp, config_path) = setup_test_env();
    run_mmsync(&config_path, &["init"]);

    let (_, _, success) = run_mmsync(&config_path, &["interval", "0"]);
    assert!(!success);
    let (_, _, success) = run_mmsync(&config_path, &["interval", "-5"]);
    assert!(!success);

    let (stdout, _, _) = run_mmsync(&config_path, &["interval"]);
    assert_eq!(stdout.trim(), "20");
}

#[test]
fn test_reset_flags_only() {
    let (_tmp, config_path) = setup_test_env();
    run_mmsync(&config_path, &["init"]);

    let (stdout, stderr, success) = run_mmsync(&config_path, &["reset", "--flags-only"]);
    assert!(success, "reset failed: {}", stderr);
    assert!(stdout.contains("cleared in-progress flags"));
    assert!(!stdout.contains("dropped collection"));
}

#[tokio::test]
async fn test_reset_refused_while_fetch_runs() {
    let (_tmp, config_path, db_path) = setup_test_env_with_db();
    run_mmsync(&config_path, &["init"]);

    // Another process is in the middle of a pass.
    put_sync_key(&db_path, "total_fetched_posts", "7").await;
    put_sync_key(&db_path, "is_fetch_in_progress", "true").await;

    let (stdout, stderr, success) = run_mmsync(&config_path, &["reset"]);
    assert!(!success, "reset should be refused: stdout={}", stdout);
    assert!(stderr.contains("fetch is already in progress"), "stderr={}", stderr);
    assert!(!stdout.contains("dropped collection"));

    let (stdout, _, _) = run_mmsync(&config_path, &["status", "--json"]);
    let snapshot: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(snapshot["is_fetch_in_progress"], true);
    assert_eq!(snapshot["total_fetched_posts"], 7);

    // The forced clear stays available for crash recovery.
    let (_, _, success) = run_mmsync(&config_path, &["reset", "--flags-only"]);
    assert!(success);
    let (stdout, _, _) = run_mmsync(&config_path, &["status", "--json"]);
    let snapshot: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(snapshot["is_fetch_in_progress"], false);
}
