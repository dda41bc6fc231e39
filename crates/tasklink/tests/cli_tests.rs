//! Integration tests for the tasklink CLI.

use rstest::{fixture, rstest};
use tempfile::TempDir;

mod common;
use common::run_tasklink_in_dir;

// ============================================================================
// Test Fixtures
// ============================================================================

/// Provides a fresh temporary directory for each test
#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Provides a temporary directory with an initialized tasklink repository
#[fixture]
fn initialized_dir() -> TempDir {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let output = run_tasklink_in_dir(temp.path(), &["init", "--quiet"]);
    assert!(
        output.status.success(),
        "Failed to initialize tasklink: {:?}",
        String::from_utf8_lossy(&output.stderr)
    );
    temp
}

// ============================================================================
// Help and Init Tests
// ============================================================================

#[test]
fn test_cli_help_shows_all_commands() {
    let dir = TempDir::new().unwrap();
    let output = run_tasklink_in_dir(dir.path(), &["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["init", "status", "sync", "verify", "conflicts"] {
        assert!(stdout.contains(command), "help is missing {command}");
    }
}

#[rstest]
fn test_init_creates_layout(temp_dir: TempDir) {
    let output = run_tasklink_in_dir(temp_dir.path(), &["init"]);

    assert!(output.status.success());
    let tasklink_dir = temp_dir.path().join(".tasklink");
    assert!(tasklink_dir.join("config.yaml").exists());
    assert!(tasklink_dir.join("tasks.json").exists());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Initialized tasklink"));
}

#[rstest]
fn test_init_twice_fails(initialized_dir: TempDir) {
    let output = run_tasklink_in_dir(initialized_dir.path(), &["init"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already initialized"));
}

// ============================================================================
// Status and Sync Tests
// ============================================================================

#[rstest]
fn test_status_outside_repository(temp_dir: TempDir) {
    let output = run_tasklink_in_dir(temp_dir.path(), &["status"]);
    assert!(!output.status.success());
}

#[rstest]
fn test_status_json_not_configured(initialized_dir: TempDir) {
    let output = run_tasklink_in_dir(initialized_dir.path(), &["status", "--json"]);

    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["configured"], false);
    assert_eq!(status["syncState"], "not_configured");
}

#[rstest]
fn test_sync_not_configured_fails(initialized_dir: TempDir) {
    let output = run_tasklink_in_dir(initialized_dir.path(), &["sync", "--json"]);

    assert!(!output.status.success());
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["success"], false);
    assert_eq!(result["errors"][0]["kind"], "validation");
}

#[rstest]
fn test_conflicts_list_empty(initialized_dir: TempDir) {
    let output = run_tasklink_in_dir(initialized_dir.path(), &["conflicts", "list"]);

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No unresolved conflicts"));
}

#[rstest]
fn test_undo_with_empty_history_fails(initialized_dir: TempDir) {
    let output = run_tasklink_in_dir(initialized_dir.path(), &["conflicts", "undo"]);
    assert!(!output.status.success());
}
