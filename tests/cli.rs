//! End-to-end tests for the `duelstore` binary.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use duelstore::storage::SqliteStore;
use tempfile::TempDir;

fn duelstore(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("duelstore").unwrap();
    cmd.env_remove("DUELSTORE_DB")
        .env_remove("DUELSTORE_TEST_DB")
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(db);
    cmd
}

fn db_path(temp_dir: &TempDir) -> PathBuf {
    temp_dir.path().join("data").join("duelstore.db")
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

fn stderr_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stderr).unwrap()
}

/// Migrated store with two decks and a match on each.
fn seeded(temp_dir: &TempDir) -> PathBuf {
    let db = db_path(temp_dir);
    duelstore(&db).args(["-q", "migrate"]).assert().success();

    let store = SqliteStore::open(&db).unwrap();
    store
        .conn()
        .execute_batch(
            "INSERT INTO decks (name, archived, created_at)
                 VALUES ('Blue-Eyes', 0, 1700000000000), ('Dark Magician', 0, 1700000001000);
             INSERT INTO matches (deck_name, deck_id, result, played_at)
                 VALUES ('Blue-Eyes', 1, 'win', 1700000100000),
                        ('Dark Magician', 2, 'loss', 1700000200000);",
        )
        .unwrap();
    db
}

#[test]
fn test_version() {
    let temp_dir = TempDir::new().unwrap();
    let output = duelstore(&db_path(&temp_dir))
        .args(["version", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["schema_version"], "004");
}

#[test]
fn test_status_without_store_is_not_initialized() {
    let temp_dir = TempDir::new().unwrap();
    let output = duelstore(&db_path(&temp_dir))
        .args(["-q", "status", "--json"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    assert_eq!(stderr_json(&output)["error"]["code"], "NOT_INITIALIZED");
}

#[test]
fn test_migrate_then_status() {
    let temp_dir = TempDir::new().unwrap();
    let db = db_path(&temp_dir);

    let output = duelstore(&db).args(["migrate", "--json"]).output().unwrap();
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["migration"]["to"], "004");
    assert_eq!(json["migration"]["applied"].as_array().unwrap().len(), 4);

    let output = duelstore(&db).args(["status", "--json"]).output().unwrap();
    let json = stdout_json(&output);
    assert_eq!(json["current"], "004");
    assert!(json["pending"].as_array().unwrap().is_empty());

    let output = duelstore(&db).args(["migrate", "--json"]).output().unwrap();
    assert!(stdout_json(&output)["migration"]["applied"]
        .as_array()
        .unwrap()
        .is_empty());
}

#[test]
fn test_migrate_to_target_leaves_steps_pending() {
    let temp_dir = TempDir::new().unwrap();
    let db = db_path(&temp_dir);

    duelstore(&db)
        .args(["-q", "migrate", "--target", "002"])
        .assert()
        .success();

    let output = duelstore(&db).args(["status", "--json"]).output().unwrap();
    let json = stdout_json(&output);
    assert_eq!(json["current"], "002");
    assert_eq!(json["pending"].as_array().unwrap().len(), 2);
}

#[test]
fn test_migrate_rejects_malformed_target() {
    let temp_dir = TempDir::new().unwrap();
    let output = duelstore(&db_path(&temp_dir))
        .args(["-q", "migrate", "--target", "next", "--json"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(4));
    assert_eq!(stderr_json(&output)["error"]["code"], "VERSION_PARSE_ERROR");
}

#[test]
fn test_check() {
    let temp_dir = TempDir::new().unwrap();
    let db = seeded(&temp_dir);
    duelstore(&db).arg("check").assert().success();

    let garbage = temp_dir.path().join("garbage.db");
    std::fs::write(&garbage, b"this is not a database, it is a text file").unwrap();
    let output = duelstore(&garbage)
        .args(["check", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(stdout_json(&output)["ok"], false);
    assert!(garbage.exists(), "check must not quarantine");
}

#[test]
fn test_backup_and_restore_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let db = seeded(&temp_dir);
    let archive = temp_dir.path().join("backup.zip");

    let output = duelstore(&db)
        .args(["backup", "--json"])
        .arg(&archive)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["schema_version"], "004");

    let other = temp_dir.path().join("other").join("duelstore.db");
    let output = duelstore(&other)
        .args(["-q", "restore", "--mode", "full"])
        .arg(&archive)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains(
        "table=decks inserted=2 updated=0 unchanged=0 skipped=0 deleted=0 errors=0"
    ));
    assert!(stdout.contains("table=matches inserted=2"));

    let output = duelstore(&other)
        .args(["restore", "--mode", "upsert", "--dry-run", "--json"])
        .arg(&archive)
        .output()
        .unwrap();
    let json = stdout_json(&output);
    assert_eq!(json["dry_run"], true);
    assert_eq!(json["tables"][0]["rows_unchanged"], 2);
}

#[test]
fn test_restore_missing_archive_fails() {
    let temp_dir = TempDir::new().unwrap();
    let db = seeded(&temp_dir);

    let output = duelstore(&db)
        .args(["-q", "restore", "--json"])
        .arg(temp_dir.path().join("missing.zip"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(8));
    assert_eq!(stderr_json(&output)["error"]["code"], "IO_ERROR");
}

#[test]
fn test_restore_rejects_unknown_mode() {
    let temp_dir = TempDir::new().unwrap();
    duelstore(&db_path(&temp_dir))
        .args(["restore", "backup.zip", "--mode", "merge"])
        .assert()
        .failure();
}
