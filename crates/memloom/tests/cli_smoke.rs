//! CLI smoke tests.
//!
//! Drives the quickstart flow end-to-end in a temp data directory:
//! overview on a fresh install, model registration, chunk creation,
//! switch, restore, and the operation history.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;

fn memloom_cmd(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("memloom").expect("memloom binary should be built");
    cmd.env("MEMLOOM_DATA_DIR", data_dir);
    cmd.env_remove("MEMLOOM_CONFIG");
    cmd
}

fn write_model_dir(root: &Path, name: &str, vocab_size: u64) -> std::path::PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("config.json"),
        serde_json::to_string(&json!({"model_type": "llama", "vocab_size": vocab_size})).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.join("model.safetensors"), name.as_bytes()).unwrap();
    dir
}

#[test]
fn overview_on_fresh_install_is_empty() {
    let tmp = TempDir::new().unwrap();
    memloom_cmd(&tmp.path().join("data"))
        .args(["overview"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"current_model\": null"))
        .stdout(predicate::str::contains("\"total_chunks\": 0"))
        .stdout(predicate::str::contains("\"total_loras\": 0"));
}

#[test]
fn model_registration_and_chunk_flow() {
    let tmp = TempDir::new().unwrap();
    let data_dir = tmp.path().join("data");
    let model = write_model_dir(tmp.path(), "model-a", 32000);

    memloom_cmd(&data_dir)
        .args(["model", "register"])
        .arg(&model)
        .args(["--name", "alpha"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"is_new\": true"))
        .stdout(predicate::str::contains("\"friendly_name\": \"alpha\""));

    let docs_path = tmp.path().join("docs.json");
    std::fs::write(
        &docs_path,
        serde_json::to_string(&json!([{"id": "d1", "text": "x"}])).unwrap(),
    )
    .unwrap();

    memloom_cmd(&data_dir)
        .args(["chunk", "create", "--docs"])
        .arg(&docs_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"chunk_id\": \"chunk_0001\""))
        .stdout(predicate::str::contains("\"status\": \"pending\""));

    memloom_cmd(&data_dir)
        .args(["chunk", "untrained"])
        .assert()
        .success()
        .stdout(predicate::str::contains("chunk_0001"));

    memloom_cmd(&data_dir)
        .args(["history", "--limit", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("model_registered"))
        .stdout(predicate::str::contains("chunk_created"));
}

#[test]
fn switch_and_restore_flow() {
    let tmp = TempDir::new().unwrap();
    let data_dir = tmp.path().join("data");
    let model_a = write_model_dir(tmp.path(), "model-a", 32000);
    let model_b = write_model_dir(tmp.path(), "model-b", 50000);

    memloom_cmd(&data_dir)
        .args(["model", "register"])
        .arg(&model_a)
        .assert()
        .success();

    let docs_path = tmp.path().join("docs.json");
    std::fs::write(
        &docs_path,
        serde_json::to_string(&json!([{"id": "d1", "text": "x"}])).unwrap(),
    )
    .unwrap();
    memloom_cmd(&data_dir)
        .args(["chunk", "create", "--docs"])
        .arg(&docs_path)
        .assert()
        .success();
    memloom_cmd(&data_dir)
        .args(["chunk", "mark", "chunk_0001", "training"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"applied\": true"));
    memloom_cmd(&data_dir)
        .args(["chunk", "mark", "chunk_0001", "failed", "--details", "oom"])
        .assert()
        .success();

    memloom_cmd(&data_dir)
        .args(["model", "switch"])
        .arg(&model_b)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"changed\": true"))
        .stdout(predicate::str::contains("\"restorable_chunks\""));

    memloom_cmd(&data_dir)
        .args(["chunk", "restore"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"restored\""))
        .stdout(predicate::str::contains("chunk_0001"))
        .stdout(predicate::str::contains("\"text\": \"x\""));
}

#[test]
fn unknown_chunk_show_fails() {
    let tmp = TempDir::new().unwrap();
    memloom_cmd(&tmp.path().join("data"))
        .args(["chunk", "show", "chunk_9999"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown chunk"));
}

#[test]
fn adapter_select_unknown_prints_null() {
    let tmp = TempDir::new().unwrap();
    memloom_cmd(&tmp.path().join("data"))
        .args(["adapter", "select", "lora_9999"])
        .assert()
        .success()
        .stdout(predicate::str::contains("null"));
}
