//! Integration tests for the spectra-net CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Run the spectra-net binary with the given arguments.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("spectra-net").expect("Failed to find spectra-net binary");
    cmd.args(args);
    cmd
}

/// Small architecture over 8 output columns, with data under `root/data`.
fn write_small_setup(root: &Path) -> String {
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let mut rows = String::new();
    for i in 0..20 {
        let x = i as f32 / 20.0;
        rows.push_str(&format!("{x} {}", 1.0 - x));
        for j in 0..8 {
            rows.push_str(&format!(" {}", x * j as f32));
        }
        rows.push('\n');
    }
    fs::write(data_dir.join("train.txt"), rows).unwrap();

    let config = format!(
        r#"
model_name: cli_run
models_dir: "{models}"
data:
  data_dir: "{data}"
  train_file: train.txt
  valid_file: null
  y_range: [2, 9]
  batch_size: 4
model:
  fc_filters: [4]
  tconv_dims: [8]
  tconv_filters: [2]
training:
  train_step: 6
  verb_step: 2
  eval_step: 3
  save_step: 3
"#,
        models = root.join("models").display(),
        data = data_dir.display(),
    );
    let config_path = root.join("config.yaml");
    fs::write(&config_path, config).unwrap();
    config_path.to_string_lossy().into_owned()
}

#[test]
fn test_init_writes_default_config() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("config.yaml");

    run_cli(&["init", output.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));

    let text = fs::read_to_string(&output).unwrap();
    assert!(text.contains("fc_filters"));
    assert!(text.contains("TrainDataV9.txt"));
}

#[test]
fn test_validate_defaults() {
    run_cli(&["validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Output size: 1001"));
}

#[test]
fn test_validate_rejects_bad_fold() {
    run_cli(&["validate", "--cross-val", "3", "--val-fold", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("val_fold"));
}

#[test]
fn test_validate_rejects_mismatched_y_range() {
    run_cli(&["validate", "--y-range", "2,100"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("y_range"));
}

#[test]
fn test_validate_missing_config_file() {
    run_cli(&["validate", "--config", "/nonexistent/config.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/config.yaml"));
}

#[test]
fn test_train_evaluate_compare() {
    let temp = TempDir::new().unwrap();
    let config = write_small_setup(temp.path());

    run_cli(&["train", "--config", &config])
        .assert()
        .success()
        .stdout(predicate::str::contains("Trained cli_run for 6 steps"));
    assert!(temp
        .path()
        .join("models/cli_run/model.safetensors")
        .exists());

    run_cli(&["evaluate", "--config", &config])
        .assert()
        .success()
        .stdout(predicate::str::contains("Samples:  4"));

    let pred = temp.path().join("data/test_pred_cli_run.csv");
    let truth = temp.path().join("data/test_truth_cli_run.csv");
    run_cli(&[
        "compare",
        "--pred",
        pred.to_str().unwrap(),
        "--truth",
        truth.to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("Avg MSE"));
}

#[test]
fn test_train_resume_continues_step_count() {
    let temp = TempDir::new().unwrap();
    let config = write_small_setup(temp.path());

    run_cli(&["train", "--config", &config]).assert().success();
    run_cli(&["train", "--config", &config, "--resume", "--train-step", "2"])
        .assert()
        .success();

    let state = fs::read_to_string(temp.path().join("models/cli_run/training_state.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state).unwrap();
    assert_eq!(state["step"], 8);
}
