//! Runs the `speculator` binary against a synthetic checkpoint.

use std::path::Path;
use std::process::{Command, Output};

use speculator_core::testing::{synthetic_checkpoint, tiny_speculator_config, write_safetensors};

fn write_checkpoint(dir: &Path, tied: bool) {
    let cfg = tiny_speculator_config(tied, true);
    std::fs::write(dir.join("config.json"), serde_json::to_string(&cfg).unwrap()).unwrap();
    write_safetensors(&synthetic_checkpoint(&cfg), &dir.join("model.safetensors")).unwrap();
}

fn speculator(config_home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_speculator"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env("HOME", config_home)
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn speculator")
}

#[test]
fn inspect_reports_tying_layout() {
    let ckpt = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    write_checkpoint(ckpt.path(), true);

    let out = speculator(home.path(), &["inspect", ckpt.path().to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("\"tie_weights\": true"));
    assert!(stdout.contains(
        "distinct parameters: 1 embeddings, 2 state projections, 1 output projections, 1 norms"
    ));
}

#[test]
fn run_with_branching_succeeds() {
    let ckpt = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    write_checkpoint(ckpt.path(), false);

    let out = speculator(
        home.path(),
        &[
            "run",
            ckpt.path().to_str().unwrap(),
            "--batch",
            "3",
            "--top-k",
            "2,1,3,1",
            "--seed",
            "11",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stderr).contains("draft"));
}

#[test]
fn run_rejects_wrong_top_k_length() {
    let ckpt = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    write_checkpoint(ckpt.path(), false);

    let out = speculator(
        home.path(),
        &["run", ckpt.path().to_str().unwrap(), "--top-k", "2,2"],
    );
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("configuration error"));
}

#[test]
fn run_rejects_token_outside_vocabulary() {
    let ckpt = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    write_checkpoint(ckpt.path(), true);

    let out = speculator(
        home.path(),
        &["run", ckpt.path().to_str().unwrap(), "--token", "100000"],
    );
    assert!(!out.status.success());
}
