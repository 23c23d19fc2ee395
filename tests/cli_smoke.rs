//! Smoke tests for the studyweave binary: exit codes and written files.

use assert_cmd::assert::OutputAssertExt;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn studyweave(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("studyweave"));
    cmd.current_dir(dir)
        .env("STUDYWEAVE_HOME", dir.join(".studyweave"))
        .env_remove("RUST_LOG");
    cmd
}

fn write_document(dir: &Path) -> std::path::PathBuf {
    let document = json!({
        "title": "Software Design Study Guide",
        "chapters": [
            {
                "id": "ch1",
                "title": "Domain Modeling",
                "text": "An entity is defined by its identity.",
                "companion_excerpts": [
                    {"id": "ddd-5", "book": "Domain-Driven Design", "section": "5", "text": "Entities."}
                ]
            },
            {"id": "ch2", "title": "Persistence", "text": "Repositories hand out aggregates."}
        ]
    });
    let path = dir.join("guide.json");
    fs::write(&path, document.to_string()).unwrap();
    path
}

#[test]
fn version_output() {
    let temp = TempDir::new().unwrap();
    studyweave(temp.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("studyweave"));
}

#[test]
fn degraded_run_writes_documents_and_report() {
    let temp = TempDir::new().unwrap();
    let input = write_document(temp.path());
    let out = temp.path().join("out");

    studyweave(temp.path())
        .args(["enhance", "--provider", "none", "--input"])
        .arg(&input)
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 2 chapter documents"));

    let chapter = fs::read_to_string(out.join("ch1.md")).unwrap();
    assert!(chapter.starts_with("# Domain Modeling"));
    assert!(chapter.contains("An entity is defined by its identity."));

    let report: Value =
        serde_json::from_str(&fs::read_to_string(out.join("usage-report.json")).unwrap()).unwrap();
    assert_eq!(report["degraded"], true);
    assert_eq!(report["provider"], "none");
    assert_eq!(report["provider_calls"], 0);
    assert_eq!(report["chapters"].as_array().unwrap().len(), 2);
}

#[test]
fn unreadable_document_exits_with_cli_args() {
    let temp = TempDir::new().unwrap();
    studyweave(temp.path())
        .args(["enhance", "--provider", "none", "--input", "missing.json", "--out", "out"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing.json"));
}

#[test]
fn duplicate_chapter_ids_are_rejected() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("dup.json");
    fs::write(
        &input,
        json!({
            "title": "t",
            "chapters": [
                {"id": "ch1", "title": "a", "text": "x"},
                {"id": "ch1", "title": "b", "text": "y"}
            ]
        })
        .to_string(),
    )
    .unwrap();

    studyweave(temp.path())
        .args(["enhance", "--provider", "none", "--out", "out", "--input"])
        .arg(&input)
        .assert()
        .code(2);
}

#[test]
fn unknown_provider_is_a_configuration_error() {
    let temp = TempDir::new().unwrap();
    let input = write_document(temp.path());
    studyweave(temp.path())
        .args(["enhance", "--provider", "gpt-cli", "--out", "out", "--input"])
        .arg(&input)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("llm.provider"));
}

#[test]
fn cache_stats_json_and_clear() {
    let temp = TempDir::new().unwrap();
    let cache_dir = temp.path().join("cache");

    let output = studyweave(temp.path())
        .args(["cache", "stats", "--json", "--cache-dir"])
        .arg(&cache_dir)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stats: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["phase1_entries"], 0);
    assert_eq!(stats["phase2_entries"], 0);

    studyweave(temp.path())
        .args(["cache", "clear", "--phase", "phase1", "--cache-dir"])
        .arg(&cache_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 phase1 entries"));
}
