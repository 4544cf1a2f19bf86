use std::fs;
use std::path::Path;

use predicates::prelude::*;
use sigscope_core::config::WorkspaceLayout;
use tempfile::tempdir;

const PTRACE_SNAPSHOT: &str = r#"
binary: denier
strings:
  - { value: "attached to LLDB?", procedure: main, address: 0x1010 }
constants:
  - { value: 31, procedure: main, address: 0x1004 }
xrefs:
  - { procedure: main, address: 0x1008, target: 0x2000, target_name: _ptrace }
  - { procedure: probe, address: 0x3000, target: 0x2100, target_name: mach_absolute_time }
  - { procedure: probe2, address: 0x3100, target: 0x2200, target_name: isatty }
"#;

fn write_snapshot(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("denier.yaml");
    fs::write(&path, PTRACE_SNAPSHOT).expect("write snapshot");
    path
}

fn sigscope() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("sigscope")
}

fn run_json(args: &[&str], root: &Path) -> serde_json::Value {
    let output = sigscope()
        .arg("--root")
        .arg(root)
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("stdout is JSON")
}

#[test]
fn init_writes_config_and_directories() {
    let dir = tempdir().expect("tempdir");
    sigscope()
        .arg("--root")
        .arg(dir.path())
        .args(["init", "--name", "lab"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized sigscope workspace"));

    let layout = WorkspaceLayout::new(dir.path());
    assert!(layout.config_path.is_file());
    assert!(layout.outputs_binaries_dir.is_dir());
    let body = fs::read_to_string(&layout.config_path).unwrap();
    assert!(body.contains("\"name\": \"lab\""));

    // A second init keeps the existing config.
    sigscope()
        .arg("--root")
        .arg(dir.path())
        .args(["init", "--name", "other"])
        .assert()
        .success()
        .stdout(predicate::str::contains("existing, kept"));
    assert!(fs::read_to_string(&layout.config_path).unwrap().contains("\"lab\""));
}

#[test]
fn analyzers_lists_every_entry_point() {
    let dir = tempdir().expect("tempdir");
    let value = run_json(&["analyzers", "--json"], dir.path());
    let list = value.as_array().expect("array");
    assert_eq!(list.len(), 13);
    assert!(list.iter().any(|a| a["name"] == "process-injection"));
    let all = list.iter().find(|a| a["name"] == "all").unwrap();
    assert_eq!(all["categories"].as_array().unwrap().len(), 12);
}

#[test]
fn analyze_snapshot_fuses_ptrace_with_debugger_strings() {
    let dir = tempdir().expect("tempdir");
    let facts = write_snapshot(dir.path());
    let value = run_json(
        &["analyze", "anti-analysis", "--facts", facts.to_str().unwrap(), "--json"],
        dir.path(),
    );

    let report = &value["report"];
    assert_eq!(report["binary_id"], "denier");
    assert_eq!(report["title"], "Anti-Analysis Detection Report");
    let section = &report["per_category"]["anti-debug"];
    let top = &section["findings"][0];
    assert_eq!(top["rule"], "anti_debug.ptrace_with_debugger_strings");
    assert_eq!(top["location"], "main");
    assert_eq!(top["confidence"].as_f64().unwrap(), 0.88);
    assert_eq!(section["score"].as_f64().unwrap(), 0.88);
    assert_eq!(report["overall_risk_score"].as_f64().unwrap(), 88.0);
    assert_eq!(report["risk_level"], "critical");
}

#[test]
fn analyze_text_output_names_the_fused_rule() {
    let dir = tempdir().expect("tempdir");
    let facts = write_snapshot(dir.path());
    sigscope()
        .arg("--root")
        .arg(dir.path())
        .args(["analyze", "anti-debug", "--facts"])
        .arg(&facts)
        .assert()
        .success()
        .stdout(predicate::str::contains("anti_debug.ptrace_with_debugger_strings"))
        .stdout(predicate::str::contains("Overall risk: 88.00 (critical)"));
}

#[test]
fn top_caps_listed_findings_but_not_totals() {
    let dir = tempdir().expect("tempdir");
    let facts = write_snapshot(dir.path());
    let value = run_json(
        &["analyze", "anti-analysis", "--facts", facts.to_str().unwrap(), "--json", "--top", "1"],
        dir.path(),
    );
    let section = &value["report"]["per_category"]["anti-debug"];
    assert_eq!(section["findings"].as_array().unwrap().len(), 1);
    assert_eq!(section["total_findings"].as_u64().unwrap(), 3);
}

#[test]
fn all_analyzer_reports_every_category_even_without_findings() {
    let dir = tempdir().expect("tempdir");
    let facts = write_snapshot(dir.path());
    let value = run_json(
        &["analyze", "all", "--facts", facts.to_str().unwrap(), "--json"],
        dir.path(),
    );
    let per_category = value["report"]["per_category"].as_object().unwrap();
    assert_eq!(per_category.len(), 12);
    assert_eq!(per_category["xpc"]["score"].as_f64().unwrap(), 0.0);
    assert!(per_category["xpc"]["findings"].as_array().unwrap().is_empty());
}

#[test]
fn save_writes_report_and_metadata() {
    let dir = tempdir().expect("tempdir");
    let facts = write_snapshot(dir.path());
    sigscope()
        .arg("--root")
        .arg(dir.path())
        .args(["analyze", "anti-analysis", "--save", "--facts"])
        .arg(&facts)
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved run"));

    let layout = WorkspaceLayout::new(dir.path().canonicalize().unwrap());
    let run_dir = layout.analyzer_output_dir("denier.yaml", "anti-analysis");
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("report.json")).unwrap()).unwrap();
    assert_eq!(report["report"]["binary_id"], "denier");

    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("run_metadata.json")).unwrap())
            .unwrap();
    assert_eq!(meta["analyzer"], "anti-analysis");
    assert_eq!(meta["provider"], "snapshot");
    assert_eq!(meta["input_sha256"].as_str().unwrap().len(), 64);
    assert_eq!(meta["risk_level"], "critical");
}

#[test]
fn config_category_weights_and_min_confidence_apply() {
    let dir = tempdir().expect("tempdir");
    let facts = write_snapshot(dir.path());
    let config = dir.path().join("weights.yaml");
    fs::write(
        &config,
        "report:\n  min_confidence: 0.9\n  category_weights:\n    anti-debug: 3.0\n",
    )
    .unwrap();

    let output = sigscope()
        .arg("--root")
        .arg(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["analyze", "anti-analysis", "--json", "--facts"])
        .arg(&facts)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
    // 0.88 is below the configured floor, so nothing survives.
    assert_eq!(value["report"]["per_category"]["anti-debug"]["total_findings"], 0);
    assert_eq!(value["report"]["overall_risk_score"].as_f64().unwrap(), 0.0);
}

#[test]
fn missing_input_fails() {
    let dir = tempdir().expect("tempdir");
    sigscope()
        .arg("--root")
        .arg(dir.path())
        .args(["analyze", "xpc", "--facts", "nope.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn unknown_analyzer_and_provider_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let facts = write_snapshot(dir.path());
    sigscope()
        .args(["analyze", "bogus", "--facts"])
        .arg(&facts)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown analyzer"));

    sigscope()
        .arg("--root")
        .arg(dir.path())
        .args(["analyze", "xpc", "--provider", "ghidra", "--facts"])
        .arg(&facts)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown fact provider 'ghidra'"));
}

#[test]
fn analyze_requires_an_input() {
    sigscope().args(["analyze", "xpc"]).assert().failure();
}

#[test]
fn malformed_snapshot_fails_the_run() {
    let dir = tempdir().expect("tempdir");
    let facts = dir.path().join("broken.json");
    fs::write(&facts, "{ not json").unwrap();
    sigscope()
        .arg("--root")
        .arg(dir.path())
        .args(["analyze", "xpc", "--facts"])
        .arg(&facts)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Malformed input"));
}

#[test]
fn signatures_filter_by_category() {
    let dir = tempdir().expect("tempdir");
    let value = run_json(&["signatures", "--category", "xpc", "--json"], dir.path());
    let sigs = value["signatures"].as_array().unwrap();
    assert!(!sigs.is_empty());
    assert!(sigs.iter().all(|s| s["category"] == "xpc"));
    assert!(value["rules"].as_array().unwrap().iter().all(|r| r["category"] == "xpc"));
}

#[test]
fn validate_catalogue_accepts_and_rejects() {
    let dir = tempdir().expect("tempdir");
    let good = dir.path().join("good");
    fs::create_dir_all(&good).unwrap();
    fs::write(
        good.join("xpc.yaml"),
        "version: 1\ncategory: xpc\nsignatures:\n  - id: xpc.demo\n    weight: 0.5\n    match:\n      - symbols: [xpc_main]\n",
    )
    .unwrap();
    sigscope()
        .arg("--root")
        .arg(dir.path())
        .args(["validate-catalogue", "--dir"])
        .arg(&good)
        .assert()
        .success()
        .stdout(predicate::str::contains("Catalogue OK"))
        .stdout(predicate::str::contains("Signatures: 1"));

    let bad = dir.path().join("bad");
    fs::create_dir_all(&bad).unwrap();
    fs::write(
        bad.join("xpc.yaml"),
        "version: 1\ncategory: xpc\nsignatures:\n  - id: dup\n    weight: 0.5\n    match: [{ symbols: [a] }]\n  - id: dup\n    weight: 0.5\n    match: [{ symbols: [b] }]\n",
    )
    .unwrap();
    sigscope()
        .arg("--root")
        .arg(dir.path())
        .args(["validate-catalogue", "--dir"])
        .arg(&bad)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Duplicate signature or rule id 'dup'"));
}

#[test]
fn configured_catalogue_replaces_the_builtin_one() {
    let dir = tempdir().expect("tempdir");
    let catalogue = dir.path().join("catalogue");
    fs::create_dir_all(&catalogue).unwrap();
    fs::write(
        catalogue.join("anti-debug.yaml"),
        "version: 1\ncategory: anti-debug\nsignatures:\n  - id: custom.ptrace\n    weight: 0.5\n    match: [{ symbols: [ptrace] }]\n",
    )
    .unwrap();
    let meta = dir.path().join(".sigscope");
    fs::create_dir_all(&meta).unwrap();
    fs::write(meta.join("config.json"), r#"{ "catalogue": "catalogue" }"#).unwrap();
    let facts = write_snapshot(dir.path());

    let value = run_json(
        &["analyze", "anti-analysis", "--facts", facts.to_str().unwrap(), "--json"],
        dir.path(),
    );
    let findings = value["report"]["per_category"]["anti-debug"]["findings"].as_array().unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0]["contributing_signatures"][0], "custom.ptrace");
}

#[cfg(feature = "capstone-backend")]
#[test]
fn raw_blob_with_direct_syscall_is_flagged() {
    let dir = tempdir().expect("tempdir");
    // mov eax, 0x2000004 ; syscall ; nop padding
    let mut blob = vec![0xb8, 0x04, 0x00, 0x00, 0x02, 0x0f, 0x05];
    blob.resize(32, 0x90);
    let path = dir.path().join("blob.bin");
    fs::write(&path, &blob).unwrap();

    let value = run_json(
        &["analyze", "syscall", "--binary", path.to_str().unwrap(), "--arch", "x86_64", "--json"],
        dir.path(),
    );
    let report = &value["report"];
    assert!(report["binary_id"].as_str().unwrap().starts_with("blob.bin@sha256:"));
    let findings = report["per_category"]["syscall"]["findings"].as_array().unwrap();
    assert!(findings.iter().any(|f| f["rule"] == "syscall.direct_invocation"));
    assert!(findings.iter().all(|f| f["location"] == "sub_0"));
}
