use std::fs;
use std::path::PathBuf;

use sigscope_core::providers::{
    default_provider_registry, FactAccessError, FactProvider, FactRequest, SnapshotProvider,
};
use sigscope_core::{
    Analyzer, CancellationToken, Category, FactModel, Pipeline, Registry, RunError, Stage,
};
use tempfile::tempdir;

const SNAPSHOT: &str = r#"{
  "binary": "",
  "symbols": [{ "name": "_ptrace", "kind": "import", "procedure": "main", "address": "0x1000" }],
  "constants": [{ "value": 31, "procedure": "main", "address": "0x1004" }],
  "strings": [{ "value": "LLDB", "procedure": "main", "address": "0x1010" }],
  "xrefs": [{ "procedure": "main", "address": "0x1008", "target": "0x2000", "target_name": "_ptrace" }]
}"#;

/// Hands back a fixed model, cancelling the token while "collecting" facts.
struct CancellingProvider {
    token: CancellationToken,
}

impl FactProvider for CancellingProvider {
    fn facts(&self, _request: &FactRequest) -> Result<FactModel, FactAccessError> {
        self.token.cancel();
        Ok(FactModel::empty("cancelled"))
    }

    fn name(&self) -> &'static str {
        "cancelling"
    }
}

struct BrokenProvider;

impl FactProvider for BrokenProvider {
    fn facts(&self, request: &FactRequest) -> Result<FactModel, FactAccessError> {
        Err(FactAccessError::Malformed {
            path: request.path.clone(),
            message: "truncated export".into(),
        })
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

#[test]
fn snapshot_provider_runs_end_to_end() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.json");
    fs::write(&path, SNAPSHOT).unwrap();

    let registry = Registry::load().unwrap();
    let outcome = Pipeline::new(&registry)
        .run(&SnapshotProvider, &FactRequest::new(&path), Analyzer::AntiAnalysis)
        .unwrap();

    // Empty `binary` falls back to the file stem.
    assert_eq!(outcome.report.binary_id, "sample");
    assert_eq!(outcome.report.facts.total(), 4);
    assert!(outcome.report.overall_risk_score > 0.0);

    let top = &outcome.report.category(Category::AntiDebug).unwrap().findings[0];
    assert_eq!(top.rule.as_deref(), Some("anti_debug.ptrace_with_debugger_strings"));
    assert_eq!(top.confidence, 0.88);
    assert_eq!(top.address, 0x1000);
}

#[test]
fn cancellation_before_the_run_stops_at_scanning() {
    let registry = Registry::load().unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let pipeline = Pipeline::new(&registry).with_cancellation(token);

    let err = pipeline.analyze(&FactModel::empty("x"), Analyzer::All).unwrap_err();
    assert!(matches!(err, RunError::Cancelled { stage: Stage::Scanning }));
    assert_eq!(err.stage(), Stage::Scanning);
}

#[test]
fn cancellation_during_collection_stops_before_correlating() {
    let registry = Registry::load().unwrap();
    let pipeline = Pipeline::new(&registry);
    let provider = CancellingProvider { token: pipeline.cancellation() };

    let err = pipeline
        .run(&provider, &FactRequest::new("ignored"), Analyzer::All)
        .unwrap_err();
    assert!(matches!(err, RunError::Cancelled { stage: Stage::Correlating }));
}

#[test]
fn provider_failures_surface_as_fact_access_errors() {
    let registry = Registry::load().unwrap();
    let err = Pipeline::new(&registry)
        .run(&BrokenProvider, &FactRequest::new("export.json"), Analyzer::Network)
        .unwrap_err();
    match err {
        RunError::FactAccess { stage, source } => {
            assert_eq!(stage, Stage::Scanning);
            assert!(source.to_string().contains("truncated export"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn missing_snapshot_is_reported_as_missing_binary() {
    let registry = Registry::load().unwrap();
    let path = PathBuf::from("/definitely/not/here.json");
    let err = Pipeline::new(&registry)
        .run(&SnapshotProvider, &FactRequest::new(&path), Analyzer::All)
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::FactAccess { source: FactAccessError::MissingBinary(p), .. } if p == path
    ));
}

#[test]
fn malformed_yaml_snapshot_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.yaml");
    fs::write(&path, "symbols: [ { name: ").unwrap();
    let err = SnapshotProvider.facts(&FactRequest::new(&path)).unwrap_err();
    assert!(matches!(err, FactAccessError::Malformed { .. }));
}

#[test]
fn one_registry_serves_concurrent_runs() {
    let registry = Registry::shared().unwrap();
    let model = FactModel::empty("shared");
    std::thread::scope(|s| {
        let handles: Vec<_> = Analyzer::ALL
            .iter()
            .map(|analyzer| {
                let model = &model;
                s.spawn(move || Pipeline::new(registry).analyze(model, *analyzer))
            })
            .collect();
        for handle in handles {
            let outcome = handle.join().unwrap().unwrap();
            assert_eq!(outcome.report.total_findings(), 0);
        }
    });
}

#[test]
fn default_providers_are_selectable_by_name() {
    let providers = default_provider_registry();
    assert!(providers.get("snapshot").is_some());
    assert!(providers.get("ghidra").is_none());
    #[cfg(feature = "capstone-backend")]
    assert_eq!(providers.names(), vec!["capstone".to_string(), "snapshot".to_string()]);
}
