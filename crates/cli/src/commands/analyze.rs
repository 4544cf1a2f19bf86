use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sigscope_core::engine::{ReportSink, RunWarning};
use sigscope_core::providers::{default_provider_registry, FactRequest};
use sigscope_core::{Analyzer, Pipeline, Report};
use tracing::{debug, info};

use crate::commands::{resolve_input, Workspace};
use crate::render::{render_or_warn, ConsoleSink, JsonSink};
use crate::{binary_output_name, sha256_file};

/// Provider used for `--binary` when neither the flag nor the config names one.
#[cfg(feature = "capstone-backend")]
const DEFAULT_BINARY_PROVIDER: &str = "capstone";
#[cfg(not(feature = "capstone-backend"))]
const DEFAULT_BINARY_PROVIDER: &str = "snapshot";

/// What `analyze` reads facts from.
#[derive(Debug, Clone)]
pub enum AnalyzeInput {
    Binary(String),
    Facts(String),
}

#[derive(Debug, Clone)]
pub struct AnalyzeArgs {
    pub analyzer: Analyzer,
    pub input: AnalyzeInput,
    pub provider: Option<String>,
    pub arch: Option<String>,
    pub json: bool,
    pub save: bool,
    pub top: Option<usize>,
    pub min_confidence: Option<f64>,
}

/// Written next to `report.json` when a run is saved.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub analyzer: String,
    pub binary: String,
    pub binary_id: String,
    pub input: String,
    pub input_sha256: String,
    pub provider: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_findings: usize,
    pub overall_risk_score: f64,
    pub risk_level: String,
    pub warnings: usize,
    pub tool_version: String,
}

pub fn analyze_command(root: &str, config: Option<&str>, args: AnalyzeArgs) -> Result<()> {
    let workspace = Workspace::open(root, config)?;
    debug!(root = %workspace.root().display(), config = ?workspace.config_source, "workspace opened");
    let registry = workspace.load_registry()?;

    let (raw_path, default_provider) = match &args.input {
        AnalyzeInput::Binary(path) => {
            let fallback = workspace.config.provider.as_deref().unwrap_or(DEFAULT_BINARY_PROVIDER);
            (path.as_str(), fallback)
        }
        AnalyzeInput::Facts(path) => (path.as_str(), "snapshot"),
    };
    let input_path = resolve_input(workspace.root(), raw_path);
    if !input_path.is_file() {
        bail!("Input file does not exist: {}", input_path.display());
    }

    let provider_name = args.provider.clone().unwrap_or_else(|| default_provider.to_string());
    let providers = default_provider_registry();
    let provider = providers.get(&provider_name).ok_or_else(|| {
        anyhow!(
            "Unknown fact provider '{}'. Available: {}",
            provider_name,
            providers.names().join(", ")
        )
    })?;

    let mut options = workspace.config.run_options();
    if let Some(top) = args.top {
        options.report.top_n = Some(top);
    }
    if let Some(min) = args.min_confidence {
        options.report.min_confidence = min;
    }

    let request = FactRequest {
        path: input_path.clone(),
        arch: args.arch.clone(),
        max_instructions: workspace.config.max_instructions,
    };

    let started_at = Utc::now().to_rfc3339();
    debug!(analyzer = %args.analyzer, provider = %provider_name, input = %input_path.display(), "starting run");
    let outcome = Pipeline::new(&registry)
        .with_options(options)
        .run(provider, &request, args.analyzer)
        .with_context(|| format!("Analysis of {} failed", input_path.display()))?;
    let finished_at = Utc::now().to_rfc3339();

    let stdout = io::stdout();
    let rendered = if args.json {
        render_or_warn(&mut JsonSink::new(stdout.lock()), &outcome.report, &outcome.warnings)
    } else {
        render_or_warn(&mut ConsoleSink::new(stdout.lock()), &outcome.report, &outcome.warnings)
    };
    debug!(rendered, "console output done");

    if args.save {
        let saved = SavedRun {
            analyzer: args.analyzer,
            input: &input_path,
            provider: &provider_name,
            started_at,
            finished_at,
        };
        let dir = saved.write(&workspace, &outcome.report, &outcome.warnings)?;
        if !args.json {
            println!();
            println!("Saved run: {}", dir.display());
        }
    }

    Ok(())
}

struct SavedRun<'a> {
    analyzer: Analyzer,
    input: &'a Path,
    provider: &'a str,
    started_at: String,
    finished_at: String,
}

impl SavedRun<'_> {
    /// Writes `outputs/binaries/<binary>/<analyzer>/{report.json,run_metadata.json}`.
    fn write(&self, workspace: &Workspace, report: &Report, warnings: &[RunWarning]) -> Result<PathBuf> {
        let binary = binary_output_name(self.input);
        let dir = workspace.layout.analyzer_output_dir(&binary, self.analyzer.as_str());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output dir {}", dir.display()))?;

        let report_path = dir.join("report.json");
        let file = fs::File::create(&report_path)
            .with_context(|| format!("Failed to create {}", report_path.display()))?;
        // Unlike console output, a saved report that failed to write is an error.
        JsonSink::new(io::BufWriter::new(file))
            .render(report, warnings)
            .with_context(|| format!("Failed to write report at {}", report_path.display()))?;

        let metadata = RunMetadata {
            analyzer: self.analyzer.as_str().to_string(),
            binary,
            binary_id: report.binary_id.clone(),
            input: self.input.display().to_string(),
            input_sha256: sha256_file(self.input)?,
            provider: self.provider.to_string(),
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
            total_findings: report.total_findings(),
            overall_risk_score: report.overall_risk_score,
            risk_level: report.risk_level.as_str().to_string(),
            warnings: warnings.len(),
            tool_version: sigscope_core::version().to_string(),
        };
        let metadata_path = dir.join("run_metadata.json");
        fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?).with_context(|| {
            format!("Failed to write run metadata at {}", metadata_path.display())
        })?;

        info!(dir = %dir.display(), "saved run outputs");
        Ok(dir)
    }
}
