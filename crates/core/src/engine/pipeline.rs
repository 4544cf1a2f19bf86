//! One analysis run: Idle -> Scanning -> Correlating -> Scoring -> Reporting -> Idle.
//!
//! A run either returns a complete [`Report`] (plus warnings) or a [`RunError`] naming the
//! stage it died in; there is no partial report. Cancellation is observed at every stage
//! transition, never in the middle of a stage.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::correlate::{correlate, CorrelationRuleConflict};
use super::matcher::RawMatch;
use super::report::{Report, ReportBuilder};
use super::scoring::score_all;
use crate::analyzers::Analyzer;
use crate::config::ReportConfig;
use crate::model::{Category, FactModel};
use crate::providers::{FactAccessError, FactProvider, FactRequest};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Scanning,
    Correlating,
    Scoring,
    Reporting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Scanning => "scanning",
            Stage::Correlating => "correlating",
            Stage::Scoring => "scoring",
            Stage::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

/// Shared abort flag. Cloning hands out another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Recoverable conditions a successful run reports alongside its report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    RuleConflict(CorrelationRuleConflict),
    /// The analyzer activated a category the registry has no signatures for.
    NoSignatures { category: Category },
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::RuleConflict(conflict) => fmt::Display::fmt(conflict, f),
            RunWarning::NoSignatures { category } => {
                write!(f, "no signatures loaded for category {category}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run failed during {stage}: {source}")]
    FactAccess {
        stage: Stage,
        #[source]
        source: FactAccessError,
    },
    #[error("Run cancelled at the start of {stage}")]
    Cancelled { stage: Stage },
}

impl RunError {
    pub fn stage(&self) -> Stage {
        match self {
            RunError::FactAccess { stage, .. } | RunError::Cancelled { stage } => *stage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub report: ReportConfig,
    /// Match categories on the rayon pool.
    pub parallel: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { report: ReportConfig::default(), parallel: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub report: Report,
    pub warnings: Vec<RunWarning>,
}

struct StageTracker<'a> {
    current: Stage,
    cancel: &'a CancellationToken,
}

impl<'a> StageTracker<'a> {
    fn new(cancel: &'a CancellationToken) -> Self {
        Self { current: Stage::Idle, cancel }
    }

    fn enter(&mut self, next: Stage) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            debug!(from = %self.current, to = %next, "run cancelled at stage boundary");
            self.current = Stage::Idle;
            return Err(RunError::Cancelled { stage: next });
        }
        debug!(from = %self.current, to = %next, "stage transition");
        self.current = next;
        Ok(())
    }

    fn finish(&mut self) {
        debug!(from = %self.current, to = %Stage::Idle, "stage transition");
        self.current = Stage::Idle;
    }
}

/// Runs analyzers against a shared, immutable registry.
#[derive(Debug, Clone)]
pub struct Pipeline<'r> {
    registry: &'r Registry,
    options: RunOptions,
    cancel: CancellationToken,
}

impl<'r> Pipeline<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry, options: RunOptions::default(), cancel: CancellationToken::new() }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Handle that aborts this pipeline's runs at the next stage boundary.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fetch facts from `provider`, then analyze them.
    pub fn run(
        &self,
        provider: &dyn FactProvider,
        request: &FactRequest,
        analyzer: Analyzer,
    ) -> Result<RunOutcome, RunError> {
        let mut tracker = StageTracker::new(&self.cancel);
        tracker.enter(Stage::Scanning)?;
        debug!(provider = provider.name(), path = %request.path.display(), "collecting facts");
        let facts = provider
            .facts(request)
            .map_err(|source| RunError::FactAccess { stage: Stage::Scanning, source })?;
        self.execute(&mut tracker, &facts, analyzer)
    }

    /// Analyze an already-captured fact model.
    pub fn analyze(&self, facts: &FactModel, analyzer: Analyzer) -> Result<RunOutcome, RunError> {
        let mut tracker = StageTracker::new(&self.cancel);
        tracker.enter(Stage::Scanning)?;
        self.execute(&mut tracker, facts, analyzer)
    }

    fn execute(
        &self,
        tracker: &mut StageTracker<'_>,
        facts: &FactModel,
        analyzer: Analyzer,
    ) -> Result<RunOutcome, RunError> {
        let categories = analyzer.categories();
        let mut warnings = Vec::new();

        let active: Vec<Category> = categories
            .iter()
            .copied()
            .filter(|category| {
                let loaded = self.registry.index_for(*category).is_some_and(|i| !i.is_empty());
                if !loaded {
                    warnings.push(RunWarning::NoSignatures { category: *category });
                }
                loaded
            })
            .collect();

        let scan = |category: &Category| -> Vec<RawMatch> {
            self.registry.index_for(*category).map(|index| index.scan(facts)).unwrap_or_default()
        };
        let per_category: Vec<Vec<RawMatch>> = if self.options.parallel {
            active.par_iter().map(scan).collect()
        } else {
            active.iter().map(scan).collect()
        };
        let raw: Vec<RawMatch> = per_category.into_iter().flatten().collect();

        tracker.enter(Stage::Correlating)?;
        let correlation = correlate(&raw, self.registry, facts);
        warnings.extend(correlation.conflicts.into_iter().map(RunWarning::RuleConflict));

        tracker.enter(Stage::Scoring)?;
        let scored = score_all(
            correlation.findings,
            self.options.report.min_confidence,
            self.options.parallel,
        );

        tracker.enter(Stage::Reporting)?;
        let mut report = ReportBuilder::new(&self.options.report)
            .categories(&categories)
            .title(analyzer.title())
            .build(scored.into_values().flatten().collect(), facts.binary_id());
        report.facts = facts.counts();
        tracker.finish();

        info!(
            analyzer = analyzer.as_str(),
            binary = facts.binary_id(),
            raw_matches = raw.len(),
            findings = report.total_findings(),
            risk = report.overall_risk_score,
            warnings = warnings.len(),
            "analysis run complete"
        );

        Ok(RunOutcome { report, warnings })
    }
}
