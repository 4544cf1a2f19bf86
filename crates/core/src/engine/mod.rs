//! Detection engine: matching, correlation, scoring, and report assembly.

pub mod correlate;
pub mod finding;
pub mod matcher;
pub mod pipeline;
pub mod report;
pub mod scoring;

pub use correlate::{correlate, Correlation, CorrelationRuleConflict};
pub use finding::Finding;
pub use matcher::{match_signatures, RawMatch, SignatureIndex};
pub use pipeline::{CancellationToken, Pipeline, RunError, RunOptions, RunOutcome, RunWarning, Stage};
pub use report::{
    CategoryReport, ProcedureSummary, Report, ReportBuilder, ReportRenderError, ReportSink,
    RiskLevel,
};
pub use scoring::{combine_weights, deduplicate, rank, score_all};
