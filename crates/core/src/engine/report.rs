//! Report Builder: assembles ranked findings into the structured report.
//!
//! The report is plain data. Rendering it (console text, JSON files, ...) is the job of a
//! [`ReportSink`], which lives outside the engine.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::finding::Finding;
use super::pipeline::RunWarning;
use super::scoring::rank;
use crate::config::ReportConfig;
use crate::model::{Category, FactCounts, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score <= 0.0 {
            RiskLevel::None
        } else if score < 25.0 {
            RiskLevel::Low
        } else if score < 50.0 {
            RiskLevel::Medium
        } else if score < 75.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Findings of one category, descending confidence, capped at `top_n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub category: Category,
    pub label: String,
    /// Count before the `top_n` cap.
    pub total_findings: usize,
    pub max_confidence: f64,
    /// Score fed into the overall risk; the category's strongest finding.
    pub score: f64,
    pub findings: Vec<Finding>,
}

/// Per-procedure rollup across every active category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureSummary {
    pub scope: Scope,
    pub categories: Vec<Category>,
    pub finding_count: usize,
    pub max_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub binary_id: String,
    pub title: String,
    pub per_category: BTreeMap<Category, CategoryReport>,
    pub procedures: Vec<ProcedureSummary>,
    pub overall_risk_score: f64,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub facts: FactCounts,
}

impl Report {
    /// Total findings across categories, before any `top_n` cap.
    pub fn total_findings(&self) -> usize {
        self.per_category.values().map(|c| c.total_findings).sum()
    }

    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.per_category.get(&category)
    }

    /// Every finding the report carries, in category order then rank order.
    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.per_category.values().flat_map(|c| c.findings.iter())
    }
}

/// Builds reports for a fixed set of active categories.
#[derive(Debug, Clone)]
pub struct ReportBuilder<'a> {
    config: &'a ReportConfig,
    categories: Vec<Category>,
    title: String,
}

impl<'a> ReportBuilder<'a> {
    pub fn new(config: &'a ReportConfig) -> Self {
        Self { config, categories: Category::ALL.to_vec(), title: "Signature Scan Report".into() }
    }

    pub fn categories(mut self, categories: &[Category]) -> Self {
        let unique: BTreeSet<Category> = categories.iter().copied().collect();
        self.categories = unique.into_iter().collect();
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Every active category is present in the result, with or without findings.
    /// Findings of inactive categories are ignored.
    pub fn build(&self, findings: Vec<Finding>, binary_id: &str) -> Report {
        let mut grouped: BTreeMap<Category, Vec<Finding>> =
            self.categories.iter().map(|c| (*c, Vec::new())).collect();
        for finding in findings {
            if let Some(slot) = grouped.get_mut(&finding.category) {
                slot.push(finding);
            }
        }

        let procedures = summarize_procedures(&grouped);

        let mut per_category = BTreeMap::new();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (category, mut list) in grouped {
            rank(&mut list);
            let total_findings = list.len();
            let max_confidence = list.first().map(|f| f.confidence).unwrap_or(0.0);
            if let Some(cap) = self.config.top_n {
                list.truncate(cap);
            }

            let weight = self.config.weight_for(category);
            weighted += weight * max_confidence;
            total_weight += weight;

            per_category.insert(
                category,
                CategoryReport {
                    category,
                    label: category.label().to_string(),
                    total_findings,
                    max_confidence,
                    score: max_confidence,
                    findings: list,
                },
            );
        }

        let overall_risk_score = if total_weight > 0.0 {
            round2(100.0 * weighted / total_weight)
        } else {
            0.0
        };

        Report {
            binary_id: binary_id.to_string(),
            title: self.title.clone(),
            per_category,
            procedures,
            overall_risk_score,
            risk_level: RiskLevel::from_score(overall_risk_score),
            facts: FactCounts::default(),
        }
    }
}

fn summarize_procedures(grouped: &BTreeMap<Category, Vec<Finding>>) -> Vec<ProcedureSummary> {
    let mut by_scope: BTreeMap<&Scope, ProcedureSummary> = BTreeMap::new();
    for finding in grouped.values().flatten() {
        if !finding.location.is_procedure() {
            continue;
        }
        let entry = by_scope.entry(&finding.location).or_insert_with(|| ProcedureSummary {
            scope: finding.location.clone(),
            categories: Vec::new(),
            finding_count: 0,
            max_confidence: 0.0,
        });
        entry.finding_count += 1;
        entry.max_confidence = entry.max_confidence.max(finding.confidence);
        if !entry.categories.contains(&finding.category) {
            entry.categories.push(finding.category);
        }
    }

    let mut out: Vec<ProcedureSummary> = by_scope.into_values().collect();
    for summary in &mut out {
        summary.categories.sort();
    }
    out.sort_by(|a, b| {
        b.max_confidence.total_cmp(&a.max_confidence).then_with(|| a.scope.cmp(&b.scope))
    });
    out
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Error)]
pub enum ReportRenderError {
    #[error("Report output failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Report serialization failed: {0}")]
    Serialize(String),
}

/// Output medium for a finished report. A failing sink never invalidates the report.
pub trait ReportSink {
    fn render(&mut self, report: &Report, warnings: &[RunWarning]) -> Result<(), ReportRenderError>;
}
