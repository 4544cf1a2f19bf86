//! Report sinks: human-readable console text and JSON.

use std::io::Write;

use serde::Serialize;
use sigscope_core::engine::{ReportRenderError, ReportSink, RunWarning};
use sigscope_core::Report;
use tracing::warn;

/// Serialized form of one run, shared by `--json` output and `report.json`.
#[derive(Serialize)]
pub struct RunDocument<'a> {
    pub report: &'a Report,
    pub warnings: &'a [RunWarning],
}

/// Pretty-printed JSON of the report and its warnings.
pub struct JsonSink<W: Write> {
    out: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> ReportSink for JsonSink<W> {
    fn render(&mut self, report: &Report, warnings: &[RunWarning]) -> Result<(), ReportRenderError> {
        let body = serde_json::to_string_pretty(&RunDocument { report, warnings })
            .map_err(|e| ReportRenderError::Serialize(e.to_string()))?;
        writeln!(self.out, "{body}")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Text report in the style of the other listing commands.
pub struct ConsoleSink<W: Write> {
    out: W,
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> ReportSink for ConsoleSink<W> {
    fn render(&mut self, report: &Report, warnings: &[RunWarning]) -> Result<(), ReportRenderError> {
        let out = &mut self.out;
        writeln!(out, "{}", report.title)?;
        writeln!(out, "{}", "=".repeat(report.title.len()))?;
        writeln!(out, "Binary: {}", report.binary_id)?;
        writeln!(
            out,
            "Facts: {} (symbols {}, strings {}, constants {}, instructions {}, xrefs {})",
            report.facts.total(),
            report.facts.symbols,
            report.facts.strings,
            report.facts.constants,
            report.facts.instructions,
            report.facts.xrefs
        )?;
        writeln!(
            out,
            "Overall risk: {:.2} ({})",
            report.overall_risk_score,
            report.risk_level.as_str()
        )?;
        writeln!(out)?;

        for section in report.per_category.values() {
            writeln!(
                out,
                "[{}] {}: {} finding(s), score {:.4}",
                section.category, section.label, section.total_findings, section.score
            )?;
            for finding in &section.findings {
                let origin = finding.rule.as_deref().unwrap_or("signature");
                writeln!(
                    out,
                    "  - {:.4} {} @ {} 0x{:08x} ({origin})",
                    finding.confidence, finding.title, finding.location, finding.address
                )?;
                writeln!(out, "      signatures: {}", finding.contributing_signatures.join(", "))?;
                for line in &finding.evidence {
                    writeln!(out, "      {line}")?;
                }
            }
            let hidden = section.total_findings.saturating_sub(section.findings.len());
            if hidden > 0 {
                writeln!(out, "  ... {hidden} more")?;
            }
        }

        if !report.procedures.is_empty() {
            writeln!(out)?;
            writeln!(out, "Procedures ({}):", report.procedures.len())?;
            for proc in &report.procedures {
                let categories: Vec<&str> = proc.categories.iter().map(|c| c.as_str()).collect();
                writeln!(
                    out,
                    "  - {} [{}] findings={} max={:.4}",
                    proc.scope,
                    categories.join(", "),
                    proc.finding_count,
                    proc.max_confidence
                )?;
            }
        }

        if !warnings.is_empty() {
            writeln!(out)?;
            writeln!(out, "Warnings ({}):", warnings.len())?;
            for warning in warnings {
                writeln!(out, "  - {warning}")?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Render through `sink`; a failure is logged and reported as `false`, never propagated.
pub fn render_or_warn(sink: &mut dyn ReportSink, report: &Report, warnings: &[RunWarning]) -> bool {
    match sink.render(report, warnings) {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "report rendering failed; the analysis result is unaffected");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use sigscope_core::config::ReportConfig;
    use sigscope_core::engine::ReportBuilder;
    use sigscope_core::Category;

    use super::*;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn empty_report() -> Report {
        ReportBuilder::new(&ReportConfig::default())
            .categories(&[Category::Xpc])
            .title("XPC Service Analysis Report")
            .build(Vec::new(), "demo")
    }

    #[test]
    fn console_lists_every_active_category() {
        let mut buf = Vec::new();
        ConsoleSink::new(&mut buf).render(&empty_report(), &[]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("XPC Service Analysis Report"));
        assert!(text.contains("[xpc] XPC: 0 finding(s)"));
        assert!(text.contains("Overall risk: 0.00 (none)"));
    }

    #[test]
    fn json_output_parses_back() {
        let mut buf = Vec::new();
        JsonSink::new(&mut buf).render(&empty_report(), &[]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["report"]["binary_id"], "demo");
        assert!(value["warnings"].as_array().unwrap().is_empty());
    }

    #[test]
    fn render_failure_is_swallowed() {
        let report = empty_report();
        let mut sink = ConsoleSink::new(BrokenPipe);
        assert!(!render_or_warn(&mut sink, &report, &[]));
    }
}
