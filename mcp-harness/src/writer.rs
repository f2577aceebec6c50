//! Artifact rendering and output
//!
//! [`ReportWriter::render`] is a pure function of the report: rendering the
//! same report twice yields identical artifacts, and two reports that differ
//! only in their generation timestamp differ only where the timestamp is
//! printed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::protocol::ToolDescriptor;
use crate::report::{CallResult, EnumerationState, Report, ValidationResult};
use crate::HarnessResult;

/// One rendered output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// File name inside the output directory
    pub file_name: String,
    /// File contents
    pub contents: String,
}

#[derive(Serialize)]
struct Inventory<'a> {
    target: &'a str,
    transport: &'a str,
    generated_at: String,
    enumeration: EnumerationState,
    tool_count: usize,
    tools: &'a [ToolDescriptor],
}

/// Timestamp used in artifact names
pub fn stamp(at: &DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "target".to_string()
    } else {
        cleaned
    }
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|")
}

/// Writes a run's artifacts into one directory
#[derive(Debug, Clone)]
pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    /// Writer targeting `output_dir`
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    /// Output directory
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Render every artifact of a report
    pub fn render(report: &Report) -> HarnessResult<Vec<Artifact>> {
        let stamp = stamp(&report.generated_at);
        let inventories = inventory_names(&report.results, &stamp);

        let mut artifacts = Vec::new();
        for (result, file_name) in report.results.iter().zip(&inventories) {
            if let Some(file_name) = file_name {
                artifacts.push(Artifact {
                    file_name: file_name.clone(),
                    contents: render_inventory(result, &report.generated_at)?,
                });
            }
        }

        let summary_name = format!("summary-{}.md", stamp);
        let report_name = format!("report-{}.json", stamp);
        let narrative_name = format!("narrative-{}.md", stamp);

        artifacts.push(Artifact {
            file_name: summary_name.clone(),
            contents: SummaryTable(report).to_string(),
        });
        artifacts.push(Artifact {
            file_name: report_name.clone(),
            contents: serde_json::to_string_pretty(report)? + "\n",
        });

        let mut files: Vec<&str> = vec![summary_name.as_str(), report_name.as_str()];
        files.extend(inventories.iter().flatten().map(String::as_str));
        files.push(&narrative_name);

        let narrative = Narrative {
            report,
            inventories: &inventories,
            files: &files,
        }
        .to_string();
        artifacts.push(Artifact {
            file_name: narrative_name,
            contents: narrative,
        });

        Ok(artifacts)
    }

    /// Render and write every artifact, creating the directory if missing
    pub fn write(&self, report: &Report) -> HarnessResult<Vec<PathBuf>> {
        let artifacts = Self::render(report)?;
        std::fs::create_dir_all(&self.output_dir)?;

        let mut written = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let path = self.output_dir.join(&artifact.file_name);
            std::fs::write(&path, artifact.contents)?;
            info!("Wrote {}", path.display());
            written.push(path);
        }

        Ok(written)
    }
}

/// Inventory file name per result, `None` where enumeration never started.
/// Names that sanitize to the same value get a numeric suffix.
fn inventory_names(results: &[ValidationResult], stamp: &str) -> Vec<Option<String>> {
    let mut used = HashSet::new();

    results
        .iter()
        .map(|result| {
            if !result.has_inventory() {
                return None;
            }

            let base = sanitize(&result.target);
            let mut candidate = base.clone();
            let mut suffix = 2;
            while !used.insert(candidate.clone()) {
                candidate = format!("{}-{}", base, suffix);
                suffix += 1;
            }

            Some(format!("inventory-{}-{}.json", candidate, stamp))
        })
        .collect()
}

fn render_inventory(result: &ValidationResult, generated_at: &DateTime<Utc>) -> HarnessResult<String> {
    let inventory = Inventory {
        target: &result.target,
        transport: result.transport.as_str(),
        generated_at: generated_at.to_rfc3339(),
        enumeration: result.enumeration,
        tool_count: result.tools.len(),
        tools: &result.tools,
    };

    Ok(serde_json::to_string_pretty(&inventory)? + "\n")
}

/// Markdown table with one row per target
struct SummaryTable<'a>(&'a Report);

impl fmt::Display for SummaryTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        writeln!(f, "# MCP Harness Summary")?;
        writeln!(f)?;
        writeln!(f, "Generated: {}", report.generated_at.to_rfc3339())?;
        writeln!(f)?;
        writeln!(f, "| Name | Transport | Status | Tools | Duration (ms) |")?;
        writeln!(f, "|------|-----------|--------|-------|---------------|")?;

        for row in &report.summary {
            writeln!(
                f,
                "| {} | {} | {} | {} | {} |",
                escape_cell(&row.name),
                row.transport,
                row.status,
                row.tool_count,
                row.duration_ms
            )?;
        }

        Ok(())
    }
}

/// Per-target narrative linking every artifact of the run
struct Narrative<'a> {
    report: &'a Report,
    inventories: &'a [Option<String>],
    files: &'a [&'a str],
}

impl Narrative<'_> {
    fn target(f: &mut fmt::Formatter<'_>, result: &ValidationResult, inventory: Option<&str>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "### {} ({}): {}", result.target, result.transport, result.status)?;
        writeln!(f)?;

        if let Some(ref version) = result.protocol_version {
            writeln!(f, "- Protocol version: {}", version)?;
        }
        if let Some(ref server) = result.server_info {
            writeln!(f, "- Server: {}", server)?;
        }
        if !result.capabilities.is_empty() {
            let capabilities: Vec<&str> = result.capabilities.iter().map(String::as_str).collect();
            writeln!(f, "- Capabilities: {}", capabilities.join(", "))?;
        }
        if let Some(ref token) = result.session_token {
            writeln!(f, "- Session token: {}", token)?;
        }
        writeln!(f, "- Tools: {}", result.tool_count)?;

        if !result.outcomes.is_empty() {
            writeln!(f, "- Calls:")?;
            for outcome in &result.outcomes {
                let label = match outcome.request_id {
                    Some(id) => format!("{} #{}", outcome.method, id),
                    None => outcome.method.clone(),
                };
                let detail = match outcome.result {
                    CallResult::Success { .. } => "ok".to_string(),
                    CallResult::Failed { ref error } => format!("{}: {}", error.kind(), error),
                };
                writeln!(f, "  - {} ({} ms): {}", label, outcome.elapsed_ms, detail)?;
            }
        }

        if !result.notes.is_empty() {
            writeln!(f, "- Notes:")?;
            for note in &result.notes {
                writeln!(f, "  - {}", note)?;
            }
        }

        writeln!(f, "- Inventory: {}", inventory.unwrap_or("none"))
    }
}

impl fmt::Display for Narrative<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.report;
        writeln!(f, "# MCP Harness Run {}", stamp(&report.generated_at))?;
        writeln!(f)?;
        writeln!(
            f,
            "Generated at {}. {} targets tested.",
            report.generated_at.to_rfc3339(),
            report.results.len()
        )?;
        writeln!(f)?;
        writeln!(f, "## Targets")?;

        for (result, inventory) in report.results.iter().zip(self.inventories) {
            Self::target(f, result, inventory.as_deref())?;
        }

        writeln!(f)?;
        writeln!(f, "## Files")?;
        writeln!(f)?;
        for file in self.files {
            writeln!(f, "- {}", file)?;
        }

        Ok(())
    }
}
