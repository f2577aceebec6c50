//! Validation results and the run report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::CallError;
use crate::protocol::ToolDescriptor;
use crate::registry::{Target, TransportKind};

/// Classification of one target pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Every planned call completed with a well-formed envelope
    Healthy,
    /// Handshake worked but enumeration or a later call did not
    Degraded,
    /// Authorization rejected after the credential fallback
    AuthFailed,
    /// Handshake could not reach the target
    Unreachable,
    /// The target answered with a malformed envelope
    ProtocolViolation,
}

impl TargetStatus {
    /// Name used in artifacts
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Healthy => "healthy",
            TargetStatus::Degraded => "degraded",
            TargetStatus::AuthFailed => "auth_failed",
            TargetStatus::Unreachable => "unreachable",
            TargetStatus::ProtocolViolation => "protocol_violation",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far tool enumeration got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationState {
    /// The pass stopped before `tools/list`
    #[default]
    NotAttempted,
    /// Every page was received and decoded
    Complete,
    /// A page could not be obtained (transport, timeout, declared error)
    Failed,
    /// A page was received but did not decode
    Malformed,
}

impl EnumerationState {
    /// Enumeration reached the target, so an inventory is written
    pub fn was_attempted(&self) -> bool {
        !matches!(self, EnumerationState::NotAttempted)
    }
}

/// Result side of one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallResult {
    /// Well-formed success
    Success { payload: Value },
    /// Anything else
    Failed { error: CallError },
}

/// One protocol call made during a pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    /// Method name
    pub method: String,
    /// Request id; `None` for notifications
    pub request_id: Option<u64>,
    /// Wall time spent on the call, retries included
    pub elapsed_ms: u64,
    /// What came back
    pub result: CallResult,
}

impl CallOutcome {
    /// The call failed
    pub fn error(&self) -> Option<&CallError> {
        match self.result {
            CallResult::Failed { ref error } => Some(error),
            CallResult::Success { .. } => None,
        }
    }
}

/// Outcome of one target pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Target name
    pub target: String,

    /// Binding used
    pub transport: TransportKind,

    /// Classification
    pub status: TargetStatus,

    /// Number of tools enumerated
    pub tool_count: usize,

    /// Tools in the order the target returned them
    pub tools: Vec<ToolDescriptor>,

    /// Every call made, in order
    pub outcomes: Vec<CallOutcome>,

    /// How far enumeration got
    pub enumeration: EnumerationState,

    /// Protocol version the target negotiated
    pub protocol_version: Option<String>,

    /// Capabilities the target declared
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Self-reported server name and version
    pub server_info: Option<String>,

    /// `issued` or `synthesized`
    pub session_token: Option<String>,

    /// Skip reasons, deadline expiry, cancellation
    #[serde(default)]
    pub notes: Vec<String>,

    /// When the pass started
    pub started_at: DateTime<Utc>,

    /// When the pass ended
    pub ended_at: DateTime<Utc>,
}

impl ValidationResult {
    /// Result for a target whose pass never started
    pub fn not_started(target: &Target, note: &str, at: DateTime<Utc>) -> Self {
        Self {
            target: target.name.clone(),
            transport: target.transport,
            status: TargetStatus::Unreachable,
            tool_count: 0,
            tools: Vec::new(),
            outcomes: Vec::new(),
            enumeration: EnumerationState::NotAttempted,
            protocol_version: None,
            capabilities: BTreeSet::new(),
            server_info: None,
            session_token: None,
            notes: vec![note.to_string()],
            started_at: at,
            ended_at: at,
        }
    }

    /// Pass duration in milliseconds
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }

    /// True when an inventory artifact is written for this target
    pub fn has_inventory(&self) -> bool {
        self.enumeration.was_attempted()
    }
}

/// One row of the summary table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    /// Target name
    pub name: String,
    /// Binding used
    pub transport: TransportKind,
    /// Classification
    pub status: TargetStatus,
    /// Number of tools enumerated
    pub tool_count: usize,
    /// Pass duration in milliseconds
    pub duration_ms: u64,
}

impl From<&ValidationResult> for SummaryRow {
    fn from(result: &ValidationResult) -> Self {
        Self {
            name: result.target.clone(),
            transport: result.transport,
            status: result.status,
            tool_count: result.tool_count,
            duration_ms: result.duration_ms(),
        }
    }
}

/// All results of one run, in registry order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Generation timestamp
    pub generated_at: DateTime<Utc>,

    /// One result per target
    pub results: Vec<ValidationResult>,

    /// One row per target, derived from `results`
    pub summary: Vec<SummaryRow>,
}

impl Report {
    /// Build a report and derive its summary rows
    pub fn new(results: Vec<ValidationResult>, generated_at: DateTime<Utc>) -> Self {
        let summary = results.iter().map(SummaryRow::from).collect();
        Self {
            generated_at,
            results,
            summary,
        }
    }

    /// Every target is healthy
    pub fn all_healthy(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status == TargetStatus::Healthy)
    }

    /// Number of targets per status
    pub fn status_counts(&self) -> BTreeMap<TargetStatus, usize> {
        let mut counts = BTreeMap::new();
        for result in &self.results {
            *counts.entry(result.status).or_insert(0) += 1;
        }
        counts
    }

    /// Generate a summary string
    pub fn summary_line(&self) -> String {
        let counts = self
            .status_counts()
            .iter()
            .map(|(status, count)| format!("{} {}", count, status))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "MCP Harness Report: {} targets ({})",
            self.results.len(),
            if counts.is_empty() { "none" } else { counts.as_str() }
        )
    }
}
