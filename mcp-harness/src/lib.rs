//! Multi-target validation harness for remote MCP tool servers
//!
//! The harness drives a fixed call sequence (`initialize`, `tools/list`, one
//! smoke-test `tools/call`) against every configured target, over either the
//! streamable HTTP binding or the HTTP+SSE event-stream binding, and renders
//! the outcome as per-target inventories, a summary table and a narrative.
//!
//! A single target failing never aborts the run: each pass is classified as
//! `healthy`, `degraded`, `auth_failed`, `unreachable` or
//! `protocol_violation` and reported alongside the others.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pulseengine_mcp_harness::{HarnessConfig, TargetRegistry, ValidationRunner, ReportWriter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarnessConfig::from_file("harness.toml")?;
//!     let registry = TargetRegistry::from_config(&config)?;
//!
//!     let runner = ValidationRunner::new(config.run.clone())?;
//!     let report = runner.run(&registry).await;
//!
//!     let written = ReportWriter::new(&config.run.output_dir).write(&report)?;
//!     for artifact in written {
//!         println!("wrote {}", artifact.display());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod runner;
pub mod session;
pub mod transport;
pub mod writer;

pub use config::{HarnessConfig, RunSettings, SmokeTestConfig, TargetConfig};
pub use error::{CallError, HarnessError, HarnessResult};
pub use protocol::{ParsedResponse, ProtocolCodec, ToolDescriptor};
pub use registry::{Credential, Target, TargetRegistry, TransportKind};
pub use report::{
    CallOutcome, CallResult, EnumerationState, Report, SummaryRow, TargetStatus, ValidationResult,
};
pub use runner::{CancelHandle, ValidationRunner};
pub use session::{Session, SessionState, SessionToken};
pub use transport::{TransportAdapter, TransportError};
pub use writer::{Artifact, ReportWriter};

/// Protocol versions the harness will offer during `initialize`
pub const SUPPORTED_MCP_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Protocol version offered when the configuration does not name one
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// Default per-call timeout
pub const DEFAULT_CALL_TIMEOUT_SECONDS: u64 = 30;

/// Default deadline for one target's whole call sequence
pub const DEFAULT_TARGET_DEADLINE_SECONDS: u64 = 120;

/// Default number of retries for transport-level failures
pub const DEFAULT_RETRIES: u32 = 2;

/// Default linear backoff step between transport retries
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;

/// Default number of concurrent target passes
pub const DEFAULT_WORKERS: usize = 4;

/// Header carrying the session token on every call after the handshake
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Header carrying the negotiated protocol version after the handshake
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

/// Check if an MCP protocol version is known to the harness
pub fn is_version_supported(version: &str) -> bool {
    SUPPORTED_MCP_VERSIONS.contains(&version)
}

/// Validate a target base address
pub fn validate_target_url(url: &str) -> HarnessResult<url::Url> {
    let parsed_url = url::Url::parse(url).map_err(|e| HarnessError::InvalidTargetUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    // Both bindings run over HTTP
    match parsed_url.scheme() {
        "http" | "https" => Ok(parsed_url),
        _ => Err(HarnessError::InvalidTargetUrl {
            url: url.to_string(),
            reason: format!(
                "Unsupported scheme: {}. Only http and https are allowed.",
                parsed_url.scheme()
            ),
        }),
    }
}
