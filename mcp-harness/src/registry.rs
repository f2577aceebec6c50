//! Target registry: the read-only list of endpoints validated in one run

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::config::{HarnessConfig, SmokeTestConfig, TargetConfig};
use crate::{HarnessError, HarnessResult};

/// Transport binding used to reach a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// One HTTP POST per call; the body is JSON or a sequence of SSE frames
    #[default]
    #[serde(alias = "http", alias = "streamable-http")]
    RequestReply,

    /// Long-lived event stream for responses, separate POST per request
    #[serde(alias = "sse")]
    Streaming,
}

impl TransportKind {
    /// Stable name used in artifacts
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::RequestReply => "request-reply",
            TransportKind::Streaming => "streaming",
        }
    }

    /// Endpoint path used when the base address carries none
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            TransportKind::RequestReply => "/mcp",
            TransportKind::Streaming => "/sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bearer token for a target. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a bearer token
    pub fn bearer<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    /// Value for the `Authorization` header
    pub fn authorization_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// One endpoint under validation. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Target {
    /// Unique name; the target's identity within a run
    pub name: String,

    /// Base address as configured
    pub base_url: Url,

    /// Transport binding
    pub transport: TransportKind,

    /// Resolved bearer credential
    pub credential: Option<Credential>,

    /// Explicit endpoint path, joined onto the base address
    pub endpoint: Option<String>,

    /// Explicit smoke-test call
    pub smoke_test: Option<SmokeTestConfig>,
}

impl Target {
    /// Create a target without credential or overrides
    pub fn new(name: &str, url: &str, transport: TransportKind) -> HarnessResult<Self> {
        Ok(Self {
            name: name.to_string(),
            base_url: crate::validate_target_url(url)?,
            transport,
            credential: None,
            endpoint: None,
            smoke_test: None,
        })
    }

    /// Attach a bearer credential
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Override the endpoint path; it must start with '/'
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> HarnessResult<Self> {
        let endpoint = endpoint.into();
        if !endpoint.starts_with('/') {
            return Err(HarnessError::configuration(format!(
                "Endpoint for target '{}' must start with '/'",
                self.name
            )));
        }
        self.endpoint = Some(endpoint);
        Ok(self)
    }

    /// Set an explicit smoke-test call
    pub fn with_smoke_test(mut self, tool: &str, arguments: serde_json::Value) -> Self {
        self.smoke_test = Some(SmokeTestConfig {
            tool: tool.to_string(),
            arguments,
        });
        self
    }

    /// Build a target from its configuration entry, reading the credential
    /// from the environment
    pub fn from_config(config: &TargetConfig) -> HarnessResult<Self> {
        config.validate()?;

        let credential = config
            .credential_env
            .as_deref()
            .and_then(|var| resolve_credential(&config.name, var));

        Ok(Self {
            name: config.name.clone(),
            base_url: crate::validate_target_url(&config.url)?,
            transport: config.transport,
            credential,
            endpoint: config.endpoint.clone(),
            smoke_test: config.smoke_test.clone(),
        })
    }

    /// Full URL of the tool endpoint (request-reply) or event stream (streaming).
    ///
    /// An explicit endpoint is appended to the base path. Without one, a base
    /// address that already has a path is used as is; a bare host gets the
    /// binding's default path.
    pub fn endpoint_url(&self) -> Url {
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();

        match self.endpoint {
            Some(ref endpoint) => url.set_path(&format!("{}{}", base_path, endpoint)),
            None if base_path.is_empty() => url.set_path(self.transport.default_endpoint()),
            None => {}
        }

        url
    }
}

fn resolve_credential(target: &str, variable: &str) -> Option<Credential> {
    match std::env::var(variable) {
        Ok(token) if !token.trim().is_empty() => {
            debug!("Resolved credential for target {} from {}", target, variable);
            Some(Credential::bearer(token.trim()))
        }
        _ => {
            warn!(
                "Credential variable {} for target {} is unset; calls will be anonymous",
                variable, target
            );
            None
        }
    }
}

/// Ordered, read-only list of targets for one run
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: Vec<Arc<Target>>,
}

impl TargetRegistry {
    /// Build the registry from configuration
    pub fn from_config(config: &HarnessConfig) -> HarnessResult<Self> {
        config.validate()?;

        let targets = config
            .targets
            .iter()
            .map(Target::from_config)
            .collect::<HarnessResult<Vec<_>>>()?;

        Self::from_targets(targets)
    }

    /// Build the registry from already constructed targets
    pub fn from_targets(targets: Vec<Target>) -> HarnessResult<Self> {
        let mut seen = HashSet::new();
        for target in &targets {
            if !seen.insert(target.name.clone()) {
                return Err(HarnessError::DuplicateTarget {
                    name: target.name.clone(),
                });
            }
        }

        Ok(Self {
            targets: targets.into_iter().map(Arc::new).collect(),
        })
    }

    /// Targets in registry order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.iter()
    }

    /// Look a target up by name
    pub fn get(&self, name: &str) -> Option<&Arc<Target>> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Number of targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when no targets are configured
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_resolution() {
        let bare = Target::new("a", "http://localhost:3001", TransportKind::RequestReply).unwrap();
        assert_eq!(bare.endpoint_url().as_str(), "http://localhost:3001/mcp");

        let sse = Target::new("b", "http://localhost:3001/", TransportKind::Streaming).unwrap();
        assert_eq!(sse.endpoint_url().as_str(), "http://localhost:3001/sse");

        let full = Target::new("c", "http://localhost:3001/api/mcp", TransportKind::RequestReply)
            .unwrap();
        assert_eq!(full.endpoint_url().as_str(), "http://localhost:3001/api/mcp");

        let explicit = Target::new("d", "http://localhost:3001/api/", TransportKind::Streaming)
            .unwrap()
            .with_endpoint("/events")
            .unwrap();
        assert_eq!(explicit.endpoint_url().as_str(), "http://localhost:3001/api/events");
    }

    #[test]
    fn test_endpoint_without_leading_slash_is_rejected() {
        let target = Target::new("e", "http://localhost:3001/api", TransportKind::RequestReply)
            .unwrap();
        let err = target.with_endpoint("events").unwrap_err();
        assert!(matches!(err, HarnessError::ConfigurationError { .. }));
        assert_eq!(
            err.to_string(),
            "Configuration error: Endpoint for target 'e' must start with '/'"
        );
    }

    #[test]
    fn test_credential_is_redacted() {
        let credential = Credential::bearer("super-secret");
        assert_eq!(format!("{:?}", credential), "Credential(<redacted>)");
        assert_eq!(credential.authorization_value(), "Bearer super-secret");
    }

    #[test]
    fn test_registry_keeps_order_and_rejects_duplicates() {
        let registry = TargetRegistry::from_targets(vec![
            Target::new("zeta", "http://localhost:1", TransportKind::RequestReply).unwrap(),
            Target::new("alpha", "http://localhost:2", TransportKind::Streaming).unwrap(),
        ])
        .unwrap();

        let names: Vec<_> = registry.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert!(registry.get("alpha").is_some());

        let duplicate = TargetRegistry::from_targets(vec![
            Target::new("same", "http://localhost:1", TransportKind::RequestReply).unwrap(),
            Target::new("same", "http://localhost:2", TransportKind::RequestReply).unwrap(),
        ]);
        assert!(matches!(
            duplicate,
            Err(HarnessError::DuplicateTarget { .. })
        ));
    }

    #[test]
    fn test_credential_resolved_from_environment() {
        let variable = "MCP_HARNESS_TEST_REGISTRY_TOKEN";
        // SAFETY: test-local variable name, not read concurrently elsewhere
        unsafe { std::env::set_var(variable, "token-123") };

        let config = TargetConfig {
            name: "github".to_string(),
            url: "http://localhost:3001".to_string(),
            transport: TransportKind::RequestReply,
            credential_env: Some(variable.to_string()),
            endpoint: None,
            smoke_test: None,
        };
        let target = Target::from_config(&config).unwrap();
        assert_eq!(target.credential, Some(Credential::bearer("token-123")));

        let missing = TargetConfig {
            credential_env: Some("MCP_HARNESS_TEST_UNSET_TOKEN".to_string()),
            ..config
        };
        assert!(Target::from_config(&missing).unwrap().credential.is_none());
    }

    #[test]
    fn test_transport_kind_aliases() {
        let kind: TransportKind = serde_json::from_str("\"sse\"").unwrap();
        assert_eq!(kind, TransportKind::Streaming);
        let kind: TransportKind = serde_json::from_str("\"streamable-http\"").unwrap();
        assert_eq!(kind, TransportKind::RequestReply);
        assert_eq!(TransportKind::Streaming.to_string(), "streaming");
    }
}
