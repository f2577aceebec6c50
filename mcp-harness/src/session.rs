//! Per-target session tracking for one validation pass

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::Negotiated;

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No handshake sent yet
    Uninitialized,
    /// `initialize` sent, response pending
    Negotiating,
    /// Handshake response received
    Established,
    /// Pass finished
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Negotiating => "negotiating",
            SessionState::Established => "established",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Session identity attached to every call after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionToken {
    /// Token handed out by the target
    Issued(String),
    /// Locally generated placeholder; the target did not issue one
    Synthesized(String),
}

impl SessionToken {
    /// Create a locally-unique placeholder
    pub fn synthesize() -> Self {
        SessionToken::Synthesized(format!("local-{}", Uuid::new_v4()))
    }

    /// Header value to send
    pub fn value(&self) -> &str {
        match self {
            SessionToken::Issued(token) | SessionToken::Synthesized(token) => token,
        }
    }

    /// `issued` or `synthesized`
    pub fn kind(&self) -> &'static str {
        match self {
            SessionToken::Issued(_) => "issued",
            SessionToken::Synthesized(_) => "synthesized",
        }
    }

    /// True when the target issued the token
    pub fn is_issued(&self) -> bool {
        matches!(self, SessionToken::Issued(_))
    }
}

/// State an invalid transition was attempted from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// State the session was in
    pub from: SessionState,
    /// State that was requested
    pub to: SessionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// One target's session, owned by its validation pass
#[derive(Debug)]
pub struct Session {
    target: String,
    state: SessionState,
    token: Option<SessionToken>,
    negotiated: Option<Negotiated>,
}

impl Session {
    /// Fresh session for a target
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            state: SessionState::Uninitialized,
            token: None,
            negotiated: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `uninitialized -> negotiating`
    pub fn begin_handshake(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Uninitialized, SessionState::Negotiating)
    }

    /// `negotiating -> established`, on receipt of any handshake response.
    ///
    /// A missing token is replaced by a synthesized placeholder so later
    /// calls still carry a session header.
    pub fn establish(
        &mut self,
        issued: Option<String>,
        negotiated: Option<Negotiated>,
    ) -> Result<&SessionToken, InvalidTransition> {
        self.transition(SessionState::Negotiating, SessionState::Established)?;

        let token = match issued {
            Some(token) if !token.is_empty() => SessionToken::Issued(token),
            _ => {
                let token = SessionToken::synthesize();
                warn!(
                    "Target {} issued no session token; using placeholder {}",
                    self.target,
                    token.value()
                );
                token
            }
        };

        self.negotiated = negotiated;
        Ok(self.token.insert(token))
    }

    /// Move to `closed`. Allowed from any state and idempotent.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Session token, once established
    pub fn token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    /// Protocol version to echo in the version header, once negotiated
    pub fn protocol_version(&self) -> Option<&str> {
        self.negotiated
            .as_ref()
            .map(|n| n.protocol_version.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Capabilities declared by the target
    pub fn capabilities(&self) -> BTreeSet<String> {
        self.negotiated
            .as_ref()
            .map(|n| n.capabilities.clone())
            .unwrap_or_default()
    }

    /// Everything the target declared during the handshake
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    fn transition(
        &mut self,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), InvalidTransition> {
        if self.state != from {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}
