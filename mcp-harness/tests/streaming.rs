//! Validation passes over the event-stream binding against a mock target

mod support;

use pulseengine_mcp_harness::{
    CallError, CancelHandle, Credential, EnumerationState, Target, TargetStatus, TransportKind,
    ValidationRunner,
};
use support::{fast_settings, MockBehavior, MockTarget};
use tempfile::TempDir;

fn target(name: &str, mock: &MockTarget) -> Target {
    Target::new(name, &mock.url, TransportKind::Streaming).unwrap()
}

#[tokio::test]
async fn test_streaming_target_is_healthy() {
    let dir = TempDir::new().unwrap();
    let runner = ValidationRunner::new(fast_settings(dir.path())).unwrap();
    let mock = MockTarget::start(MockBehavior::default().with_tools(&["b", "a"])).await;

    let result = runner
        .run_target(&target("events", &mock), &CancelHandle::new())
        .await;

    assert_eq!(result.status, TargetStatus::Healthy);
    assert_eq!(result.session_token.as_deref(), Some("issued"));
    let names: Vec<_> = result.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);

    assert_eq!(
        mock.methods(),
        vec![
            "GET /sse",
            "initialize",
            "notifications/initialized",
            "tools/list",
            "tools/call"
        ]
    );
    for call in &mock.calls()[2..] {
        assert_eq!(call.session.as_deref(), Some(mock.session_id()));
    }
}

#[tokio::test]
async fn test_stream_without_session_in_endpoint() {
    let dir = TempDir::new().unwrap();
    let runner = ValidationRunner::new(fast_settings(dir.path())).unwrap();
    let mock = MockTarget::start(MockBehavior::default().without_session()).await;

    let result = runner
        .run_target(&target("anonymous-stream", &mock), &CancelHandle::new())
        .await;

    assert_eq!(result.status, TargetStatus::Healthy);
    assert_eq!(result.session_token.as_deref(), Some("synthesized"));
}

#[tokio::test]
async fn test_unanswered_enumeration_is_degraded() {
    let dir = TempDir::new().unwrap();
    let runner = ValidationRunner::new(fast_settings(dir.path())).unwrap();
    let mock = MockTarget::start(MockBehavior::default().hanging_on("tools/list")).await;

    let result = runner
        .run_target(&target("quiet", &mock), &CancelHandle::new())
        .await;

    assert_eq!(result.status, TargetStatus::Degraded);
    assert_eq!(result.enumeration, EnumerationState::Failed);
    assert_eq!(result.tool_count, 0);
    assert!(result.has_inventory());
    assert!(matches!(
        result.outcomes.last().and_then(|o| o.error()),
        Some(CallError::Timeout { .. })
    ));
    assert!(!mock.methods().contains(&"tools/call".to_string()));
}

#[tokio::test]
async fn test_unanswered_handshake_is_unreachable() {
    let dir = TempDir::new().unwrap();
    let runner = ValidationRunner::new(fast_settings(dir.path())).unwrap();
    let mock = MockTarget::start(MockBehavior::default().hanging_on("initialize")).await;

    let result = runner
        .run_target(&target("mute", &mock), &CancelHandle::new())
        .await;

    assert_eq!(result.status, TargetStatus::Unreachable);
}

#[tokio::test]
async fn test_stream_opened_with_credential_after_unauthorized() {
    let dir = TempDir::new().unwrap();
    let runner = ValidationRunner::new(fast_settings(dir.path())).unwrap();
    let mock = MockTarget::start(MockBehavior::default().requiring_token("s3cret")).await;

    let result = runner
        .run_target(
            &target("guarded-stream", &mock).with_credential(Credential::bearer("s3cret")),
            &CancelHandle::new(),
        )
        .await;

    assert_eq!(result.status, TargetStatus::Healthy);

    let calls = mock.calls();
    assert_eq!(calls[0].method, "GET /sse");
    assert_eq!(calls[0].authorization, None);
    assert_eq!(calls[1].method, "GET /sse");
    assert_eq!(calls[1].authorization.as_deref(), Some("Bearer s3cret"));
    assert_eq!(calls[2].method, "initialize");
    assert_eq!(calls[2].authorization.as_deref(), Some("Bearer s3cret"));
}

#[tokio::test]
async fn test_stream_unauthorized_without_credential() {
    let dir = TempDir::new().unwrap();
    let runner = ValidationRunner::new(fast_settings(dir.path())).unwrap();
    let mock = MockTarget::start(MockBehavior::default().requiring_token("s3cret")).await;

    let result = runner
        .run_target(&target("locked-stream", &mock), &CancelHandle::new())
        .await;

    assert_eq!(result.status, TargetStatus::AuthFailed);
    assert_eq!(mock.methods(), vec!["GET /sse"]);
}
