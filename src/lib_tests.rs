// Tests for the crate-wide error type and its conversions

use super::*;
use std::io::ErrorKind;

// ==================== DISPLAY TESTS ====================

#[test]
fn test_circuit_open_display() {
    let err = OpguardError::CircuitOpen {
        service: "market-data".to_string(),
    };
    assert_eq!(err.to_string(), "Circuit breaker for 'market-data' is open");
}

#[test]
fn test_cancelled_display_includes_reason() {
    let err = OpguardError::Cancelled {
        operation_id: "op-1".to_string(),
        reason: CancelReason::Timeout,
        message: "timed out after 5s".to_string(),
    };
    let text = err.to_string();
    assert!(text.contains("op-1"));
    assert!(text.contains("timeout"));
    assert!(text.contains("timed out after 5s"));
}

#[test]
fn test_timeout_display() {
    let err = OpguardError::Timeout {
        operation: "fetch_filings".to_string(),
        after: Duration::from_secs(30),
    };
    assert!(err.to_string().contains("fetch_filings"));
    assert!(err.to_string().contains("30s"));
}

#[test]
fn test_action_error_is_transparent() {
    let err = OpguardError::from(anyhow::anyhow!("upstream returned 502"));
    assert_eq!(err.to_string(), "upstream returned 502");
}

#[test]
fn test_missing_accessor_display() {
    let err = OpguardError::MissingStateAccessor(RollbackScope::DocumentState);
    assert!(err.to_string().contains("document_state"));
}

// ==================== CONVERSION TESTS ====================

#[test]
fn test_typed_error_survives_anyhow_roundtrip() {
    let original = OpguardError::CircuitOpen {
        service: "search".to_string(),
    };
    let wrapped: anyhow::Error = original.into();
    let back = OpguardError::from(wrapped);
    assert!(back.is_circuit_open());
}

#[test]
fn test_context_wrapped_error_stays_action() {
    let wrapped = anyhow::Error::new(std::io::Error::new(ErrorKind::Other, "boom"))
        .context("saving draft");
    let err = OpguardError::from(wrapped);
    assert!(matches!(err, OpguardError::Action(_)));
    assert_eq!(err.to_string(), "saving draft");
}

#[test]
fn test_io_error_conversion() {
    let err: OpguardError = std::io::Error::new(ErrorKind::NotFound, "missing").into();
    assert!(matches!(err, OpguardError::Io(_)));
    assert!(err.to_string().contains("I/O error"));
}

#[test]
fn test_serde_error_conversion() {
    let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: OpguardError = parse.into();
    assert!(matches!(err, OpguardError::Serialization(_)));
}

#[test]
fn test_config_error_conversion() {
    let err: OpguardError = ::config::ConfigError::Message("bad value".to_string()).into();
    assert!(matches!(err, OpguardError::Config(ref m) if m.contains("bad value")));
}

// ==================== PREDICATE TESTS ====================

#[test]
fn test_is_cancelled() {
    let cancelled = OpguardError::Cancelled {
        operation_id: "op".to_string(),
        reason: CancelReason::UserRequested,
        message: String::new(),
    };
    assert!(cancelled.is_cancelled());
    assert_eq!(cancelled.cancel_reason(), Some(CancelReason::UserRequested));

    let other = OpguardError::OperationNotFound("op".to_string());
    assert!(!other.is_cancelled());
    assert_eq!(other.cancel_reason(), None);
}

#[test]
fn test_is_circuit_open() {
    assert!(OpguardError::CircuitOpen {
        service: "s".to_string()
    }
    .is_circuit_open());
    assert!(!OpguardError::Config("x".to_string()).is_circuit_open());
}

#[test]
fn test_error_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync + 'static>() {}
    assert_send_sync::<OpguardError>();
}
