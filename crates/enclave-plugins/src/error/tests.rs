//! Unit tests for plugin error types.

use std::path::PathBuf;
use std::sync::Arc;

use rstest::rstest;

use super::*;

#[test]
fn not_found_error_message_includes_name() {
    let error = PluginError::NotFound {
        name: "greeter".into(),
    };
    let message = error.to_string();
    assert!(
        message.contains("greeter"),
        "expected name in message: {message}"
    );
    assert!(
        message.contains("not found"),
        "expected 'not found' in message: {message}"
    );
}

#[test]
fn quota_error_names_the_field() {
    let error = PluginError::Quota {
        name: "greeter".into(),
        field: "quotas.memKb".into(),
        message: "missing".into(),
    };
    let message = error.to_string();
    assert!(
        message.contains("quotas.memKb"),
        "expected field in message: {message}"
    );
}

#[rstest]
#[case::timeout(
    PluginError::Timeout {
        name: "slow".into(),
        cpu_ms: 500,
    },
    "500"
)]
#[case::memory_limit(
    PluginError::MemoryLimit {
        name: "greedy".into(),
        mem_kb: 2048,
    },
    "2048"
)]
fn error_message_includes_numeric_field(#[case] error: PluginError, #[case] expected_value: &str) {
    let message = error.to_string();
    assert!(
        message.contains(expected_value),
        "expected {expected_value} in message: {message}"
    );
}

#[rstest]
#[case::manifest_not_found(
    PluginError::ManifestNotFound { path: PathBuf::from("/p/plugin.json") },
    ErrorKind::ManifestNotFound,
    "manifest_not_found"
)]
#[case::invalid_manifest(
    PluginError::InvalidManifest { path: PathBuf::from("/p"), message: "bad".into() },
    ErrorKind::InvalidManifest,
    "invalid_manifest"
)]
#[case::quota(
    PluginError::Quota { name: "p".into(), field: "quotas".into(), message: "missing".into() },
    ErrorKind::Quota,
    "quota"
)]
#[case::timeout(
    PluginError::Timeout { name: "p".into(), cpu_ms: 1 },
    ErrorKind::Timeout,
    "timeout"
)]
#[case::capability(
    PluginError::CapabilityViolation { name: "p".into(), capability: "io.open".into() },
    ErrorKind::CapabilityViolation,
    "capability_violation"
)]
#[case::execution(
    PluginError::Execution { name: "p".into(), message: "boom".into() },
    ErrorKind::Execution,
    "execution"
)]
#[case::memory(
    PluginError::MemoryLimit { name: "p".into(), mem_kb: 1 },
    ErrorKind::MemoryLimit,
    "memory_limit"
)]
#[case::not_found(PluginError::NotFound { name: "p".into() }, ErrorKind::NotFound, "not_found")]
fn kind_labels_are_stable(
    #[case] error: PluginError,
    #[case] kind: ErrorKind,
    #[case] label: &str,
) {
    assert_eq!(error.kind(), kind);
    assert_eq!(kind.as_str(), label);
    assert_eq!(kind.to_string(), label);
}

#[test]
fn io_error_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    let error = PluginError::Io {
        path: PathBuf::from("/srv/plugins"),
        source: Arc::new(std::io::Error::other("denied")),
    };
    assert_send_sync::<PluginError>();
    assert_eq!(error.kind(), ErrorKind::Io);
    let message = error.to_string();
    assert!(
        message.contains("/srv/plugins"),
        "expected path in message: {message}"
    );
}
