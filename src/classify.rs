//! Classification of environment-specific startup failures.
//!
//! When `initdb` fails, the diagnostic text often reveals that the
//! *environment* is at fault rather than the harness: sandboxes that
//! forbid SysV/POSIX shared memory, or hosts with an exhausted tmpfs.
//! Recognizing these lets a test suite skip instead of fail.
//!
//! Matching is substring-based against lower-cased stdout/stderr and is
//! inherently fragile (server version and locale dependent). Treat it as
//! a best-effort heuristic: anything unrecognized must propagate as the
//! original failure so genuine bugs are never masked as environment
//! issues.

use std::fmt;

/// Marker emitted by the server when shared-memory setup fails.
const SHM_MARKER: &str = "could not create shared memory segment";

/// Environment failure categories recognized during cluster startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvFailureKind {
    /// The sandbox disallows the IPC primitives the server needs.
    PermissionDenied,
    /// Shared memory (or the device backing it) is exhausted.
    ResourceExhausted,
}

impl fmt::Display for EnvFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
        }
    }
}

impl EnvFailureKind {
    /// Human-readable explanation suitable for a skip message.
    #[must_use]
    pub fn explanation(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "shared memory allocation is not permitted in this environment"
            },
            Self::ResourceExhausted => "shared memory is exhausted on this system",
        }
    }
}

/// Inspect captured diagnostics from a failed startup command.
///
/// Returns the recognized category, or `None` when the text matches
/// neither, in which case the caller re-raises the original failure
/// unchanged. The two categories are mutually exclusive (different
/// secondary markers), so check order does not matter.
#[must_use]
pub fn classify(stdout: &str, stderr: &str) -> Option<EnvFailureKind> {
    let text = merged_diagnostics(stdout, stderr);
    if !text.contains(SHM_MARKER) {
        return None;
    }
    if text.contains("operation not permitted") || text.contains("permission denied") {
        return Some(EnvFailureKind::PermissionDenied);
    }
    if text.contains("no space left on device") {
        return Some(EnvFailureKind::ResourceExhausted);
    }
    None
}

/// Merge stdout and stderr into one lower-cased haystack.
fn merged_diagnostics(stdout: &str, stderr: &str) -> String {
    let mut text = String::with_capacity(stdout.len() + stderr.len() + 1);
    text.push_str(stdout);
    text.push('\n');
    text.push_str(stderr);
    text.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_permission_denied() {
        let stderr = "FATAL: could not create shared memory segment: Operation not permitted";
        assert_eq!(
            classify("", stderr),
            Some(EnvFailureKind::PermissionDenied)
        );
    }

    #[test]
    fn test_classify_permission_denied_alternate_marker() {
        let stderr = "could not create shared memory segment: Permission denied";
        assert_eq!(
            classify("", stderr),
            Some(EnvFailureKind::PermissionDenied)
        );
    }

    #[test]
    fn test_classify_resource_exhausted() {
        let stderr = "FATAL: could not create shared memory segment: No space left on device";
        assert_eq!(
            classify("", stderr),
            Some(EnvFailureKind::ResourceExhausted)
        );
    }

    #[test]
    fn test_classify_looks_at_stdout_too() {
        let stdout = "could not create shared memory segment\noperation not permitted";
        assert_eq!(classify(stdout, ""), Some(EnvFailureKind::PermissionDenied));
    }

    #[test]
    fn test_shm_marker_without_secondary_is_unclassified() {
        let stderr = "could not create shared memory segment: Invalid argument";
        assert_eq!(classify("", stderr), None);
    }

    #[test]
    fn test_unrelated_failure_is_unclassified() {
        assert_eq!(classify("", "syntax error in postgresql.conf"), None);
        assert_eq!(classify("", "permission denied"), None);
    }
}
