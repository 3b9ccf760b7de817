//! Error types for the cluster harness.
//!
//! This module provides structured errors for cluster provisioning and
//! teardown, so callers can tell "this environment cannot run the test"
//! apart from "the test itself failed".

use std::path::PathBuf;

use crate::classify::EnvFailureKind;
use crate::cluster::LifecycleState;

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Harness errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The local environment cannot support a test cluster.
    ///
    /// Raised only from initialization, when the failure classifier
    /// recognizes the diagnostic text. Callers should skip the dependent
    /// test run instead of reporting a failure.
    #[error("environment cannot run a test cluster ({kind}): {detail}")]
    EnvironmentUnsupported {
        kind: EnvFailureKind,
        detail: String,
    },

    /// An external command exited non-zero.
    #[error("command `{program}` failed with {}:\n{stderr}", exit_label(.status))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        /// Exit code, or `None` when the process was killed by a signal.
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// A fixed script the harness depends on is absent.
    ///
    /// This is a packaging defect, always fatal, never retried.
    #[error("required script missing: {path}")]
    PreconditionMissing { path: PathBuf },

    /// A load-generation run was requested but pgbench was never located.
    #[error("pgbench binary not found; load generation is unavailable")]
    LoadGeneratorUnavailable,

    /// The PostgreSQL toolchain could not be located.
    #[error("PostgreSQL toolchain not found: {detail}")]
    ToolchainMissing { detail: String },

    /// A lifecycle operation was requested in a state that cannot
    /// legally reach it (transitions are strictly forward).
    #[error("cannot {operation} a {state} cluster")]
    InvalidTransition {
        operation: &'static str,
        state: LifecycleState,
    },

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a toolchain-missing error.
    pub fn toolchain_missing(detail: impl Into<String>) -> Self {
        Self::ToolchainMissing {
            detail: detail.into(),
        }
    }

    /// True when the error means "skip, don't fail": the environment or
    /// its tooling cannot support the requested operation.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::EnvironmentUnsupported { .. } | Self::LoadGeneratorUnavailable
        )
    }
}

fn exit_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {code}"),
        None => "signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = Error::CommandFailed {
            program: "initdb".to_string(),
            args: vec!["-D".to_string(), "/tmp/data".to_string()],
            status: Some(1),
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("initdb"));
        assert!(text.contains("exit code 1"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn test_signal_exit_display() {
        let err = Error::CommandFailed {
            program: "pg_ctl".to_string(),
            args: vec![],
            status: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_skippable_classification() {
        assert!(Error::LoadGeneratorUnavailable.is_skippable());
        assert!(
            Error::EnvironmentUnsupported {
                kind: EnvFailureKind::PermissionDenied,
                detail: "shm".to_string(),
            }
            .is_skippable()
        );
        assert!(!Error::PreconditionMissing { path: "x.sql".into() }.is_skippable());
    }
}
