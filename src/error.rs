//! Error taxonomy for environment builds.
//!
//! Every variant that concerns a single step carries a [`StepRef`] so the
//! operator sees which step failed and what kind it was. Nothing here is
//! retried: each error ends the current build attempt.

use std::fmt;
use thiserror::Error;

/// Identifies a step in an error report: position and kind label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRef {
    /// 0-based position in the declared step list.
    pub order: usize,
    /// Kind label, e.g. `package-install`.
    pub kind: &'static str,
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.order + 1, self.kind)
    }
}

/// Errors produced while building an environment image.
#[derive(Error, Debug)]
pub enum BuildError {
    /// A step's payload violates its kind's structural constraints.
    #[error("{step}: malformed step: {reason}")]
    MalformedStepSpec { step: StepRef, reason: String },

    /// Transport-level failure reaching a repository or installer endpoint.
    #[error("{step}: network failure fetching {url}: {reason}")]
    NetworkFailure {
        step: StepRef,
        url: String,
        reason: String,
    },

    /// Fetched installer content failed its verification policy.
    #[error("{step}: integrity violation: expected sha256 {expected}, got {actual}")]
    IntegrityViolation {
        step: StepRef,
        expected: String,
        actual: String,
    },

    /// The underlying install/cleanup action failed, could not start, or timed out.
    #[error("{step}: execution failed: {reason}")]
    StepExecutionFailure { step: StepRef, reason: String },

    #[error("no provisioning steps declared")]
    EmptyStepList,

    #[error("base image {reference} not found in store (run 'envbuild base import {reference} <dir>')")]
    BaseImageNotFound { reference: String },

    /// Post-build checks found missing or non-executable paths.
    #[error("image verification failed:\n  {}", .failures.join("\n  "))]
    VerificationFailed { failures: Vec<String> },

    #[error("build cancelled by operator{}", .step.map(|s| format!(" during {}", s)).unwrap_or_default())]
    Cancelled { step: Option<StepRef> },

    #[error("image store: {message}")]
    Store { message: String },
}

impl BuildError {
    /// Wrap an image store failure, keeping the full context chain.
    pub fn store(err: anyhow::Error) -> Self {
        BuildError::Store {
            message: format!("{:#}", err),
        }
    }

    /// The step this error is attributed to, if any.
    pub fn step(&self) -> Option<StepRef> {
        match self {
            BuildError::MalformedStepSpec { step, .. }
            | BuildError::NetworkFailure { step, .. }
            | BuildError::IntegrityViolation { step, .. }
            | BuildError::StepExecutionFailure { step, .. } => Some(*step),
            BuildError::Cancelled { step } => *step,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_ref_display_is_one_based() {
        let step = StepRef {
            order: 1,
            kind: "remote-script",
        };
        assert_eq!(step.to_string(), "step 2 (remote-script)");
    }

    #[test]
    fn test_error_reports_step_and_cause() {
        let err = BuildError::StepExecutionFailure {
            step: StepRef {
                order: 0,
                kind: "package-install",
            },
            reason: "apt-get exited with status 100".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("step 1 (package-install)"));
        assert!(msg.contains("status 100"));
        assert_eq!(err.step().map(|s| s.order), Some(0));
    }

    #[test]
    fn test_cancelled_without_step() {
        let err = BuildError::Cancelled { step: None };
        assert_eq!(err.to_string(), "build cancelled by operator");
        assert!(err.step().is_none());
    }

    #[test]
    fn test_verification_failures_listed() {
        let err = BuildError::VerificationFailed {
            failures: vec!["/usr/bin/gcc: missing".into(), "/tmp: not empty".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("/usr/bin/gcc: missing"));
        assert!(msg.contains("/tmp: not empty"));
    }
}
