//! Error kinds for resolving and executing regression checks.
//!
//! Failures are local to one test instance (and the instances that depend on
//! it). The orchestrator records them in the run report instead of aborting
//! the session, so every variant carries enough context to be read on its own.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure raised while resolving or executing a single test instance.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unresolvable partition/environment/dependency reference, invalid
    /// pattern, or a dependency cycle.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The build recipe exited with a non-zero status.
    #[error("build failed with exit code {exit_code}: see {log}")]
    Build {
        /// Exit code of the build script (-1 when killed by a signal)
        exit_code: i32,
        /// Path of the captured build stderr
        log: String,
    },

    /// Wall-clock limit or poll-wait deadline exceeded, or the wait was
    /// cancelled from outside.
    #[error("run timed out after {elapsed_secs}s: {reason}")]
    RunTimeout {
        /// Seconds spent waiting before giving up
        elapsed_secs: u64,
        /// What tripped the timeout
        reason: String,
    },

    /// Submitting or polling the batch job failed, or a failed job had no
    /// sanity rules to judge it.
    #[error("batch job error: {0}")]
    Job(String),

    /// At least one sanity rule failed; carries the first failing rule's
    /// diagnostic.
    #[error("sanity check failed: {0}")]
    Sanity(String),

    /// A performance rule found nothing to extract and declared no default.
    #[error("performance extraction failed for '{metric}': {reason}")]
    Extraction {
        /// Metric name
        metric: String,
        /// Why extraction failed
        reason: String,
    },

    /// A metric fell outside the bounds of its reference.
    #[error("performance check failed: {0}")]
    Performance(String),

    /// A dependency did not reach a successful terminal state.
    #[error("dependency '{dependency}' did not succeed")]
    DependencyFailed {
        /// Instance name of the failed dependency
        dependency: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// The report-level kind of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Configuration(_) => FailureKind::ConfigurationError,
            PipelineError::Build { .. } => FailureKind::BuildError,
            PipelineError::RunTimeout { .. } => FailureKind::RunTimeoutError,
            PipelineError::Job(_) | PipelineError::Io(_) => FailureKind::JobError,
            PipelineError::Sanity(_) => FailureKind::SanityFailure,
            PipelineError::Extraction { .. } => FailureKind::ExtractionError,
            PipelineError::Performance(_) => FailureKind::PerformanceFailure,
            PipelineError::DependencyFailed { .. } => FailureKind::DependencyFailed,
        }
    }
}

/// Failure kind as it appears in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    ConfigurationError,
    BuildError,
    RunTimeoutError,
    JobError,
    SanityFailure,
    ExtractionError,
    PerformanceFailure,
    DependencyFailed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::ConfigurationError => "ConfigurationError",
            FailureKind::BuildError => "BuildError",
            FailureKind::RunTimeoutError => "RunTimeoutError",
            FailureKind::JobError => "JobError",
            FailureKind::SanityFailure => "SanityFailure",
            FailureKind::ExtractionError => "ExtractionError",
            FailureKind::PerformanceFailure => "PerformanceFailure",
            FailureKind::DependencyFailed => "DependencyFailed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PipelineError::Configuration("x".into()).kind(),
            FailureKind::ConfigurationError
        );
        assert_eq!(
            PipelineError::DependencyFailed {
                dependency: "a".into()
            }
            .kind(),
            FailureKind::DependencyFailed
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(PipelineError::from(io).kind(), FailureKind::JobError);
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::Build {
            exit_code: 2,
            log: "stage/build.err".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 2"));
        assert!(msg.contains("build.err"));
        assert_eq!(FailureKind::RunTimeoutError.to_string(), "RunTimeoutError");
    }
}
