//! Shared types, errors, and outcomes for the retrosynthesis pipeline.
//!
//! This crate provides the foundational types used across all other retro crates:
//! - `RetroError`: unified error taxonomy
//! - `ExpansionStatus` / `EnumerationStatus` / `PipelineStatus`: stage tags
//! - `StageOutcome`: classified result of a single external tool run
//! - `PipelineResult`: combined output of a full pipeline run
//! - `RequestParams`: validated request parameters with documented defaults

pub mod archive;
pub mod outcome;
pub mod params;
pub mod status;

pub use outcome::{
    EnumerationOutcome, EnumerationPayload, ExpansionOutcome, PipelineResult, SourceDescriptor,
    StageOutcome,
};
pub use params::{
    gb_to_bytes, Diameters, EnumerationParams, Endpoint, ExpansionParams, ExpansionRequest,
    PipelineRequest, RequestParams, RuleFormat, RuleOutputFormat, RuleRequest, RuleScope,
};
pub use status::{
    status_code_for_tag, EnumerationStatus, ExpansionStatus, OutcomeStatus, PipelineStatus,
};

/// Unified error type for all retro subsystems.
#[derive(Debug, thiserror::Error)]
pub enum RetroError {
    // === Request Errors ===
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Missing required parameter '{0}'")]
    MissingParameter(String),

    // === Rule Selection Errors ===
    #[error("Rule table row {row} has a malformed diameter '{value}'")]
    MalformedDiameter { row: usize, value: String },

    #[error("Unknown {kind} format '{value}'")]
    UnknownFormat { kind: String, value: String },

    #[error("Rule archive must contain exactly one CSV entry, found {found}")]
    ArchiveLayout { found: usize },

    #[error("Rule table row {row} is missing the '{column}' column")]
    MissingColumn { row: usize, column: String },

    // === Subprocess Errors ===
    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot cap virtual memory at {requested} bytes: {reason}")]
    MemoryLimit { requested: u64, reason: String },

    // === Job Errors ===
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Job '{id}' is not finished (status: {status})")]
    JobNotFinished { id: String, status: String },

    #[error("Job '{id}' failed: {message}")]
    JobFailed { id: String, message: String },

    #[error("Job queue is closed")]
    QueueClosed,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Other(String),
}

impl RetroError {
    /// Returns `true` if the error stems from the caller's data rather than the host.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RetroError::BadRequest(_)
                | RetroError::MissingParameter(_)
                | RetroError::MalformedDiameter { .. }
                | RetroError::UnknownFormat { .. }
                | RetroError::ArchiveLayout { .. }
                | RetroError::MissingColumn { .. }
                | RetroError::Csv(_)
        )
    }

    /// Maps the error to an HTTP status code for server mode.
    pub fn http_status(&self) -> u16 {
        match self {
            RetroError::JobNotFound(_) => 404,
            RetroError::JobNotFinished { .. } => 409,
            // A failed job is reported as a request-level failure.
            RetroError::JobFailed { .. } => 400,
            e if e.is_client_error() => 400,
            _ => 500,
        }
    }
}

/// A convenience alias for `Result<T, RetroError>`.
pub type Result<T> = std::result::Result<T, RetroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_400() {
        let errors = [
            RetroError::BadRequest("x".into()),
            RetroError::MissingParameter("max_steps".into()),
            RetroError::MalformedDiameter {
                row: 3,
                value: "abc".into(),
            },
            RetroError::UnknownFormat {
                kind: "output".into(),
                value: "zip".into(),
            },
            RetroError::ArchiveLayout { found: 2 },
        ];
        for e in &errors {
            assert!(e.is_client_error(), "{e}");
            assert_eq!(e.http_status(), 400);
        }
    }

    #[test]
    fn infrastructure_errors_map_to_500() {
        let spawn = RetroError::Spawn {
            program: "knime".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(!spawn.is_client_error());
        assert_eq!(spawn.http_status(), 500);
        assert_eq!(
            RetroError::MemoryLimit {
                requested: 1,
                reason: "EPERM".into()
            }
            .http_status(),
            500
        );
    }

    #[test]
    fn job_errors_have_distinct_codes() {
        assert_eq!(RetroError::JobNotFound("a".into()).http_status(), 404);
        assert_eq!(
            RetroError::JobNotFinished {
                id: "a".into(),
                status: "running".into()
            }
            .http_status(),
            409
        );
        assert_eq!(
            RetroError::JobFailed {
                id: "a".into(),
                message: "boom".into()
            }
            .http_status(),
            400
        );
    }

    #[test]
    fn error_display_includes_context() {
        let e = RetroError::MalformedDiameter {
            row: 7,
            value: "x".into(),
        };
        assert_eq!(e.to_string(), "Rule table row 7 has a malformed diameter 'x'");
    }
}
