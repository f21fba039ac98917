//! Error types for extraction jobs
//!
//! [`ExtractError`] classifies what went wrong; [`JobFailure`] adds the state
//! of the extraction loop the error surfaced in, so operators can tell a
//! misconfiguration from lost progress tracking or an exhausted retry budget.

use std::fmt;
use thiserror::Error;

use crate::emitter::EmitError;
use crate::watermark::StoreError;

/// Result type for extraction operations
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Errors raised while running an extraction job
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Invalid job configuration (bad identifiers, keys outside the
    /// projection, incomparable key values)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Table metadata could not be read or the table does not exist
    #[error("schema error: {0}")]
    Schema(#[source] tidemark_rdbc::Error),

    /// A transient source failure persisted through every retry
    #[error("source still failing after {attempts} attempts: {last}")]
    TransientSource {
        /// Attempts made, including the first
        attempts: u32,
        /// Error returned by the final attempt
        #[source]
        last: tidemark_rdbc::Error,
    },

    /// A non-transient source failure (syntax, permissions, missing column)
    #[error("source error: {0}")]
    Source(#[source] tidemark_rdbc::Error),

    /// A non-empty batch did not move the key tuple past the watermark
    #[error("no forward progress: last key {last} is not beyond watermark {watermark}")]
    ProgressStall {
        /// Watermark in effect for the poll
        watermark: String,
        /// Key tuple of the last row returned
        last: String,
    },

    /// The emitter rejected a batch
    #[error("emitter rejected batch: {0}")]
    Sink(#[from] EmitError),

    /// The watermark store failed
    #[error("watermark store error: {0}")]
    WatermarkStore(#[from] StoreError),
}

impl ExtractError {
    /// Short machine-friendly name of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Schema(_) => "schema",
            Self::TransientSource { .. } => "transient_source",
            Self::Source(_) => "source",
            Self::ProgressStall { .. } => "progress_stall",
            Self::Sink(_) => "sink",
            Self::WatermarkStore(_) => "watermark_store",
        }
    }

    /// Whether fixing this requires operator intervention on the job definition
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Schema(_))
    }
}

/// States of the extraction loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractState {
    /// Resolving keys and reading the initial watermark
    Init,
    /// Reading the watermark and building the next query
    Plan,
    /// Running the query
    Execute,
    /// Waiting before retrying a transient failure
    RetryWait,
    /// Checking the result and handing it to the emitter
    Validate,
    /// Persisting the new watermark
    Advance,
    /// Non-empty result without forward progress
    Stall,
    /// Empty result in one-shot mode
    Exhausted,
    /// Sleeping between polls in continuous mode
    Idle,
    /// Finished
    Done,
    /// Failed
    Failed,
}

impl fmt::Display for ExtractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Plan => "PLAN",
            Self::Execute => "EXECUTE",
            Self::RetryWait => "RETRY_WAIT",
            Self::Validate => "VALIDATE",
            Self::Advance => "ADVANCE",
            Self::Stall => "STALL",
            Self::Exhausted => "EXHAUSTED",
            Self::Idle => "IDLE",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A fatal error together with the state it occurred in
#[derive(Error, Debug)]
#[error("extraction failed in {state} state: {error}")]
pub struct JobFailure {
    /// State the loop was in when the error surfaced
    pub state: ExtractState,
    /// Originating error
    #[source]
    pub error: ExtractError,
}

impl JobFailure {
    /// Wrap an error with the state it occurred in
    pub fn new(state: ExtractState, error: impl Into<ExtractError>) -> Self {
        Self {
            state,
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_names_state() {
        let failure = JobFailure::new(
            ExtractState::Init,
            ExtractError::Schema(tidemark_rdbc::Error::table_not_found("shop.orders")),
        );
        assert_eq!(
            failure.to_string(),
            "extraction failed in INIT state: schema error: table not found: shop.orders"
        );
        assert!(failure.error.is_configuration());
    }

    #[test]
    fn test_transient_exhaustion_message() {
        let err = ExtractError::TransientSource {
            attempts: 5,
            last: tidemark_rdbc::Error::Deadlock,
        };
        assert_eq!(
            err.to_string(),
            "source still failing after 5 attempts: deadlock detected"
        );
        assert_eq!(err.kind(), "transient_source");
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_stall_is_distinct() {
        let err = ExtractError::ProgressStall {
            watermark: "(id=5)".into(),
            last: "(id=5)".into(),
        };
        assert_eq!(err.kind(), "progress_stall");
        assert!(err.to_string().contains("no forward progress"));
    }
}
