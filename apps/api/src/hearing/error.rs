use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::hearing::schema::SchemaError;
use crate::llm_client::LlmError;

/// Failure of a single chain invocation. Recovered by the state machine.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("audio payload is empty")]
    EmptyAudio,

    #[error("audio payload is not valid base64: {0}")]
    InvalidAudioEncoding(String),

    #[error("unsupported audio MIME type '{0}'")]
    UnsupportedMime(String),

    #[error("provider returned an empty transcript")]
    EmptyTranscript,

    #[error("provider call failed: {0}")]
    Provider(#[from] LlmError),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Which phase of the run a terminal failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Transcription,
    Extraction,
    Validation,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailurePhase::Transcription => "transcription",
            FailurePhase::Extraction => "extraction",
            FailurePhase::Validation => "validation",
        })
    }
}

/// The cause behind a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transcription,
    ExtractionCall,
    QualityRejected,
    SchemaValidation,
    Cancelled,
    /// The machine received an event that its current state cannot handle.
    Internal,
}

/// The single terminal error returned by the hearing pipeline.
///
/// `issues` is never empty. It carries the accumulated feedback of the run with the
/// failure cause appended last.
#[derive(Debug, Clone, Error, Serialize)]
#[error("hearing {phase} failed ({kind:?}) after {retry_count} retries: {}", .issues.join("; "))]
pub struct PipelineError {
    pub phase: FailurePhase,
    pub kind: FailureKind,
    pub issues: Vec<String>,
    pub retry_count: u32,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}
