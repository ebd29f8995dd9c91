use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConvertError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("study consistency violated: {0}")]
    StudyConsistency(String),

    #[error("heuristic error: {0}")]
    Heuristic(String),

    #[error("heuristic not found: {0}")]
    HeuristicNotFound(String),

    #[error("failed to parse heuristic {path}: {message}")]
    HeuristicParse { path: String, message: String },

    #[error("transcoder failed for series {series}: {message}")]
    Transcoder { series: String, message: String },

    #[error("missing external tool: {0}")]
    MissingTool(String),

    #[error("sidecar error at {path}: {message}")]
    Sidecar { path: String, message: String },

    #[error("failed to read DICOM {path}: {message}")]
    DicomRead { path: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("timed out acquiring dataset lock at {0}")]
    LockTimeout(String),

    #[error("invalid label: {0}")]
    InvalidLabel(String),

    #[error("queue submission failed: {0}")]
    Queue(String),
}
