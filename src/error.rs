use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the record/replay layer.
///
/// Parse and I/O failures encountered while loading a tape directory are
/// recovered in place (the offending file is skipped with a warning); every
/// other variant propagates to the harness.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// No recorded exchange answers the current stimulus.
    ///
    /// `context` is a diagnostic snapshot of the match context (program,
    /// args, cwd, prompt excerpt, normalized key) taken at miss time.
    #[error("tape miss: {message}")]
    TapeMiss {
        message: String,
        context: serde_json::Value,
    },

    /// A tape file failed to parse or validate.
    #[error("invalid tape {}: {message}", path.display())]
    Schema { message: String, path: PathBuf },

    /// A redaction pattern or custom rule failed during tape save.
    #[error("redaction failed: {0}")]
    Redaction(String),

    /// The recorder could not attach to the session or persist its tape.
    #[error("recording failed: {0}")]
    Recording(String),

    /// The replay producer or transport reached an impossible state.
    #[error("playback failed: {0}")]
    Playback(String),

    /// An `expect` deadline expired before any pattern matched.
    #[error("timed out waiting for patterns: {patterns}")]
    Timeout { patterns: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReplayError {
    /// Diagnostic payload attached to a tape miss, if any.
    pub fn miss_context(&self) -> Option<&serde_json::Value> {
        match self {
            ReplayError::TapeMiss { context, .. } => Some(context),
            _ => None,
        }
    }
}
