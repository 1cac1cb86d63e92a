use thiserror::Error;

/// Failures the engine surfaces to its callers.
///
/// Engine operations return `anyhow::Result`; these values travel inside it
/// and can be recovered with `err.downcast_ref::<PilotError>()`.
#[derive(Debug, Error)]
pub enum PilotError {
    /// Missing or invalid configuration at init
    #[error("configuration error: {0}")]
    Config(String),

    /// Session control called in the wrong state
    #[error("sequencing error: {0}")]
    Sequencing(String),

    /// Oracle call failed or produced no code
    #[error("generation failed: {0}")]
    Generation(String),

    /// Generated code failed inside the sandbox
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// A required tagged field is missing from an oracle response
    #[error("parse error: missing required tag <{tag}> for field '{field}'")]
    Parse { field: String, tag: String },

    /// Backend capture failed
    #[error("capture failed: {0}")]
    Capture(String),
}
