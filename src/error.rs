use thiserror::Error;

pub type Result<T> = std::result::Result<T, VdjError>;

/// Crate-wide error type. Input and configuration problems are fatal at the
/// call site; a zero sequence likelihood is not an error and never surfaces
/// here (underflowing reads are counted separately by the inference driver).
#[derive(Debug, Error)]
pub enum VdjError {
    /// Malformed fasta/CSV input or an unknown nucleotide character. Carries
    /// the offending line or token.
    #[error("malformed input: {0}")]
    InputFormat(String),

    /// Structural model problem: cycle-creating edge, unknown event, missing
    /// offset band, duplicate name.
    #[error("model configuration error: {0}")]
    Config(String),

    /// Likelihood threshold or probability-threshold ratio outside (0, 1].
    #[error("threshold out of range: {0}")]
    Threshold(String),

    /// Per-sequence iteration failure; the driver logs the sequence before
    /// propagating.
    #[error("failed processing sequence {seq_index}: {reason}")]
    Sequence { seq_index: i32, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}
