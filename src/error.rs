use thiserror::Error;

/// Errors surfaced by the matching engine, one variant per failure layer.
///
/// The engine fails fast: nothing is retried and no error is swallowed.
/// `Cancelled` is deliberately distinct from every other failure so callers
/// can tell an aborted operation from a broken one.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid field definitions, detected at model construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A record that does not line up with the data model.
    #[error("record {id} does not match the data model: {reason}")]
    Ingest { id: String, reason: String },

    /// Not enough or degenerate training data.
    #[error("training failed: {0}")]
    Training(String),

    /// A feature vector contained NaN for a field that cannot be missing.
    /// Indicates a comparator bug, not bad data.
    #[error("non-finite distance in feature column '{column}'")]
    NonFiniteFeature { column: String },

    /// Malformed settings container or training document.
    #[error("settings: {0}")]
    Settings(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The operation observed its cancellation token. Partial results are
    /// never returned.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
