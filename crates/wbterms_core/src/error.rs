use thiserror::Error as ThisError;

pub type Result<T, E = TermStoreError> = std::result::Result<T, E>;

/// Failures that cross the term store boundary. Uniqueness conflicts and
/// concurrent cleaner deletions are recovered internally and never show up here.
#[derive(Debug, ThisError)]
pub enum TermStoreError {
    /// The database could not be queried or written.
    #[error("term store query failed: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A term type name outside the label/description/alias vocabulary.
    #[error("unknown term type '{0}'")]
    UnknownTermType(String),

    /// A terms document that is not shaped type -> language -> text(s).
    #[error("malformed terms document: {0}")]
    MalformedTerms(String),

    /// A stored type id that no type store can name.
    #[error("unknown term type id {0}")]
    UnknownTypeId(i64),

    /// Rows kept disappearing between insert and re-read.
    #[error(
        "could not acquire {missing} record(s) in {table} after {attempts} insert attempt(s)"
    )]
    AcquisitionExhausted {
        table: &'static str,
        missing: usize,
        attempts: usize,
    },
}

impl From<serde_json::Error> for TermStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedTerms(err.to_string())
    }
}
