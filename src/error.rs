use thiserror::Error;

/// Errors surfaced by the ad core.
///
/// `NoAdsFound` and `OffsetOutOfRange` are ordinary empty-result outcomes,
/// kept distinct so the HTTP layer can report them separately.
#[derive(Debug, Error)]
pub enum AdError {
    #[error("{0}")]
    Validation(String),
    #[error("could not obtain the ad write lock")]
    LockContention,
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("replication log error: {0}")]
    Log(String),
    #[error("no ads found")]
    NoAdsFound,
    #[error("offset is out of range")]
    OffsetOutOfRange,
    #[error("timeout")]
    Timeout,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("internal error: {0}")]
    Internal(String),
}
