use thiserror::Error;

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("project {0} not found")]
    ProjectNotFound(i64),

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("internal storage error: {0}")]
    Internal(String),

    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    /// An update stream named more than one project.
    #[error("update stream mixes projects {0} and {1}")]
    MultipleProjectsPerUpdate(i64, i64),

    /// Object-mode reads cannot substitute blobs from a client cache, so a
    /// cached hash showing up in one is a caller error.
    #[error("cached content requested in object mode")]
    CachedInObjectMode,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Error::Unavailable(err.to_string())
            }
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::InvalidInput {
            Error::InvalidArgument(err.to_string())
        } else {
            Error::Internal(err.to_string())
        }
    }
}

impl From<baumlager_pack::tar::PackError> for Error {
    fn from(err: baumlager_pack::tar::PackError) -> Self {
        // PackError::Empty is handled where aggregates are rewritten and
        // never bubbles this far.
        Error::Internal(err.to_string())
    }
}
