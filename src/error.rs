use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("document update conflict")]
    Conflict,
    #[error("precondition failed: {0}")]
    PreconditionFailed(&'static str),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("malformed revision: {0:?}")]
    MalformedRev(String),
    #[error("data is malformed")]
    MalformedData,
    #[error("malformed multipart body: {0}")]
    Multipart(&'static str),
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),
    #[error("failed to establish database connection")]
    ConnectToDb(#[source] sqlx::Error),
    #[error("failed to create database schema")]
    CreateDbSchema(#[source] sqlx::Error),
    #[error("failed to execute database query")]
    QueryDb(#[source] sqlx::Error),
    #[error("failed to encode or decode JSON")]
    Json(#[from] serde_json::Error),
    #[error("transport error")]
    Transport(#[from] reqwest::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Self::QueryDb(error)
    }
}

impl Error {
    /// Whether this error means "the requested thing does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
