use thiserror::Error;

pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    /// Network-level failure before a status line was obtained.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-retryable non-success HTTP status.
    #[error("HTTP response code: {0}")]
    Http(u16),

    /// Server answered a ranged GET with 200 and the full body.
    #[error("range downloading not supported by this server")]
    RangeNotSupported,

    /// 401 that survived the authentication retries.
    #[error("unauthorized")]
    Unauthorized,

    /// Malformed virtual path or `/vsicurl?` query missing `url=`.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}
