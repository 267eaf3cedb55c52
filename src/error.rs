use thiserror::Error;

/// Errors raised while uploading, parsing, storing, plotting or rendering.
///
/// "No data yet" and "selected column missing" are not errors; they are
/// reported as [`crate::query::PlotOutcome`] variants.
#[derive(Debug, Error)]
pub enum DashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session table error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Uploaded content is not a sequence of JSON records.
    #[error("malformed input in {source_name}: {message}")]
    MalformedInput {
        source_name: String,
        message: String,
    },

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("no session table named {0}")]
    SessionNotFound(String),

    /// Invalid width, crop bounds or subclip bounds.
    #[error("video transform failed: {0}")]
    Transform(String),

    #[error("video codec failed: {0}")]
    Codec(String),

    #[error("chart rendering failed: {0}")]
    Chart(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl DashError {
    /// True for failures caused by what the user supplied rather than by the server.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DashError::MalformedInput { .. }
                | DashError::InvalidUpload(_)
                | DashError::Transform(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DashError>;
