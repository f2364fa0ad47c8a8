use crate::queue::JobId;

/// Errors surfaced by the upload engine, the segmenter and the job queue.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// An operation that needs an open stream was called before `begin`.
    #[error("stream not initialized")]
    StreamNotInitialized,

    #[error("a stream is already open")]
    StreamAlreadyOpen,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The upload was cancelled at a chunk boundary.
    #[error("cancelled")]
    Cancelled,

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("not currently uploading")]
    NotUploading,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors produced by a [`Transport`](crate::transport::Transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The server answered, but refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}
