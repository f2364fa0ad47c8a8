//! Chunked uploads of large files to an object-storage service.
//!
//! A [`ChunkedUploader`] speaks the stream protocol of the service, a
//! [`Segmenter`] slices a file into chunks and feeds them through it, and an
//! [`UploadQueue`] runs whole-file uploads one after another.

pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod queue;
pub mod segmenter;
pub mod source;
pub mod transport;

pub use config::UploadConfig;
pub use engine::{ChunkedUploader, UploadedObject};
pub use error::{TransportError, UploadError};
pub use hash::{ContentHash, FileHasher};
pub use queue::{Job, JobId, UploadQueue};
pub use segmenter::{CancelAck, CancelHandle, Segmenter};
pub use source::{FileSource, MemorySource, UploadSource};
pub use transport::http::HttpTransport;
pub use transport::memory::MemoryTransport;
pub use transport::{ObjectId, StreamId, Transport};
