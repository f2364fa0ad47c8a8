use core::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::hash::ContentHash;

pub mod http;
pub mod memory;

/// Server-assigned identifier of an open upload stream.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

/// Server-assigned identifier of a finalized object.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStreamResponse {
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishStreamResponse {
    pub object_id: ObjectId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveStreamResponse {
    pub success: bool,
}

/// The request/response primitive of the remote object-storage service.
///
/// Any non-success answer of the service has to surface as an `Err`,
/// never as an empty successful response.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn create_stream(&self, extension: &str)
        -> Result<CreateStreamResponse, TransportError>;

    async fn upload_chunk(
        &self,
        stream_id: &StreamId,
        hash: &ContentHash,
        chunk: Bytes,
    ) -> Result<UploadChunkResponse, TransportError>;

    async fn finish_stream(
        &self,
        stream_id: &StreamId,
        file_hash: &ContentHash,
    ) -> Result<FinishStreamResponse, TransportError>;

    async fn remove_stream(&self, stream_id: &StreamId)
        -> Result<RemoveStreamResponse, TransportError>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn create_stream(
        &self,
        extension: &str,
    ) -> Result<CreateStreamResponse, TransportError> {
        (**self).create_stream(extension).await
    }

    async fn upload_chunk(
        &self,
        stream_id: &StreamId,
        hash: &ContentHash,
        chunk: Bytes,
    ) -> Result<UploadChunkResponse, TransportError> {
        (**self).upload_chunk(stream_id, hash, chunk).await
    }

    async fn finish_stream(
        &self,
        stream_id: &StreamId,
        file_hash: &ContentHash,
    ) -> Result<FinishStreamResponse, TransportError> {
        (**self).finish_stream(stream_id, file_hash).await
    }

    async fn remove_stream(
        &self,
        stream_id: &StreamId,
    ) -> Result<RemoveStreamResponse, TransportError> {
        (**self).remove_stream(stream_id).await
    }
}
