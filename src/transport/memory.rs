use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::{
    CreateStreamResponse, FinishStreamResponse, ObjectId, RemoveStreamResponse, StreamId,
    Transport, UploadChunkResponse,
};
use crate::error::TransportError;
use crate::hash::{ContentHash, FileHasher};

/// A single request as seen by the [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateStream {
        extension: String,
    },
    UploadChunk {
        stream_id: StreamId,
        hash: ContentHash,
        len: usize,
    },
    FinishStream {
        stream_id: StreamId,
        file_hash: ContentHash,
    },
    RemoveStream {
        stream_id: StreamId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    CreateStream,
    UploadChunk,
    FinishStream,
    RemoveStream,
}

impl Call {
    pub fn kind(&self) -> CallKind {
        match self {
            Self::CreateStream { .. } => CallKind::CreateStream,
            Self::UploadChunk { .. } => CallKind::UploadChunk,
            Self::FinishStream { .. } => CallKind::FinishStream,
            Self::RemoveStream { .. } => CallKind::RemoveStream,
        }
    }
}

/// An object assembled from the chunks of a finished stream.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub extension: String,
    pub hash: ContentHash,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct OpenStream {
    extension: String,
    chunks: Vec<Bytes>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    streams: HashMap<StreamId, OpenStream>,
    objects: HashMap<ObjectId, StoredObject>,
    calls: Vec<Call>,
    failures: HashMap<CallKind, usize>,
}

impl State {
    fn record(&mut self, call: Call) -> Result<(), TransportError> {
        let kind = call.kind();
        self.calls.push(call);

        match self.failures.get_mut(&kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(TransportError::Unavailable(format!(
                    "injected {kind:?} failure"
                )))
            }
            _ => Ok(()),
        }
    }

    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// A storage service that lives in process memory.
///
/// Chunks are checked against their content address, and a stream can only
/// be finished with the hash of exactly the bytes it received. Every call is
/// recorded, and failures can be injected per call kind.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` calls of `kind` fail with
    /// [`TransportError::Unavailable`].
    pub fn fail_next(&self, kind: CallKind, count: usize) {
        *self.state().failures.entry(kind).or_default() += count;
    }

    /// All calls received so far, including failed ones.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, kind: CallKind) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.kind() == kind)
            .count()
    }

    pub fn open_streams(&self) -> usize {
        self.state().streams.len()
    }

    pub fn object(&self, object_id: &ObjectId) -> Option<StoredObject> {
        self.state().objects.get(object_id).cloned()
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn create_stream(
        &self,
        extension: &str,
    ) -> Result<CreateStreamResponse, TransportError> {
        let mut state = self.state();
        state.record(Call::CreateStream {
            extension: extension.into(),
        })?;

        let stream_id = StreamId(state.allocate_id("stream"));
        state.streams.insert(
            stream_id.clone(),
            OpenStream {
                extension: extension.into(),
                chunks: vec![],
            },
        );

        Ok(CreateStreamResponse { stream_id })
    }

    async fn upload_chunk(
        &self,
        stream_id: &StreamId,
        hash: &ContentHash,
        chunk: Bytes,
    ) -> Result<UploadChunkResponse, TransportError> {
        let mut state = self.state();
        state.record(Call::UploadChunk {
            stream_id: stream_id.clone(),
            hash: *hash,
            len: chunk.len(),
        })?;

        if ContentHash::digest(&chunk) != *hash {
            return Ok(UploadChunkResponse { success: false });
        }
        let stream = state
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| TransportError::Rejected(format!("unknown stream {stream_id}")))?;
        stream.chunks.push(chunk);

        Ok(UploadChunkResponse { success: true })
    }

    async fn finish_stream(
        &self,
        stream_id: &StreamId,
        file_hash: &ContentHash,
    ) -> Result<FinishStreamResponse, TransportError> {
        let mut state = self.state();
        state.record(Call::FinishStream {
            stream_id: stream_id.clone(),
            file_hash: *file_hash,
        })?;

        let stream = state
            .streams
            .remove(stream_id)
            .ok_or_else(|| TransportError::Rejected(format!("unknown stream {stream_id}")))?;

        let mut hasher = FileHasher::new();
        let mut data = Vec::new();
        for chunk in &stream.chunks {
            hasher.update(chunk);
            data.extend_from_slice(chunk);
        }
        let hash = hasher.finalize();
        if hash != *file_hash {
            return Err(TransportError::Rejected(format!(
                "hash mismatch: expected {file_hash}, assembled {hash}"
            )));
        }

        let object_id = ObjectId(state.allocate_id("object"));
        state.objects.insert(
            object_id.clone(),
            StoredObject {
                extension: stream.extension,
                hash,
                data,
            },
        );

        Ok(FinishStreamResponse { object_id })
    }

    async fn remove_stream(
        &self,
        stream_id: &StreamId,
    ) -> Result<RemoveStreamResponse, TransportError> {
        let mut state = self.state();
        state.record(Call::RemoveStream {
            stream_id: stream_id.clone(),
        })?;

        let success = state.streams.remove(stream_id).is_some();
        Ok(RemoveStreamResponse { success })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assembles_finished_objects() {
        let transport = MemoryTransport::new();
        let stream_id = transport.create_stream("bin").await.unwrap().stream_id;

        for chunk in [&b"hello "[..], b"world"] {
            let hash = ContentHash::digest(chunk);
            let response = transport
                .upload_chunk(&stream_id, &hash, Bytes::copy_from_slice(chunk))
                .await
                .unwrap();
            assert!(response.success);
        }

        let file_hash = ContentHash::digest(b"hello world");
        let object_id = transport
            .finish_stream(&stream_id, &file_hash)
            .await
            .unwrap()
            .object_id;

        let object = transport.object(&object_id).unwrap();
        assert_eq!(object.data, b"hello world");
        assert_eq!(object.extension, "bin");
        assert_eq!(object.hash, file_hash);
        assert_eq!(transport.open_streams(), 0);
    }

    #[tokio::test]
    async fn refuses_mismatched_hashes() {
        let transport = MemoryTransport::new();
        let stream_id = transport.create_stream("bin").await.unwrap().stream_id;

        let wrong = ContentHash::digest(b"something else");
        let response = transport
            .upload_chunk(&stream_id, &wrong, Bytes::from_static(b"chunk"))
            .await
            .unwrap();
        assert!(!response.success);

        let result = transport.finish_stream(&stream_id, &wrong).await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn injected_failures_are_recorded() {
        let transport = MemoryTransport::new();
        transport.fail_next(CallKind::CreateStream, 2);

        assert!(transport.create_stream("a").await.is_err());
        assert!(transport.create_stream("b").await.is_err());
        let stream_id = transport.create_stream("c").await.unwrap().stream_id;

        assert_eq!(transport.count_calls(CallKind::CreateStream), 3);
        assert!(transport.remove_stream(&stream_id).await.unwrap().success);
        assert!(!transport.remove_stream(&stream_id).await.unwrap().success);
    }
}
