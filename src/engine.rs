use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TransportError, UploadError};
use crate::hash::{ContentHash, FileHasher};
use crate::transport::{ObjectId, StreamId, Transport};

/// The result of a successfully finished stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub object_id: ObjectId,
    pub extension: String,
    /// Hash over all bytes of the stream, in upload order.
    pub file_hash: ContentHash,
    pub size: u64,
}

/// Per-stream state. Dropped as soon as the stream is finished or destroyed.
#[derive(Debug)]
struct StreamSession {
    stream_id: StreamId,
    extension: String,
    hasher: FileHasher,
}

/// Drives the stream protocol of the storage service: one stream at a time,
/// with chunks uploaded in order and retried until they are accepted.
#[derive(Debug)]
pub struct ChunkedUploader<T> {
    transport: T,
    retry_delay: Duration,
    session: Option<StreamSession>,
}

impl<T: Transport> ChunkedUploader<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            retry_delay: Duration::ZERO,
            session: None,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub(crate) fn set_retry_delay(&mut self, retry_delay: Duration) {
        self.retry_delay = retry_delay;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn stream_id(&self) -> Option<&StreamId> {
        self.session.as_ref().map(|session| &session.stream_id)
    }

    /// Opens a new stream for an object with the given `extension`.
    pub async fn begin(&mut self, extension: &str) -> Result<(), UploadError> {
        if self.session.is_some() {
            return Err(UploadError::StreamAlreadyOpen);
        }

        let stream_id = self.transport.create_stream(extension).await?.stream_id;
        info!(stream_id = %stream_id, extension, "stream opened");

        self.session = Some(StreamSession {
            stream_id,
            extension: extension.into(),
            hasher: FileHasher::new(),
        });
        Ok(())
    }

    /// Uploads the next chunk of the stream, retrying until the service
    /// accepts it. Never gives up on its own.
    pub async fn upload_chunk(&mut self, chunk: Bytes) -> Result<ContentHash, UploadError> {
        self.upload_chunk_with_cancel(chunk, &CancellationToken::new())
            .await
    }

    /// Like [`upload_chunk`](Self::upload_chunk), but stops retrying with
    /// [`UploadError::Cancelled`] once `cancel` fires.
    ///
    /// The token is only looked at between two attempts, an attempt in
    /// progress is never interrupted. Waiting out the retry delay is.
    pub async fn upload_chunk_with_cancel(
        &mut self,
        chunk: Bytes,
        cancel: &CancellationToken,
    ) -> Result<ContentHash, UploadError> {
        let session = self
            .session
            .as_mut()
            .ok_or(UploadError::StreamNotInitialized)?;

        let hash = ContentHash::digest(&chunk);
        // folded exactly once, no matter how many attempts follow
        session.hasher.update(&chunk);

        let mut attempt: u64 = 1;
        loop {
            match self
                .transport
                .upload_chunk(&session.stream_id, &hash, chunk.clone())
                .await
            {
                Ok(response) if response.success => {
                    debug!(
                        stream_id = %session.stream_id,
                        hash = %hash,
                        bytes = chunk.len(),
                        attempt,
                        "chunk uploaded"
                    );
                    return Ok(hash);
                }
                Ok(_) => {
                    warn!(stream_id = %session.stream_id, hash = %hash, attempt, "chunk refused, retrying");
                }
                Err(error) => {
                    warn!(stream_id = %session.stream_id, hash = %hash, attempt, %error, "chunk upload failed, retrying");
                }
            }

            if self.retry_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    () = tokio::time::sleep(self.retry_delay) => {}
                    () = cancel.cancelled() => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            attempt += 1;
        }
    }

    /// Finalizes the stream into an object. A single attempt: the stream is
    /// over afterwards, whether this succeeded or not.
    pub async fn finish(&mut self) -> Result<UploadedObject, UploadError> {
        let session = self
            .session
            .take()
            .ok_or(UploadError::StreamNotInitialized)?;

        let size = session.hasher.len();
        let file_hash = session.hasher.finalize();
        let object_id = self
            .transport
            .finish_stream(&session.stream_id, &file_hash)
            .await?
            .object_id;
        info!(stream_id = %session.stream_id, object_id = %object_id, hash = %file_hash, size, "stream finished");

        Ok(UploadedObject {
            object_id,
            extension: session.extension,
            file_hash,
            size,
        })
    }

    /// Aborts the stream on the service side. No object is produced.
    pub async fn destroy(&mut self) -> Result<(), UploadError> {
        let session = self
            .session
            .take()
            .ok_or(UploadError::StreamNotInitialized)?;

        let response = self.transport.remove_stream(&session.stream_id).await?;
        if !response.success {
            return Err(TransportError::Rejected(format!(
                "stream {} was not removed",
                session.stream_id
            ))
            .into());
        }
        info!(stream_id = %session.stream_id, "stream destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::memory::{Call, CallKind, MemoryTransport};

    fn uploader() -> (Arc<MemoryTransport>, ChunkedUploader<Arc<MemoryTransport>>) {
        let transport = Arc::new(MemoryTransport::new());
        (Arc::clone(&transport), ChunkedUploader::new(transport))
    }

    #[tokio::test]
    async fn requires_begin() {
        let (transport, mut uploader) = uploader();

        let chunk = Bytes::from_static(b"chunk");
        assert!(matches!(
            uploader.upload_chunk(chunk).await,
            Err(UploadError::StreamNotInitialized)
        ));
        assert!(matches!(
            uploader.finish().await,
            Err(UploadError::StreamNotInitialized)
        ));
        assert!(matches!(
            uploader.destroy().await,
            Err(UploadError::StreamNotInitialized)
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn uploads_and_finishes() {
        let (transport, mut uploader) = uploader();
        uploader.begin("txt").await.unwrap();
        assert!(uploader.is_open());

        let contents = b"some pre-chunked content";
        let first = uploader
            .upload_chunk(Bytes::from_static(&contents[..16]))
            .await
            .unwrap();
        assert_eq!(first, ContentHash::digest(&contents[..16]));
        uploader
            .upload_chunk(Bytes::from_static(&contents[16..]))
            .await
            .unwrap();

        let object = uploader.finish().await.unwrap();
        assert!(!uploader.is_open());
        assert_eq!(object.file_hash, ContentHash::digest(contents));
        assert_eq!(object.size, contents.len() as u64);
        assert_eq!(object.extension, "txt");

        let stored = transport.object(&object.object_id).unwrap();
        assert_eq!(stored.data, contents);
        assert_eq!(stored.extension, "txt");
    }

    #[tokio::test]
    async fn begin_twice_is_refused() {
        let (transport, mut uploader) = uploader();
        uploader.begin("a").await.unwrap();
        let stream_id = uploader.stream_id().cloned();

        assert!(matches!(
            uploader.begin("b").await,
            Err(UploadError::StreamAlreadyOpen)
        ));
        assert_eq!(uploader.stream_id().cloned(), stream_id);
        assert_eq!(transport.count_calls(CallKind::CreateStream), 1);
    }

    #[tokio::test]
    async fn failed_begin_leaves_no_stream() {
        let (transport, mut uploader) = uploader();
        transport.fail_next(CallKind::CreateStream, 1);

        assert!(matches!(
            uploader.begin("bin").await,
            Err(UploadError::Transport(TransportError::Unavailable(_)))
        ));
        assert!(!uploader.is_open());

        uploader.begin("bin").await.unwrap();
        assert!(uploader.is_open());
    }

    #[tokio::test]
    async fn retries_do_not_corrupt_the_file_hash() {
        let (transport, mut uploader) = uploader();
        uploader.begin("bin").await.unwrap();

        transport.fail_next(CallKind::UploadChunk, 3);
        uploader
            .upload_chunk(Bytes::from_static(b"first "))
            .await
            .unwrap();
        transport.fail_next(CallKind::UploadChunk, 1);
        uploader
            .upload_chunk(Bytes::from_static(b"second"))
            .await
            .unwrap();

        assert_eq!(transport.count_calls(CallKind::UploadChunk), 6);

        let object = uploader.finish().await.unwrap();
        assert_eq!(object.file_hash, ContentHash::digest(b"first second"));
    }

    #[tokio::test]
    async fn cancel_bounds_the_retry_loop() {
        let (transport, mut uploader) = uploader();
        uploader.begin("bin").await.unwrap();
        transport.fail_next(CallKind::UploadChunk, usize::MAX);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = uploader
            .upload_chunk_with_cancel(Bytes::from_static(b"stuck"), &cancel)
            .await;

        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert_eq!(transport.count_calls(CallKind::UploadChunk), 1);
        assert!(uploader.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_for_the_retry_delay() {
        let transport = Arc::new(MemoryTransport::new());
        let mut uploader = ChunkedUploader::new(Arc::clone(&transport))
            .with_retry_delay(Duration::from_secs(1));
        uploader.begin("bin").await.unwrap();
        transport.fail_next(CallKind::UploadChunk, 3);

        let started = tokio::time::Instant::now();
        uploader
            .upload_chunk(Bytes::from_static(b"slow"))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
        assert_eq!(uploader.transport().count_calls(CallKind::UploadChunk), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_retry_delay_wait() {
        let transport = Arc::new(MemoryTransport::new());
        let mut uploader = ChunkedUploader::new(Arc::clone(&transport))
            .with_retry_delay(Duration::from_secs(60));
        uploader.begin("bin").await.unwrap();
        transport.fail_next(CallKind::UploadChunk, usize::MAX);

        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let (result, ()) = tokio::join!(
            uploader.upload_chunk_with_cancel(Bytes::from_static(b"stuck"), &cancel),
            async {
                tokio::time::sleep(Duration::from_secs(90)).await;
                cancel.cancel();
            }
        );

        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(120));
        // attempts at 0s and 60s, the one due at 120s never happens
        assert_eq!(transport.count_calls(CallKind::UploadChunk), 2);
    }

    #[tokio::test]
    async fn failed_finish_is_terminal() {
        let (transport, mut uploader) = uploader();
        uploader.begin("bin").await.unwrap();
        uploader
            .upload_chunk(Bytes::from_static(b"data"))
            .await
            .unwrap();

        transport.fail_next(CallKind::FinishStream, 1);
        assert!(matches!(
            uploader.finish().await,
            Err(UploadError::Transport(_))
        ));
        assert!(matches!(
            uploader.finish().await,
            Err(UploadError::StreamNotInitialized)
        ));
        assert_eq!(transport.count_calls(CallKind::FinishStream), 1);
    }

    #[tokio::test]
    async fn destroy_then_reuse() {
        let (transport, mut uploader) = uploader();
        uploader.begin("bin").await.unwrap();
        uploader
            .upload_chunk(Bytes::from_static(b"discarded"))
            .await
            .unwrap();
        let first_stream = uploader.stream_id().cloned().unwrap();
        uploader.destroy().await.unwrap();
        assert_eq!(transport.open_streams(), 0);

        uploader.begin("bin").await.unwrap();
        assert_ne!(uploader.stream_id(), Some(&first_stream));
        uploader
            .upload_chunk(Bytes::from_static(b"kept"))
            .await
            .unwrap();
        let object = uploader.finish().await.unwrap();
        assert_eq!(object.file_hash, ContentHash::digest(b"kept"));

        assert_eq!(
            transport.calls()[2],
            Call::RemoveStream {
                stream_id: first_stream
            }
        );
    }
}
