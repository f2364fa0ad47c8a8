use std::io;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::engine::ChunkedUploader;
use crate::error::UploadError;
use crate::source::UploadSource;
use crate::transport::Transport;

/// Splits `source` into read windows of `read_window` bytes, and each window
/// into chunks of `chunk_size` bytes, yielded in file order.
fn chunk_stream<'a>(
    source: &'a dyn UploadSource,
    chunk_size: u64,
    read_window: u64,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'a {
    async_stream::try_stream! {
        let total = source.len();
        let mut window_offset = 0;

        while window_offset < total {
            let window_len = read_window.min(total - window_offset);
            let window = source.read_range(window_offset, window_len as usize).await?;
            debug!(offset = window_offset, bytes = window_len, "read window");

            let mut chunk_offset = 0;
            while chunk_offset < window_len {
                let chunk_len = chunk_size.min(window_len - chunk_offset);
                yield window.slice(chunk_offset as usize..(chunk_offset + chunk_len) as usize);
                chunk_offset += chunk_len;
            }

            window_offset += window_len;
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    requested: CancellationToken,
    stopped: CancellationToken,
}

/// Cancels the upload currently running on a [`Segmenter`].
///
/// Cloneable, so it can be used while the segmenter itself is borrowed by
/// [`Segmenter::upload_file`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

/// Resolves once a cancelled upload has actually stopped.
#[derive(Debug)]
pub struct CancelAck(CancellationToken);

impl CancelAck {
    pub async fn wait(self) {
        self.0.cancelled().await
    }
}

impl CancelHandle {
    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_uploading(&self) -> bool {
        self.slot().is_some()
    }

    /// Asks the running upload to stop at its next chunk boundary, without
    /// waiting for it.
    pub fn request_cancel(&self) -> Result<CancelAck, UploadError> {
        let slot = self.slot();
        let in_flight = slot.as_ref().ok_or(UploadError::NotUploading)?;
        in_flight.requested.cancel();
        Ok(CancelAck(in_flight.stopped.clone()))
    }

    /// Cancels the running upload and waits until its stream is torn down.
    pub async fn cancel(&self) -> Result<(), UploadError> {
        self.request_cancel()?.wait().await;
        Ok(())
    }

    fn start(&self) -> InFlightGuard {
        let in_flight = InFlight {
            requested: CancellationToken::new(),
            stopped: CancellationToken::new(),
        };
        *self.slot() = Some(in_flight.clone());

        InFlightGuard {
            handle: self.clone(),
            in_flight,
        }
    }
}

/// Marks an upload as running for as long as it lives.
struct InFlightGuard {
    handle: CancelHandle,
    in_flight: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.handle.slot().take();
        self.in_flight.stopped.cancel();
    }
}

/// Feeds a whole file through a [`ChunkedUploader`], chunk by chunk.
#[derive(Debug)]
pub struct Segmenter<T> {
    engine: ChunkedUploader<T>,
    config: UploadConfig,
    cancel: CancelHandle,
}

impl<T: Transport> Segmenter<T> {
    /// The engine is reconfigured with the `retry_delay` of `config`.
    pub fn new(
        mut engine: ChunkedUploader<T>,
        config: UploadConfig,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        engine.set_retry_delay(config.retry_delay);

        Ok(Self {
            engine,
            config,
            cancel: CancelHandle::default(),
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn engine(&self) -> &ChunkedUploader<T> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ChunkedUploader<T> {
        &mut self.engine
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// See [`CancelHandle::cancel`].
    pub async fn cancel(&self) -> Result<(), UploadError> {
        self.cancel.cancel().await
    }

    /// Uploads all of `source` into the stream opened with
    /// [`ChunkedUploader::begin`].
    ///
    /// `on_progress` is called after every accepted chunk with the fraction of
    /// bytes uploaded so far, ending at exactly `1.0`. An empty source reports
    /// no progress.
    ///
    /// A cancellation is honored before each chunk, after the last one and
    /// between retries. The stream is then destroyed and this fails with
    /// [`UploadError::Cancelled`].
    pub async fn upload_file(
        &mut self,
        source: &dyn UploadSource,
        on_progress: &mut (dyn FnMut(f64) + Send),
    ) -> Result<(), UploadError> {
        if !self.engine.is_open() {
            return Err(UploadError::StreamNotInitialized);
        }
        let guard = self.cancel.start();
        let cancel = guard.in_flight.requested.clone();

        let total = source.len();
        let mut uploaded = 0;
        let mut chunks = pin!(chunk_stream(
            source,
            self.config.chunk_size,
            self.config.read_window
        ));

        loop {
            if cancel.is_cancelled() {
                return self.abort().await;
            }
            let Some(chunk) = chunks.next().await else {
                break;
            };
            let chunk = chunk?;
            let chunk_len = chunk.len() as u64;

            match self.engine.upload_chunk_with_cancel(chunk, &cancel).await {
                Ok(_) => {}
                Err(UploadError::Cancelled) => return self.abort().await,
                Err(err) => return Err(err),
            }

            uploaded += chunk_len;
            on_progress(uploaded as f64 / total as f64);
        }

        debug!(bytes = uploaded, "all chunks uploaded");
        drop(guard);
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), UploadError> {
        let stream_id = self.engine.stream_id().cloned();
        match self.engine.destroy().await {
            Ok(()) => info!(?stream_id, "upload cancelled"),
            Err(error) => warn!(?stream_id, %error, "upload cancelled, but the stream was not removed"),
        }
        Err(UploadError::Cancelled)
    }
}
