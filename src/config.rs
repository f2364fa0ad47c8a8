use std::time::Duration;

use crate::error::UploadError;

const MEG: u64 = 1024 * 1024;

pub const DEFAULT_CHUNK_SIZE: u64 = 2 * MEG;
pub const DEFAULT_READ_WINDOW: u64 = 32 * MEG;

/// How a file is sliced and how failed chunk uploads are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Size of each uploaded chunk. Only the final chunk of a file may be shorter.
    pub chunk_size: u64,
    /// How much of the file is read into memory at once.
    ///
    /// Has to be a multiple of `chunk_size`.
    pub read_window: u64,
    /// Pause between two attempts of the same chunk. Zero retries immediately.
    pub retry_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_window: DEFAULT_READ_WINDOW,
            retry_delay: Duration::ZERO,
        }
    }
}

impl UploadConfig {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_read_window(mut self, read_window: u64) -> Self {
        self.read_window = read_window;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidConfig(
                "chunk size must be positive".into(),
            ));
        }
        if self.read_window < self.chunk_size || self.read_window % self.chunk_size != 0 {
            return Err(UploadError::InvalidConfig(format!(
                "read window ({}) must be a multiple of the chunk size ({})",
                self.read_window, self.chunk_size
            )));
        }
        if usize::try_from(self.read_window).is_err() {
            return Err(UploadError::InvalidConfig(format!(
                "read window ({}) does not fit in memory",
                self.read_window
            )));
        }
        Ok(())
    }
}
