//! Size checked hand-off of payload blocks to the storage backend

use log::{debug, error, info};

/// What the validated manifest says about the payload
pub trait PayloadInfo {
    /// The total size of the image, if the manifest declares one
    fn expected_size(&self) -> Option<usize>;
}

/// Where the payload is stored
pub trait StorageBackend {
    /// Errors of the backend
    type Error: core::fmt::Debug;

    /// Prepare for an image of `size` bytes
    fn start(&mut self, size: usize) -> Result<(), Self::Error>;

    /// Store `data` at `offset` within the image
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error>;

    /// All of the image was written
    fn finish(&mut self) -> Result<(), Self::Error>;
}

/// Why the commit sink refused a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommitError<E> {
    /// The manifest doesn't declare the size of the image
    #[error("image size is unknown")]
    SizeUnknown,
    /// The block reaches past the end of the image
    #[error("block ends at {end}, beyond the {expected} byte image")]
    BeyondImage {
        /// Where the block ends
        end: usize,
        /// Declared size of the image
        expected: usize,
    },
    /// The last block doesn't end where the image does
    #[error("got {received} bytes, expected {expected}")]
    SizeMismatch {
        /// Bytes received including the last block
        received: usize,
        /// Declared size of the image
        expected: usize,
    },
    /// The storage backend failed
    #[error("storage backend failed: {0}")]
    Storage(E),
}

/// Checks every block of the payload against the declared image size before it is stored.
///
/// Only blocks that pass every check reach the backend, and the backend is finalized after the
/// last one.
pub struct CommitSink<'a, P, S> {
    payload: &'a P,
    storage: &'a mut S,
    progress: Option<u64>,
    finished: bool,
}

impl<'a, P: PayloadInfo, S: StorageBackend> CommitSink<'a, P, S> {
    /// A sink that stores the payload described by `payload` in `storage`
    pub fn new(payload: &'a P, storage: &'a mut S) -> Self {
        Self {
            payload,
            storage,
            progress: None,
            finished: false,
        }
    }

    /// Handle one block. `more` is `false` for the last block of the payload.
    pub fn block(&mut self, offset: usize, data: &[u8], more: bool) -> Result<(), CommitError<S::Error>> {
        let expected = self
            .payload
            .expected_size()
            .ok_or(CommitError::SizeUnknown)?;
        let end = offset.checked_add(data.len()).unwrap_or(usize::MAX);

        if end > expected {
            error!("Image beyond size, offset + len={}, image_size={}", end, expected);
            return Err(CommitError::BeyondImage { end, expected });
        }
        if !more && end != expected {
            error!("Incorrect size received, got {}, expected {}", end, expected);
            return Err(CommitError::SizeMismatch {
                received: end,
                expected,
            });
        }

        debug!("Writing {} bytes at pos {}", data.len(), offset);
        self.report_progress(end, expected);

        self.storage
            .write(offset, data)
            .map_err(CommitError::Storage)?;
        if !more {
            info!("Finalizing payload store");
            self.storage.finish().map_err(CommitError::Storage)?;
            self.finished = true;
        }
        Ok(())
    }

    /// Returns `true` once the last block was stored and the backend finalized
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn report_progress(&mut self, end: usize, expected: usize) {
        if expected == 0 {
            return;
        }
        let percent = (end as u64).saturating_mul(100) / expected as u64;
        // One line per ten percent is plenty
        if self.progress.map_or(true, |last| percent / 10 > last / 10) {
            debug!("Fetching firmware {:3}%", percent);
            self.progress = Some(percent);
        }
    }
}
