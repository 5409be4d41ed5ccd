//! Blockwise reads of a resource on the storage

use crate::url::fatfs_path;

/// Errors of the byte source
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// There is no file at the path
    #[error("no such file")]
    NotFound,
    /// The filesystem driver reported an error code
    #[error("filesystem error {0}")]
    Io(i32),
    /// The file returned fewer bytes than its size promised
    #[error("file ended early")]
    UnexpectedEnd,
}

/// An open file on the storage
pub trait SourceFile {
    /// The size of the file in bytes, as known when it was opened
    fn size(&self) -> usize;

    /// Read from `offset` into the buffer, returning the amount of bytes read
    fn read_at(&mut self, offset: usize, buffer: &mut [u8]) -> Result<usize, SourceError>;

    /// Close the file
    fn close(self) -> Result<(), SourceError>;
}

/// The filesystem the resources are read from
pub trait ByteSource {
    /// Files of this filesystem
    type File: SourceFile;

    /// Open the file at `path` for reading
    fn open(&mut self, path: &str) -> Result<Self::File, SourceError>;
}

/// Errors of a blockwise fetch. `E` is the error of the block consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FetchError<E> {
    /// The identifier doesn't start with `fatfs://`
    #[error("resource identifier doesn't start with \"fatfs://\"")]
    UnsupportedScheme,
    /// The block size is zero or larger than the block buffer
    #[error("block size {requested} is not within 1..={max}")]
    BlockSize {
        /// The requested block size
        requested: usize,
        /// Size of the block buffer
        max: usize,
    },
    /// The resource could not be opened
    #[error("could not open resource: {0}")]
    Open(SourceError),
    /// Reading a block failed
    #[error("could not read block at {offset}")]
    Read {
        /// Offset of the block
        offset: usize,
        /// What went wrong
        source: SourceError,
    },
    /// The consumer rejected a block
    #[error("block at {offset} was rejected: {reason}")]
    Rejected {
        /// Offset of the block
        offset: usize,
        /// Why the consumer rejected it
        reason: E,
    },
    /// All blocks were delivered, but closing the resource failed
    #[error("could not close resource: {0}")]
    Close(SourceError),
}

/// How far a transfer has come
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCursor {
    offset: usize,
    size: usize,
}

impl TransferCursor {
    /// A transfer of `size` bytes that hasn't started yet
    pub fn new(size: usize) -> Self {
        Self { offset: 0, size }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the resource
    pub fn size(&self) -> usize {
        self.size
    }

    /// The amount of blocks a transfer of this size takes
    pub fn block_count(&self, block_size: usize) -> usize {
        self.size.div_ceil(block_size)
    }

    /// The offset and length of the next block, or `None` when the transfer is complete
    pub fn next_block(&self, block_size: usize) -> Option<(usize, usize)> {
        (self.offset < self.size).then(|| (self.offset, block_size.min(self.size - self.offset)))
    }

    /// Mark `len` more bytes as consumed
    pub fn advance(&mut self, len: usize) {
        self.offset = (self.offset + len).min(self.size);
    }

    /// Returns `true` if no bytes follow after the consumed ones
    pub fn is_complete(&self) -> bool {
        self.offset >= self.size
    }
}

/// Reads resources of a [ByteSource] in blocks of at most `BLOCK` bytes
pub struct Fetcher<S, const BLOCK: usize> {
    source: S,
    buffer: [u8; BLOCK],
}

impl<S: ByteSource, const BLOCK: usize> Fetcher<S, BLOCK> {
    /// Create a fetcher that reads from the source
    pub fn new(source: S) -> Self {
        Self {
            source,
            buffer: [0; BLOCK],
        }
    }

    /// The byte source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable access to the byte source
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Read the resource behind `url` in blocks of `block_size` bytes.
    ///
    /// `callback` gets the offset of every block, its bytes, and whether more blocks follow.
    /// The first error ends the transfer. The resource is closed on every path, but a failing
    /// close is only reported when all blocks went through.
    pub fn fetch<E>(
        &mut self,
        url: &str,
        block_size: usize,
        mut callback: impl FnMut(usize, &[u8], bool) -> Result<(), E>,
    ) -> Result<(), FetchError<E>> {
        let path = fatfs_path(url).ok_or(FetchError::UnsupportedScheme)?;
        if block_size == 0 || block_size > BLOCK {
            return Err(FetchError::BlockSize {
                requested: block_size,
                max: BLOCK,
            });
        }

        let mut file = self.source.open(path).map_err(FetchError::Open)?;
        let result = Self::transfer(&mut file, &mut self.buffer[..block_size], &mut callback);
        let closed = file.close();

        result?;
        closed.map_err(FetchError::Close)
    }

    fn transfer<E>(
        file: &mut S::File,
        buffer: &mut [u8],
        callback: &mut impl FnMut(usize, &[u8], bool) -> Result<(), E>,
    ) -> Result<(), FetchError<E>> {
        let mut cursor = TransferCursor::new(file.size());

        while let Some((offset, len)) = cursor.next_block(buffer.len()) {
            let block = &mut buffer[..len];
            let read = file
                .read_at(offset, block)
                .map_err(|source| FetchError::Read { offset, source })?;
            if read < len {
                return Err(FetchError::Read {
                    offset,
                    source: SourceError::UnexpectedEnd,
                });
            }

            cursor.advance(len);
            callback(offset, block, !cursor.is_complete())
                .map_err(|reason| FetchError::Rejected { offset, reason })?;
        }

        Ok(())
    }

    /// Read the whole resource behind `url` into `destination`, returning its size
    pub fn fetch_into_buffer(
        &mut self,
        url: &str,
        block_size: usize,
        destination: &mut [u8],
    ) -> Result<usize, FetchError<BufferError>> {
        let mut fill = BufferFill::new(destination);
        self.fetch(url, block_size, |offset, block, _more| fill.block(offset, block))?;
        Ok(fill.filled())
    }
}

/// Collects contiguous blocks into a buffer
pub struct BufferFill<'a> {
    destination: &'a mut [u8],
    filled: usize,
}

impl<'a> BufferFill<'a> {
    /// An empty fill of `destination`
    pub fn new(destination: &'a mut [u8]) -> Self {
        Self {
            destination,
            filled: 0,
        }
    }

    /// Append a block that starts at `offset` within the resource.
    ///
    /// A refused block leaves the buffer untouched.
    pub fn block(&mut self, offset: usize, block: &[u8]) -> Result<(), BufferError> {
        if offset != self.filled {
            return Err(BufferError::OutOfOrder {
                expected: self.filled,
                offset,
            });
        }
        let capacity = self.destination.len();
        let target = self
            .destination
            .get_mut(self.filled..self.filled + block.len())
            .ok_or(BufferError::Overflow { capacity })?;
        target.copy_from_slice(block);
        self.filled += block.len();
        Ok(())
    }

    /// Bytes collected so far
    pub fn filled(&self) -> usize {
        self.filled
    }
}

/// Why [BufferFill] refused a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The block doesn't continue where the previous one ended
    #[error("expected a block at {expected}, got one at {offset}")]
    OutOfOrder {
        /// Where the next block must start
        expected: usize,
        /// Where it started
        offset: usize,
    },
    /// The resource doesn't fit into the buffer
    #[error("resource is larger than the {capacity} byte buffer")]
    Overflow {
        /// Size of the buffer
        capacity: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{image, MemorySource};
    use pretty_assertions::assert_eq;
    use std::vec::Vec;

    fn collect(
        fetcher: &mut Fetcher<MemorySource, 512>,
        url: &str,
        block_size: usize,
    ) -> Result<Vec<(usize, usize, bool)>, FetchError<()>> {
        let mut blocks = Vec::new();
        fetcher.fetch(url, block_size, |offset, block, more| {
            blocks.push((offset, block.len(), more));
            Ok(())
        })?;
        Ok(blocks)
    }

    #[test]
    fn blocks_cover_the_resource() {
        let data = image(1000);
        let mut fetcher = Fetcher::<_, 512>::new(MemorySource::new().with("fw.bin", &data));

        assert_eq!(
            collect(&mut fetcher, "fatfs://fw.bin", 512),
            Ok(std::vec![(0, 512, true), (512, 488, false)])
        );
        assert_eq!(
            collect(&mut fetcher, "fatfs://fw.bin", 100).unwrap().len(),
            10
        );
        assert_eq!(
            collect(&mut fetcher, "fatfs://fw.bin", 100).unwrap().last(),
            Some(&(900, 100, false))
        );
        let events = fetcher.source().events.borrow();
        assert_eq!((events.opened, events.closed), (3, 3));
    }

    #[test]
    fn blocks_carry_the_file_contents() {
        let data = image(1300);
        let mut fetcher = Fetcher::<_, 512>::new(MemorySource::new().with("fw.bin", &data));
        let mut copy = Vec::new();

        fetcher
            .fetch("fatfs://fw.bin", 512, |offset, block, _| {
                assert_eq!(offset, copy.len());
                copy.extend_from_slice(block);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(copy, data);
    }

    #[test]
    fn empty_resources_give_no_blocks() {
        let mut fetcher = Fetcher::<_, 512>::new(MemorySource::new().with("empty", &[]));
        assert_eq!(collect(&mut fetcher, "fatfs://empty", 512), Ok(Vec::new()));
        assert_eq!(fetcher.source().events.borrow().closed, 1);
    }

    #[test]
    fn other_schemes_are_refused_before_opening() {
        let mut fetcher = Fetcher::<_, 512>::new(MemorySource::new().with("fw.bin", &[1]));
        assert_eq!(
            collect(&mut fetcher, "coap://fw.bin", 512),
            Err(FetchError::UnsupportedScheme)
        );
        assert_eq!(
            collect(&mut fetcher, "fw.bin", 512),
            Err(FetchError::UnsupportedScheme)
        );
        assert_eq!(fetcher.source().events.borrow().opened, 0);
    }

    #[test]
    fn block_size_must_fit_the_buffer() {
        let mut fetcher = Fetcher::<_, 512>::new(MemorySource::new().with("fw.bin", &[1]));
        for requested in [0, 513] {
            assert_eq!(
                collect(&mut fetcher, "fatfs://fw.bin", requested),
                Err(FetchError::BlockSize {
                    requested,
                    max: 512
                })
            );
        }
    }

    #[test]
    fn missing_files_fail_to_open() {
        let mut fetcher = Fetcher::<_, 512>::new(MemorySource::new());
        assert_eq!(
            collect(&mut fetcher, "fatfs://nothing", 512),
            Err(FetchError::Open(SourceError::NotFound))
        );
    }

    #[test]
    fn a_rejected_block_stops_the_transfer() {
        let data = image(2048);
        let mut fetcher = Fetcher::<_, 512>::new(MemorySource::new().with("fw.bin", &data));
        let mut seen = Vec::new();

        let result = fetcher.fetch("fatfs://fw.bin", 512, |offset, _, _| {
            seen.push(offset);
            if offset == 1024 {
                Err("no space")
            } else {
                Ok(())
            }
        });

        assert_eq!(
            result,
            Err(FetchError::Rejected {
                offset: 1024,
                reason: "no space"
            })
        );
        assert_eq!(seen, [0, 512, 1024]);
        assert_eq!(fetcher.source().events.borrow().closed, 1);
    }

    #[test]
    fn read_errors_close_the_file() {
        let data = image(1500);
        let mut source = MemorySource::new().with("fw.bin", &data);
        source.fail_read_at = Some(1024);
        // A failing close doesn't hide the read error
        source.fail_close = true;
        let mut fetcher = Fetcher::<_, 512>::new(source);

        assert_eq!(
            collect(&mut fetcher, "fatfs://fw.bin", 512),
            Err(FetchError::Read {
                offset: 1024,
                source: SourceError::Io(-5)
            })
        );
        assert_eq!(fetcher.source().events.borrow().closed, 1);
    }

    #[test]
    fn close_errors_are_reported_after_a_full_transfer() {
        let mut source = MemorySource::new().with("fw.bin", &[1, 2, 3]);
        source.fail_close = true;
        let mut fetcher = Fetcher::<_, 512>::new(source);

        assert_eq!(
            collect(&mut fetcher, "fatfs://fw.bin", 512),
            Err(FetchError::Close(SourceError::Io(-1)))
        );
    }

    #[test]
    fn buffer_fetch_returns_the_size() {
        let data = image(600);
        let mut fetcher = Fetcher::<_, 512>::new(MemorySource::new().with("manifest", &data));
        let mut buffer = [0; 640];

        assert_eq!(
            fetcher.fetch_into_buffer("fatfs://manifest", 256, &mut buffer),
            Ok(600)
        );
        assert_eq!(&buffer[..600], &data[..]);
        assert!(buffer[600..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn buffer_fetch_refuses_to_overflow() {
        let data = image(700);
        let mut fetcher = Fetcher::<_, 512>::new(MemorySource::new().with("manifest", &data));
        let mut buffer = [0; 640];

        assert_eq!(
            fetcher.fetch_into_buffer("fatfs://manifest", 512, &mut buffer),
            Err(FetchError::Rejected {
                offset: 512,
                reason: BufferError::Overflow { capacity: 640 }
            })
        );
        // The first block was copied, the second one wasn't
        assert_eq!(&buffer[..512], &data[..512]);
        assert!(buffer[512..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn buffer_fill_refuses_gaps_and_repeats() {
        let mut buffer = [0; 16];
        let mut fill = BufferFill::new(&mut buffer);

        fill.block(0, &[1; 4]).unwrap();
        assert_eq!(
            fill.block(8, &[2; 4]),
            Err(BufferError::OutOfOrder {
                expected: 4,
                offset: 8
            })
        );
        assert_eq!(
            fill.block(0, &[3; 4]),
            Err(BufferError::OutOfOrder {
                expected: 4,
                offset: 0
            })
        );
        fill.block(4, &[4; 4]).unwrap();
        assert_eq!(fill.filled(), 8);
        assert_eq!(buffer, [1, 1, 1, 1, 4, 4, 4, 4, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn cursor_tracks_the_transfer() {
        let mut cursor = TransferCursor::new(1000);
        assert_eq!(cursor.block_count(512), 2);
        assert_eq!(cursor.next_block(512), Some((0, 512)));
        cursor.advance(512);
        assert_eq!(cursor.next_block(512), Some((512, 488)));
        cursor.advance(488);
        assert!(cursor.is_complete());
        assert_eq!(cursor.next_block(512), None);
        cursor.advance(512);
        assert_eq!(cursor.offset(), cursor.size());

        assert_eq!(TransferCursor::new(0).block_count(512), 0);
        assert_eq!(TransferCursor::new(1024).block_count(512), 2);
    }
}
