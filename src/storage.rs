//! A [StorageBackend] that programs the image into a region of program memory

use core::ops::Range;

use crc::{Crc, Digest, CRC_32_MPEG_2};
use flashpage::{Aligned, Flash, FlashError};
use log::{debug, error};

use crate::commit::StorageBackend;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Size of the staging buffer. A multiple of every write unit.
const STAGING_SIZE: usize = 64;

/// Errors of the flash storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The flash engine failed
    #[error("flash operation failed: {0}")]
    Flash(#[from] FlashError),
    /// The region doesn't start and end on page boundaries within program memory
    #[error("region {start:#010X}..{end:#010X} is not a range of whole pages")]
    RegionUnaligned {
        /// Start of the region
        start: u32,
        /// End of the region
        end: u32,
    },
    /// Data was written before the storage was started, or after it was finished
    #[error("storage is not accepting data")]
    NotStarted,
    /// The image doesn't fit into the region
    #[error("image of {size} bytes doesn't fit into {capacity} bytes")]
    ImageTooLarge {
        /// Size of the image
        size: usize,
        /// Size of the region
        capacity: usize,
    },
    /// The data doesn't continue where the previous write ended
    #[error("expected data at offset {expected}, got offset {offset}")]
    OutOfOrder {
        /// Where the next write must start
        expected: usize,
        /// Where it started
        offset: usize,
    },
    /// The storage was finished before the whole image arrived
    #[error("finished after {written} of {expected} bytes")]
    Incomplete {
        /// Bytes written
        written: usize,
        /// Size of the image
        expected: usize,
    },
    /// What was read back doesn't match what was written
    #[error("verification failed, crc of written data {expected:#010X}, crc of flash {actual:#010X}")]
    Verify {
        /// Checksum of the data handed to the storage
        expected: u32,
        /// Checksum of the flash contents
        actual: u32,
    },
}

/// Writes an image sequentially into a page aligned region of program memory.
///
/// Pages are erased when the image first reaches them. Data is staged so that it is always
/// programmed in whole write units, whatever the length of the blocks handed in.
pub struct FlashStorage<F> {
    flash: F,
    region: Range<u32>,
    size: usize,
    written: usize,
    programmed: usize,
    erased_until: u32,
    staged: Aligned<STAGING_SIZE>,
    staged_len: usize,
    crc: Option<Digest<'static, u32>>,
}

impl<F: Flash> FlashStorage<F> {
    /// Store images in `region`, which must consist of whole pages
    pub fn new(flash: F, region: Range<u32>) -> Result<Self, StorageError> {
        let geometry = flash.geometry();
        let unaligned = StorageError::RegionUnaligned {
            start: region.start,
            end: region.end,
        };
        let is_boundary = |address: u32| {
            address as u64 == geometry.end()
                || geometry
                    .page_containing(address)
                    .and_then(|page| geometry.page_address(page))
                    == Some(address)
        };

        if region.is_empty()
            || !geometry.contains(region.start, (region.end - region.start) as usize)
            || !is_boundary(region.start)
            || !is_boundary(region.end)
        {
            return Err(unaligned);
        }

        Ok(Self {
            erased_until: region.start,
            flash,
            region,
            size: 0,
            written: 0,
            programmed: 0,
            staged: Aligned::filled(0),
            staged_len: 0,
            crc: None,
        })
    }

    /// The region images are stored in
    pub fn region(&self) -> Range<u32> {
        self.region.clone()
    }

    /// Size of the region in bytes
    pub fn capacity(&self) -> usize {
        (self.region.end - self.region.start) as usize
    }

    /// The flash the storage writes to
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Give the flash back
    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Program the staged bytes, `len` of them, at the end of what is programmed so far
    fn flush(&mut self, len: usize) -> Result<(), StorageError> {
        let address = self.region.start + self.programmed as u32;
        self.erase_until(address + len as u32)?;
        self.flash.program(address, &self.staged[..len])?;
        self.programmed += len;
        self.staged_len = 0;
        Ok(())
    }

    /// Erase every page between the erased part of the region and `end`
    fn erase_until(&mut self, end: u32) -> Result<(), StorageError> {
        while self.erased_until < end {
            let geometry = self.flash.geometry();
            let count = geometry.page_count();
            let (page, next) = geometry
                .page_containing(self.erased_until)
                .and_then(|page| Some((page, geometry.page_range(page)?.end)))
                .ok_or(FlashError::OutOfBounds {
                    address: self.erased_until,
                    len: 1,
                })?;
            debug!("Erasing page {} of {}", page, count);
            self.flash.erase_page(page)?;
            // Whole-page regions end on a page boundary, so this never cuts a page short
            self.erased_until = next.min(self.region.end as u64) as u32;
        }
        Ok(())
    }

    fn verify(&mut self, expected: u32) -> Result<(), StorageError> {
        let mut digest = CRC32.digest();
        let mut chunk = [0; STAGING_SIZE];
        let mut offset = 0;
        while offset < self.written {
            let len = STAGING_SIZE.min(self.written - offset);
            self.flash
                .read(self.region.start + offset as u32, &mut chunk[..len])?;
            digest.update(&chunk[..len]);
            offset += len;
        }

        let actual = digest.finalize();
        if actual != expected {
            error!("Image in flash doesn't match what was written");
            return Err(StorageError::Verify { expected, actual });
        }
        Ok(())
    }
}

impl<F: Flash> StorageBackend for FlashStorage<F> {
    type Error = StorageError;

    fn start(&mut self, size: usize) -> Result<(), StorageError> {
        if size > self.capacity() {
            return Err(StorageError::ImageTooLarge {
                size,
                capacity: self.capacity(),
            });
        }
        self.size = size;
        self.written = 0;
        self.programmed = 0;
        self.erased_until = self.region.start;
        self.staged_len = 0;
        self.crc = Some(CRC32.digest());
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        if self.crc.is_none() {
            return Err(StorageError::NotStarted);
        }
        if offset != self.written {
            return Err(StorageError::OutOfOrder {
                expected: self.written,
                offset,
            });
        }
        if offset + data.len() > self.capacity() {
            return Err(StorageError::ImageTooLarge {
                size: offset + data.len(),
                capacity: self.capacity(),
            });
        }

        let mut remaining = data;
        while !remaining.is_empty() {
            let take = remaining.len().min(STAGING_SIZE - self.staged_len);
            let (head, tail) = remaining.split_at(take);
            self.staged[self.staged_len..self.staged_len + take].copy_from_slice(head);
            self.staged_len += take;
            self.written += take;
            if let Some(crc) = self.crc.as_mut() {
                crc.update(head);
            }
            if self.staged_len == STAGING_SIZE {
                self.flush(STAGING_SIZE)?;
            }
            remaining = tail;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        let crc = self.crc.take().ok_or(StorageError::NotStarted)?;
        if self.written != self.size {
            return Err(StorageError::Incomplete {
                written: self.written,
                expected: self.size,
            });
        }

        if self.staged_len > 0 {
            // Pad the tail to a whole write unit with bytes that leave the flash untouched
            let unit = self.flash.write_unit();
            let padded = self.staged_len.div_ceil(unit) * unit;
            let erased = self.flash.erased_value();
            self.staged[self.staged_len..padded].fill(erased);
            self.flush(padded)?;
        }

        self.verify(crc.finalize())
    }
}
