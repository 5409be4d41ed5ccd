#![doc = include_str!("../README.md")]
#![no_std]
#![warn(missing_docs)]

#[cfg(any(test, feature = "sim"))]
extern crate std;

pub mod bus;
mod engine;
pub mod family;
pub mod geometry;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use bus::{Mmio, RegisterBus};
pub use engine::{FlashEngine, Spin, DEFAULT_SPIN_LIMIT};
pub use family::{FlashFamily, UniformPages};
pub use geometry::Geometry;

/// Errors reported by the flash engine.
///
/// Everything except [FlashError::Hardware] and [FlashError::Timeout] is detected
/// before the controller is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlashError {
    /// The page index does not exist on this device
    #[error("page {page} is outside the {count} pages of program memory")]
    PageOutOfRange {
        /// The requested page
        page: u32,
        /// Number of pages of the device
        count: u32,
    },
    /// The page belongs to the co-processor and must never be erased
    #[error("page {page} is reserved for the co-processor")]
    Protected {
        /// The requested page
        page: u32,
    },
    /// Length, destination or source is not a multiple of the write unit
    #[error("{len} bytes at {address:#010X} are not aligned to the {unit} byte write unit")]
    Misaligned {
        /// Destination address
        address: u32,
        /// Requested length
        len: usize,
        /// Write unit of the family
        unit: usize,
    },
    /// The range does not lie within program memory
    #[error("{len} bytes at {address:#010X} lie outside program memory")]
    OutOfBounds {
        /// Start address
        address: u32,
        /// Requested length
        len: usize,
    },
    /// A page write was handed a buffer that is not exactly one page
    #[error("page writes take exactly {expected} bytes, got {actual}")]
    PageLength {
        /// Size of the page
        expected: usize,
        /// Length of the buffer
        actual: usize,
    },
    /// The controller flagged an error after the operation
    #[error("flash controller reported a fault, status {status:#010X}")]
    Hardware {
        /// Raw status register value
        status: u32,
    },
    /// The controller did not finish within the spin limit
    #[error("flash controller stayed busy")]
    Timeout,
}

/// A trait defining the common flash operations
pub trait Flash {
    /// Erase the page with the given index
    fn erase_page(&mut self, page: u32) -> Result<(), FlashError>;

    /// Program the data at the given address.
    /// The target must have been erased; programming can only move bits away from the erased value.
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Read the flash at the given address into the buffer
    fn read(&self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError>;

    /// The page layout of the device
    fn geometry(&self) -> &Geometry;

    /// The smallest amount of bytes that can be programmed at once
    fn write_unit(&self) -> usize;

    /// The value every byte has after an erase
    fn erased_value(&self) -> u8;
}

/// A buffer aligned to the largest write unit, so it can be handed to [Flash::program] directly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct Aligned<const N: usize>(pub [u8; N]);

impl<const N: usize> Aligned<N> {
    /// A buffer with every byte set to `value`
    pub const fn filled(value: u8) -> Self {
        Self([value; N])
    }
}

impl<const N: usize> core::ops::Deref for Aligned<N> {
    type Target = [u8; N];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> core::ops::DerefMut for Aligned<N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
