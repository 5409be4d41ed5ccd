//! Access to the flash controller registers and program memory

/// Word-level access to the flash controller and program memory.
///
/// Addresses are absolute (the controller registers and program memory share one address space).
pub trait RegisterBus {
    /// Read a 32-bit register or program memory word
    fn read32(&self, address: u32) -> u32;

    /// Write a 32-bit register
    fn write32(&mut self, address: u32, value: u32);

    /// Store one write unit (2, 4 or 8 bytes) into program memory at `address`
    fn program_unit(&mut self, address: u32, unit: &[u8]);

    /// Copy program memory into the buffer
    fn read_bytes(&self, address: u32, buffer: &mut [u8]);

    /// Make sure all preceding accesses have completed before continuing
    fn sync(&mut self) {}

    /// Read-modify-write of a register
    fn modify32(&mut self, address: u32, f: impl FnOnce(u32) -> u32) {
        let value = self.read32(address);
        self.write32(address, f(value));
    }

    /// Set the given bits of a register
    fn set_bits(&mut self, address: u32, bits: u32) {
        self.modify32(address, |value| value | bits);
    }

    /// Clear the given bits of a register
    fn clear_bits(&mut self, address: u32, bits: u32) {
        self.modify32(address, |value| value & !bits);
    }
}

/// The memory-mapped registers of the running device
pub struct Mmio {
    _private: (),
}

impl Mmio {
    /// Create the bus.
    ///
    /// # Safety
    ///
    /// The addresses used by the chosen family must be the flash controller of this device,
    /// and nothing else may use the flash controller while this bus exists.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl RegisterBus for Mmio {
    fn read32(&self, address: u32) -> u32 {
        // Register and flash addresses are word aligned and always mapped
        unsafe { (address as usize as *const u32).read_volatile() }
    }

    fn write32(&mut self, address: u32, value: u32) {
        unsafe { (address as usize as *mut u32).write_volatile(value) }
    }

    #[track_caller]
    fn program_unit(&mut self, address: u32, unit: &[u8]) {
        // The engine checked the alignment of the address, so each access has its natural alignment
        match unit.len() {
            2 => unsafe {
                (address as usize as *mut u16).write_volatile(u16::from_ne_bytes([unit[0], unit[1]]));
            },
            4 | 8 => {
                // Double words are programmed as two consecutive word writes
                for (index, word) in unit.chunks_exact(4).enumerate() {
                    let word = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]);
                    unsafe {
                        (address as usize as *mut u32)
                            .add(index)
                            .write_volatile(word);
                    }
                }
            }
            len => panic!("Write units of {} bytes are not supported", len),
        }
    }

    fn read_bytes(&self, address: u32, buffer: &mut [u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                address as usize as *const u8,
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        }
    }

    fn sync(&mut self) {
        // Synchronize the changes
        #[cfg(target_arch = "arm")]
        {
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
        }
    }
}
