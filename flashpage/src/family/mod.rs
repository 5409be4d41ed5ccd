//! The register sequences that differ between flash controllers
//!
//! Every family implements the individual steps of the erase and program protocol.
//! The order of the steps is fixed by [crate::FlashEngine].

use crate::{bus::RegisterBus, engine::Spin, geometry::Geometry, FlashError};

mod nrf91;
mod stm32f0;
mod stm32f4;
mod stm32l0;
mod stm32l4;

pub use nrf91::Nrf91Nvmc;
pub use stm32f0::Stm32F0;
pub use stm32f4::{Stm32F4, Stm32F4DualBank, Stm32F4x};
pub use stm32l0::{Stm32L0, Stm32L0x, Stm32L1};
pub use stm32l4::{BankLayout, G4Layout, L4Layout, L5Layout, Stm32G4, Stm32L4, Stm32L4x, Stm32L5, Stm32Wb, WbLayout};

/// First key of the STM32 `KEYR` unlock sequence
pub(crate) const FLASH_KEY1: u32 = 0x4567_0123;
/// Second key of the STM32 `KEYR` unlock sequence
pub(crate) const FLASH_KEY2: u32 = 0xCDEF_89AB;

/// Which caches were enabled before an operation disabled them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheState {
    /// The instruction cache was enabled
    pub instruction: bool,
    /// The data cache was enabled
    pub data: bool,
}

/// The steps of the erase and program protocol for one family of flash controllers
pub trait FlashFamily {
    /// Size in bytes of the smallest programmable unit
    const WRITE_UNIT: usize;

    /// Value of every byte after an erase
    const ERASED: u8 = 0xFF;

    /// Turn on the oscillator the flash timing depends on.
    /// Returns whether it was already running.
    fn enable_oscillator<B: RegisterBus>(_bus: &mut B, _spin: Spin) -> Result<bool, FlashError> {
        Ok(true)
    }

    /// Turn the oscillator off again if it wasn't running before
    fn restore_oscillator<B: RegisterBus>(_bus: &mut B, _was_running: bool) {}

    /// Gain write access to the control register
    fn unlock<B: RegisterBus>(bus: &mut B);

    /// Give up write access to the control register
    fn lock<B: RegisterBus>(bus: &mut B);

    /// Returns `true` while an operation is in progress
    fn is_busy<B: RegisterBus>(bus: &B) -> bool;

    /// Returns the status register if it flags an error, and clears the flags
    fn take_fault<B: RegisterBus>(bus: &mut B) -> Option<u32>;

    /// Select erase mode and the page, then start the erase
    fn start_erase<B: RegisterBus>(bus: &mut B, geometry: &Geometry, page: u32, address: u32);

    /// Leave erase mode
    fn end_erase<B: RegisterBus>(bus: &mut B);

    /// Enter program mode
    fn begin_program<B: RegisterBus>(bus: &mut B);

    /// Leave program mode
    fn end_program<B: RegisterBus>(bus: &mut B);

    /// Disable the instruction and data caches, reporting which ones were on
    fn disable_caches<B: RegisterBus>(_bus: &mut B) -> CacheState {
        CacheState::default()
    }

    /// Reset and re-enable the caches that were on
    fn restore_caches<B: RegisterBus>(_bus: &mut B, _state: CacheState) {}

    /// The first page that belongs to a co-processor, if the device has one
    fn first_protected_page<B: RegisterBus>(_bus: &B) -> Option<u32> {
        None
    }

    /// Put the simulated controller in its reset state
    #[cfg(any(test, feature = "sim"))]
    fn sim_reset(sim: &mut crate::sim::SimState);

    /// Apply the effect of an access to the simulated controller
    #[cfg(any(test, feature = "sim"))]
    fn simulate(sim: &mut crate::sim::SimState, access: crate::sim::Access);
}

/// Families whose pages all have the same size, so a whole page can be written in one go
pub trait UniformPages: FlashFamily {}

/// Register behaviour shared by the simulated STM32 controllers
#[cfg(any(test, feature = "sim"))]
pub(crate) mod model {
    use super::{FLASH_KEY1, FLASH_KEY2};
    use crate::sim::SimState;

    /// Apply a write to a control register guarded by a lock bit.
    /// Returns the value that took effect, or `None` if the register is locked.
    pub fn control(sim: &mut SimState, address: u32, before: u32, value: u32, lock: u32) -> Option<u32> {
        if sim.is_locked() {
            // Only the lock bit itself can be written
            sim.set_reg(address, before | (value & lock));
            return None;
        }
        if value & lock != 0 {
            sim.set_locked(true);
        }
        Some(value)
    }

    /// Status flags are cleared by writing a one to them
    pub fn status(sim: &mut SimState, address: u32, before: u32, value: u32) {
        sim.set_reg(address, before & !value);
    }

    /// Feed a write to the `KEYR` register, clearing the lock bit once both keys arrived
    pub fn key(sim: &mut SimState, keyr: u32, value: u32, control: u32, lock: u32) {
        if sim.key_write(keyr, value, FLASH_KEY1, FLASH_KEY2) {
            sim.set_locked(false);
            let cr = sim.reg(control);
            sim.set_reg(control, cr & !lock);
        }
    }

    /// Raise the injected fault, if any. Returns `true` if the operation must not take effect.
    pub fn fault(sim: &mut SimState, status: u32) -> bool {
        match sim.take_fault() {
            Some(bits) => {
                sim.flag(status, bits);
                true
            }
            None => false,
        }
    }
}

/// Cache control of the STM32 `ACR` register
pub(crate) mod acr {
    use super::CacheState;
    use crate::bus::RegisterBus;

    pub const ICEN: u32 = 1 << 9;
    pub const DCEN: u32 = 1 << 10;
    pub const ICRST: u32 = 1 << 11;
    pub const DCRST: u32 = 1 << 12;

    pub fn disable<B: RegisterBus>(bus: &mut B, acr: u32) -> CacheState {
        let value = bus.read32(acr);
        let state = CacheState {
            instruction: value & ICEN != 0,
            data: value & DCEN != 0,
        };
        if state.instruction || state.data {
            bus.write32(acr, value & !(ICEN | DCEN));
        }
        state
    }

    pub fn restore<B: RegisterBus>(bus: &mut B, acr: u32, state: CacheState) {
        // A cache can only be reset while it is disabled
        if state.data {
            bus.set_bits(acr, DCRST);
            bus.clear_bits(acr, DCRST);
            bus.set_bits(acr, DCEN);
        }
        if state.instruction {
            bus.set_bits(acr, ICRST);
            bus.clear_bits(acr, ICRST);
            bus.set_bits(acr, ICEN);
        }
    }
}
