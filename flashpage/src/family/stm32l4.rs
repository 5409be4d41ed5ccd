use core::marker::PhantomData;

use super::{acr, CacheState, FlashFamily, UniformPages, FLASH_KEY1, FLASH_KEY2};
use crate::{bus::RegisterBus, geometry::Geometry};

const SR_EOP: u32 = 1 << 0;
/// OPERR, PROGERR, WRPERR, PGAERR, SIZERR, PGSERR, MISERR and FASTERR
const SR_ERRORS: u32 = 0x3FA;
const SR_PGSERR: u32 = 1 << 7;
const SR_WRPERR: u32 = 1 << 4;
const SR_SIZERR: u32 = 1 << 6;
const SR_BSY: u32 = 1 << 16;

const CR_PG: u32 = 1 << 0;
const CR_PER: u32 = 1 << 1;
const CR_PNB_SHIFT: u32 = 3;
const CR_PNB: u32 = 0xFF << CR_PNB_SHIFT;
const CR_BKER: u32 = 1 << 11;
const CR_STRT: u32 = 1 << 16;
const CR_LOCK: u32 = 1 << 31;

const SFR_SFSA: u32 = 0xFF;

/// Where a member of the L4 lineage keeps its registers, and how its banks are split
pub trait BankLayout {
    /// Base address of the flash controller
    const BASE: u32;
    /// Offset of the key register
    const KEYR: u32 = 0x08;
    /// Offset of the status register
    const SR: u32 = 0x10;
    /// Offset of the control register
    const CR: u32 = 0x14;
    /// Pages in one bank
    const PAGES_PER_BANK: u32;
    /// Devices with more than [BankLayout::PAGES_PER_BANK] pages select the bank with `BKER`
    const BANKED: bool;
    /// The `ACR` register has instruction and data cache bits
    const CACHES: bool;
    /// Offset of the register holding the first page owned by the co-processor
    const SFR: Option<u32> = None;
}

/// STM32L4
pub enum L4Layout {}
/// STM32WB, which shares its flash with the radio co-processor
pub enum WbLayout {}
/// STM32G4
pub enum G4Layout {}
/// STM32L5, through its non-secure registers
pub enum L5Layout {}

impl BankLayout for L4Layout {
    const BASE: u32 = 0x4002_2000;
    const PAGES_PER_BANK: u32 = 256;
    const BANKED: bool = true;
    const CACHES: bool = true;
}

impl BankLayout for WbLayout {
    const BASE: u32 = 0x5800_4000;
    const PAGES_PER_BANK: u32 = 256;
    const BANKED: bool = false;
    const CACHES: bool = true;
    const SFR: Option<u32> = Some(0x80);
}

impl BankLayout for G4Layout {
    const BASE: u32 = 0x4002_2000;
    const PAGES_PER_BANK: u32 = 128;
    const BANKED: bool = true;
    const CACHES: bool = true;
}

impl BankLayout for L5Layout {
    const BASE: u32 = 0x4002_2000;
    const SR: u32 = 0x20;
    const CR: u32 = 0x28;
    const PAGES_PER_BANK: u32 = 128;
    const BANKED: bool = true;
    const CACHES: bool = false;
}

/// The double-word programmed controller of the STM32L4 and its successors
pub struct Stm32L4x<L>(PhantomData<L>);

/// STM32L4 family
pub type Stm32L4 = Stm32L4x<L4Layout>;
/// STM32WB family
pub type Stm32Wb = Stm32L4x<WbLayout>;
/// STM32G4 family
pub type Stm32G4 = Stm32L4x<G4Layout>;
/// STM32L5 family
pub type Stm32L5 = Stm32L4x<L5Layout>;

impl<L: BankLayout> Stm32L4x<L> {
    const ACR: u32 = L::BASE;
    const KEYR: u32 = L::BASE + L::KEYR;
    const SR: u32 = L::BASE + L::SR;
    const CR: u32 = L::BASE + L::CR;

    /// The bank select bit and the bank relative page number
    fn page_select(geometry: &Geometry, page: u32) -> (u32, u32) {
        let dual = L::BANKED && geometry.page_count() > L::PAGES_PER_BANK;
        if dual && page >= L::PAGES_PER_BANK {
            (CR_BKER, page - L::PAGES_PER_BANK)
        } else {
            (0, page)
        }
    }
}

impl<L: BankLayout> FlashFamily for Stm32L4x<L> {
    const WRITE_UNIT: usize = 8;

    fn unlock<B: RegisterBus>(bus: &mut B) {
        if bus.read32(Self::CR) & CR_LOCK != 0 {
            bus.write32(Self::KEYR, FLASH_KEY1);
            bus.write32(Self::KEYR, FLASH_KEY2);
        }
    }

    fn lock<B: RegisterBus>(bus: &mut B) {
        bus.set_bits(Self::CR, CR_LOCK);
    }

    fn is_busy<B: RegisterBus>(bus: &B) -> bool {
        bus.read32(Self::SR) & SR_BSY != 0
    }

    fn take_fault<B: RegisterBus>(bus: &mut B) -> Option<u32> {
        let status = bus.read32(Self::SR);
        if status & (SR_ERRORS | SR_EOP) != 0 {
            bus.write32(Self::SR, status & (SR_ERRORS | SR_EOP));
        }
        (status & SR_ERRORS != 0).then_some(status)
    }

    fn start_erase<B: RegisterBus>(bus: &mut B, geometry: &Geometry, page: u32, _address: u32) {
        let (bank, number) = Self::page_select(geometry, page);
        bus.modify32(Self::CR, |cr| {
            (cr & !(CR_PNB | CR_BKER)) | CR_PER | bank | (number << CR_PNB_SHIFT)
        });
        bus.set_bits(Self::CR, CR_STRT);
    }

    fn end_erase<B: RegisterBus>(bus: &mut B) {
        bus.clear_bits(Self::CR, CR_PER | CR_PNB | CR_BKER);
    }

    fn begin_program<B: RegisterBus>(bus: &mut B) {
        bus.set_bits(Self::CR, CR_PG);
    }

    fn end_program<B: RegisterBus>(bus: &mut B) {
        bus.clear_bits(Self::CR, CR_PG);
    }

    fn disable_caches<B: RegisterBus>(bus: &mut B) -> CacheState {
        if L::CACHES {
            acr::disable(bus, Self::ACR)
        } else {
            CacheState::default()
        }
    }

    fn restore_caches<B: RegisterBus>(bus: &mut B, state: CacheState) {
        if L::CACHES {
            acr::restore(bus, Self::ACR, state)
        }
    }

    fn first_protected_page<B: RegisterBus>(bus: &B) -> Option<u32> {
        L::SFR.map(|sfr| bus.read32(L::BASE + sfr) & SFR_SFSA)
    }

    #[cfg(any(test, feature = "sim"))]
    fn sim_reset(sim: &mut crate::sim::SimState) {
        sim.set_reg(Self::CR, CR_LOCK);
        sim.set_busy_flag(crate::sim::BusyFlag {
            address: Self::SR,
            bit: SR_BSY,
            set_when_busy: true,
        });
        if let Some(sfr) = L::SFR {
            // Nothing is reserved until the co-processor firmware is installed
            sim.set_reg(L::BASE + sfr, SFR_SFSA);
            sim.set_protection_register(L::BASE + sfr);
        }
    }

    #[cfg(any(test, feature = "sim"))]
    fn simulate(sim: &mut crate::sim::SimState, access: crate::sim::Access) {
        use super::model;
        use crate::sim::Access;

        match access {
            Access::Write { address, value, .. } if address == Self::KEYR => {
                model::key(sim, address, value, Self::CR, CR_LOCK)
            }
            Access::Write {
                address,
                before,
                value,
            } if address == Self::SR => model::status(sim, address, before, value),
            Access::Write {
                address,
                before,
                value,
            } if address == Self::CR => {
                let Some(value) = model::control(sim, address, before, value, CR_LOCK) else {
                    return;
                };
                if value & CR_STRT == 0 {
                    return;
                }
                sim.set_reg(address, value & !CR_STRT);
                if value & CR_PER == 0 {
                    sim.flag(Self::SR, SR_PGSERR);
                } else if !model::fault(sim, Self::SR) {
                    let mut page = (value & CR_PNB) >> CR_PNB_SHIFT;
                    if value & CR_BKER != 0 {
                        page += L::PAGES_PER_BANK;
                    }
                    sim.erase_page(page);
                    sim.flag(Self::SR, SR_EOP);
                }
            }
            Access::Program { address, len, .. } => {
                if sim.is_locked() || sim.reg(Self::CR) & CR_PG == 0 {
                    sim.flag(Self::SR, SR_WRPERR);
                } else if len != 8 {
                    sim.flag(Self::SR, SR_SIZERR);
                } else if !model::fault(sim, Self::SR) {
                    sim.program(address, access.unit());
                    sim.flag(Self::SR, SR_EOP);
                }
            }
            Access::Write { .. } => {}
        }
    }
}

impl<L: BankLayout> UniformPages for Stm32L4x<L> {}
