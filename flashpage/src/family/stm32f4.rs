use super::{acr, CacheState, FlashFamily, FLASH_KEY1, FLASH_KEY2};
use crate::{bus::RegisterBus, geometry::Geometry};

const FLASH: u32 = 0x4002_3C00;
const ACR: u32 = FLASH;
const KEYR: u32 = FLASH + 0x04;
const SR: u32 = FLASH + 0x0C;
const CR: u32 = FLASH + 0x10;

const SR_EOP: u32 = 1 << 0;
const SR_OPERR: u32 = 1 << 1;
const SR_WRPERR: u32 = 1 << 4;
const SR_PGAERR: u32 = 1 << 5;
const SR_PGPERR: u32 = 1 << 6;
const SR_PGSERR: u32 = 1 << 7;
const SR_BSY: u32 = 1 << 16;
const SR_ERRORS: u32 = SR_OPERR | SR_WRPERR | SR_PGAERR | SR_PGPERR | SR_PGSERR;

const CR_PG: u32 = 1 << 0;
const CR_SER: u32 = 1 << 1;
const CR_SNB_SHIFT: u32 = 3;
const CR_SNB: u32 = 0x1F << CR_SNB_SHIFT;
/// Sector numbers of the second bank have this bit set
const SNB_BANK2: u32 = 0x10;
const CR_PSIZE: u32 = 0b11 << 8;
const CR_PSIZE_X32: u32 = 0b10 << 8;
const CR_STRT: u32 = 1 << 16;
const CR_LOCK: u32 = 1 << 31;

/// The sector based controller of the STM32F2, F4 and F7.
///
/// Sectors are programmed a word at a time with the parallelism set to 32 bits, which is valid
/// for supply voltages from 2.7 V up. With `DUAL_BANK`, the upper half of the sectors lives
/// in the second bank.
pub enum Stm32F4x<const DUAL_BANK: bool> {}

/// Single bank STM32F4
pub type Stm32F4 = Stm32F4x<false>;
/// STM32F42x/43x in dual bank mode
pub type Stm32F4DualBank = Stm32F4x<true>;

impl<const DUAL_BANK: bool> Stm32F4x<DUAL_BANK> {
    /// The `SNB` value that selects the sector
    fn sector_number(geometry: &Geometry, sector: u32) -> u32 {
        let per_bank = geometry.page_count() / 2;
        if DUAL_BANK && sector >= per_bank {
            (sector - per_bank) | SNB_BANK2
        } else {
            sector
        }
    }
}

impl<const DUAL_BANK: bool> FlashFamily for Stm32F4x<DUAL_BANK> {
    const WRITE_UNIT: usize = 4;

    fn unlock<B: RegisterBus>(bus: &mut B) {
        if bus.read32(CR) & CR_LOCK != 0 {
            bus.write32(KEYR, FLASH_KEY1);
            bus.write32(KEYR, FLASH_KEY2);
        }
    }

    fn lock<B: RegisterBus>(bus: &mut B) {
        bus.set_bits(CR, CR_LOCK);
    }

    fn is_busy<B: RegisterBus>(bus: &B) -> bool {
        bus.read32(SR) & SR_BSY != 0
    }

    fn take_fault<B: RegisterBus>(bus: &mut B) -> Option<u32> {
        let status = bus.read32(SR);
        if status & (SR_ERRORS | SR_EOP) != 0 {
            bus.write32(SR, status & (SR_ERRORS | SR_EOP));
        }
        (status & SR_ERRORS != 0).then_some(status)
    }

    fn start_erase<B: RegisterBus>(bus: &mut B, geometry: &Geometry, page: u32, _address: u32) {
        let snb = Self::sector_number(geometry, page);
        bus.modify32(CR, |cr| {
            (cr & !(CR_SNB | CR_PSIZE)) | CR_SER | CR_PSIZE_X32 | (snb << CR_SNB_SHIFT)
        });
        bus.set_bits(CR, CR_STRT);
    }

    fn end_erase<B: RegisterBus>(bus: &mut B) {
        bus.clear_bits(CR, CR_SER | CR_SNB);
    }

    fn begin_program<B: RegisterBus>(bus: &mut B) {
        bus.modify32(CR, |cr| (cr & !CR_PSIZE) | CR_PSIZE_X32 | CR_PG);
    }

    fn end_program<B: RegisterBus>(bus: &mut B) {
        bus.clear_bits(CR, CR_PG);
    }

    fn disable_caches<B: RegisterBus>(bus: &mut B) -> CacheState {
        acr::disable(bus, ACR)
    }

    fn restore_caches<B: RegisterBus>(bus: &mut B, state: CacheState) {
        acr::restore(bus, ACR, state)
    }

    #[cfg(any(test, feature = "sim"))]
    fn sim_reset(sim: &mut crate::sim::SimState) {
        sim.set_reg(CR, CR_LOCK);
        sim.set_busy_flag(crate::sim::BusyFlag {
            address: SR,
            bit: SR_BSY,
            set_when_busy: true,
        });
    }

    #[cfg(any(test, feature = "sim"))]
    fn simulate(sim: &mut crate::sim::SimState, access: crate::sim::Access) {
        use super::model;
        use crate::sim::Access;

        match access {
            Access::Write {
                address: KEYR,
                value,
                ..
            } => model::key(sim, KEYR, value, CR, CR_LOCK),
            Access::Write {
                address: SR,
                before,
                value,
            } => model::status(sim, SR, before, value),
            Access::Write {
                address: CR,
                before,
                value,
            } => {
                let Some(value) = model::control(sim, CR, before, value, CR_LOCK) else {
                    return;
                };
                if value & CR_STRT == 0 {
                    return;
                }
                sim.set_reg(CR, value & !CR_STRT);
                if value & CR_SER == 0 || value & CR_PSIZE != CR_PSIZE_X32 {
                    sim.flag(SR, SR_PGSERR);
                } else if !model::fault(sim, SR) {
                    let snb = (value & CR_SNB) >> CR_SNB_SHIFT;
                    let sector = if DUAL_BANK && snb & SNB_BANK2 != 0 {
                        (snb & !SNB_BANK2) + sim.geometry.page_count() / 2
                    } else {
                        snb
                    };
                    sim.erase_page(sector);
                    sim.flag(SR, SR_EOP);
                }
            }
            Access::Program { address, len, .. } => {
                let cr = sim.reg(CR);
                if sim.is_locked() || cr & CR_PG == 0 {
                    sim.flag(SR, SR_WRPERR);
                } else if cr & CR_PSIZE != CR_PSIZE_X32 || len != 4 {
                    sim.flag(SR, SR_PGPERR);
                } else if !model::fault(sim, SR) {
                    sim.program(address, access.unit());
                    sim.flag(SR, SR_EOP);
                }
            }
            Access::Write { .. } => {}
        }
    }
}
