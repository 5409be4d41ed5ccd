use super::{FlashFamily, UniformPages, FLASH_KEY1, FLASH_KEY2};
use crate::{bus::RegisterBus, engine::Spin, geometry::Geometry, FlashError};

const FLASH: u32 = 0x4002_2000;
const KEYR: u32 = FLASH + 0x04;
const SR: u32 = FLASH + 0x0C;
const CR: u32 = FLASH + 0x10;
const AR: u32 = FLASH + 0x14;

const RCC_CR: u32 = 0x4002_1000;
const HSION: u32 = 1 << 0;
const HSIRDY: u32 = 1 << 1;

const SR_BSY: u32 = 1 << 0;
const SR_PGERR: u32 = 1 << 2;
const SR_WRPRTERR: u32 = 1 << 4;
const SR_EOP: u32 = 1 << 5;
const SR_ERRORS: u32 = SR_PGERR | SR_WRPRTERR;

const CR_PG: u32 = 1 << 0;
const CR_PER: u32 = 1 << 1;
const CR_STRT: u32 = 1 << 6;
const CR_LOCK: u32 = 1 << 7;

/// The half-word programmed controller of the STM32F0, F1 and F3.
///
/// Erase and program timing comes from the HSI oscillator, which is switched on for the
/// duration of every operation.
pub enum Stm32F0 {}

impl FlashFamily for Stm32F0 {
    const WRITE_UNIT: usize = 2;

    fn enable_oscillator<B: RegisterBus>(bus: &mut B, spin: Spin) -> Result<bool, FlashError> {
        if bus.read32(RCC_CR) & HSION != 0 {
            return Ok(true);
        }
        bus.set_bits(RCC_CR, HSION);
        if let Err(e) = spin.until(|| bus.read32(RCC_CR) & HSIRDY != 0) {
            bus.clear_bits(RCC_CR, HSION);
            return Err(e);
        }
        Ok(false)
    }

    fn restore_oscillator<B: RegisterBus>(bus: &mut B, was_running: bool) {
        if !was_running {
            bus.clear_bits(RCC_CR, HSION);
        }
    }

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

    fn start_erase<B: RegisterBus>(bus: &mut B, _geometry: &Geometry, _page: u32, address: u32) {
        bus.set_bits(CR, CR_PER);
        bus.write32(AR, address);
        bus.set_bits(CR, CR_STRT);
    }

    fn end_erase<B: RegisterBus>(bus: &mut B) {
        bus.clear_bits(CR, CR_PER);
    }

    fn begin_program<B: RegisterBus>(bus: &mut B) {
        bus.set_bits(CR, CR_PG);
    }

    fn end_program<B: RegisterBus>(bus: &mut B) {
        bus.clear_bits(CR, CR_PG);
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
                address: RCC_CR,
                value,
                ..
            } => {
                let ready = if value & HSION != 0 { HSIRDY } else { 0 };
                sim.set_reg(RCC_CR, (value & !HSIRDY) | ready);
            }
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
                if value & CR_STRT != 0 {
                    sim.set_reg(CR, value & !CR_STRT);
                    if value & CR_PER != 0 && !model::fault(sim, SR) {
                        sim.erase_at(sim.reg(AR));
                        sim.flag(SR, SR_EOP);
                    }
                }
            }
            Access::Program { address, .. } => {
                if sim.is_locked() || sim.reg(CR) & CR_PG == 0 {
                    sim.flag(SR, SR_PGERR);
                } else if !model::fault(sim, SR) {
                    sim.program(address, access.unit());
                    sim.flag(SR, SR_EOP);
                }
            }
            Access::Write { .. } => {}
        }
    }
}

impl UniformPages for Stm32F0 {}
