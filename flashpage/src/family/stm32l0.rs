use super::{FlashFamily, UniformPages};
use crate::{bus::RegisterBus, geometry::Geometry};

const PEKEY1: u32 = 0x89AB_CDEF;
const PEKEY2: u32 = 0x0203_0405;
const PRGKEY1: u32 = 0x8C9D_AEBF;
const PRGKEY2: u32 = 0x1314_1516;

const PECR_PELOCK: u32 = 1 << 0;
const PECR_PRGLOCK: u32 = 1 << 1;
const PECR_PROG: u32 = 1 << 3;
const PECR_ERASE: u32 = 1 << 9;

const SR_BSY: u32 = 1 << 0;
const SR_EOP: u32 = 1 << 1;
const SR_WRPERR: u32 = 1 << 8;
const SR_PGAERR: u32 = 1 << 9;
const SR_SIZERR: u32 = 1 << 10;
const SR_ERRORS: u32 = SR_WRPERR | SR_PGAERR | SR_SIZERR;

/// The word programmed controller of the STM32L0 and L1, with its controller at `BASE`.
///
/// Program memory sits behind two locks: `PELOCK` guards the `PECR` register and
/// `PRGLOCK` guards program memory itself. Erased memory reads as zero.
pub enum Stm32L0x<const BASE: u32> {}

/// STM32L0 family
pub type Stm32L0 = Stm32L0x<0x4002_2000>;
/// STM32L1 family
pub type Stm32L1 = Stm32L0x<0x4002_3C00>;

impl<const BASE: u32> Stm32L0x<BASE> {
    const PECR: u32 = BASE + 0x04;
    const PEKEYR: u32 = BASE + 0x0C;
    const PRGKEYR: u32 = BASE + 0x10;
    const SR: u32 = BASE + 0x18;
}

impl<const BASE: u32> FlashFamily for Stm32L0x<BASE> {
    const WRITE_UNIT: usize = 4;
    const ERASED: u8 = 0x00;

    fn unlock<B: RegisterBus>(bus: &mut B) {
        if bus.read32(Self::PECR) & PECR_PELOCK != 0 {
            bus.write32(Self::PEKEYR, PEKEY1);
            bus.write32(Self::PEKEYR, PEKEY2);
        }
        if bus.read32(Self::PECR) & PECR_PRGLOCK != 0 {
            bus.write32(Self::PRGKEYR, PRGKEY1);
            bus.write32(Self::PRGKEYR, PRGKEY2);
        }
    }

    fn lock<B: RegisterBus>(bus: &mut B) {
        // Setting PELOCK sets PRGLOCK as well
        bus.set_bits(Self::PECR, PECR_PELOCK);
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

    fn start_erase<B: RegisterBus>(bus: &mut B, _geometry: &Geometry, _page: u32, address: u32) {
        bus.set_bits(Self::PECR, PECR_ERASE | PECR_PROG);
        // Writing any word of the page starts the erase
        bus.program_unit(address, &[0; 4]);
    }

    fn end_erase<B: RegisterBus>(bus: &mut B) {
        bus.clear_bits(Self::PECR, PECR_ERASE | PECR_PROG);
    }

    fn begin_program<B: RegisterBus>(_bus: &mut B) {}

    fn end_program<B: RegisterBus>(_bus: &mut B) {}

    #[cfg(any(test, feature = "sim"))]
    fn sim_reset(sim: &mut crate::sim::SimState) {
        sim.set_reg(Self::PECR, PECR_PELOCK | PECR_PRGLOCK);
        sim.set_busy_flag(crate::sim::BusyFlag {
            address: Self::SR,
            bit: SR_BSY,
            set_when_busy: true,
        });
    }

    #[cfg(any(test, feature = "sim"))]
    fn simulate(sim: &mut crate::sim::SimState, access: crate::sim::Access) {
        use super::model;
        use crate::sim::Access;

        match access {
            Access::Write { address, value, .. } if address == Self::PEKEYR => {
                if sim.key_write(address, value, PEKEY1, PEKEY2) {
                    sim.set_locked(false);
                    let pecr = sim.reg(Self::PECR);
                    sim.set_reg(Self::PECR, pecr & !PECR_PELOCK);
                }
            }
            Access::Write { address, value, .. } if address == Self::PRGKEYR => {
                let pecr = sim.reg(Self::PECR);
                if pecr & PECR_PELOCK == 0 && sim.key_write(address, value, PRGKEY1, PRGKEY2) {
                    sim.set_reg(Self::PECR, pecr & !PECR_PRGLOCK);
                }
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
            } if address == Self::PECR => {
                let Some(value) = model::control(sim, address, before, value, PECR_PELOCK) else {
                    return;
                };
                // The lock bits can only be cleared by their keys
                let mut value = value | (before & PECR_PRGLOCK);
                if value & PECR_PELOCK != 0 {
                    value |= PECR_PRGLOCK;
                }
                sim.set_reg(address, value);
            }
            Access::Program { address, .. } => {
                let pecr = sim.reg(Self::PECR);
                if pecr & (PECR_PELOCK | PECR_PRGLOCK) != 0 {
                    sim.flag(Self::SR, SR_WRPERR);
                } else if !model::fault(sim, Self::SR) {
                    if pecr & (PECR_ERASE | PECR_PROG) == PECR_ERASE | PECR_PROG {
                        sim.erase_at(address);
                    } else {
                        sim.program(address, access.unit());
                    }
                    sim.flag(Self::SR, SR_EOP);
                }
            }
            Access::Write { .. } => {}
        }
    }
}

impl<const BASE: u32> UniformPages for Stm32L0x<BASE> {}
