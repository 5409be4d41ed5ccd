use super::{FlashFamily, UniformPages};
use crate::{bus::RegisterBus, geometry::Geometry};

const NVMC: u32 = 0x5003_9000;
const READY: u32 = NVMC + 0x400;
const CONFIG: u32 = NVMC + 0x504;

const READY_READY: u32 = 1 << 0;

/// Read only
const CONFIG_REN: u32 = 0;
/// Write enabled
const CONFIG_WEN: u32 = 1;
/// Erase enabled
const CONFIG_EEN: u32 = 2;

/// The NVMC of the nRF9160.
///
/// There are no keys: the `CONFIG` register is the lock, and read-only mode is the locked state.
pub enum Nrf91Nvmc {}

impl Nrf91Nvmc {
    /// The 1 MiB of program memory in 4K pages
    pub const GEOMETRY: Geometry = Geometry::uniform(0, 0x1000, 256);
}

impl FlashFamily for Nrf91Nvmc {
    const WRITE_UNIT: usize = 4;

    fn unlock<B: RegisterBus>(_bus: &mut B) {}

    fn lock<B: RegisterBus>(bus: &mut B) {
        // Set the flash to default readonly mode
        bus.write32(CONFIG, CONFIG_REN);
    }

    fn is_busy<B: RegisterBus>(bus: &B) -> bool {
        bus.read32(READY) & READY_READY == 0
    }

    fn take_fault<B: RegisterBus>(_bus: &mut B) -> Option<u32> {
        None
    }

    fn start_erase<B: RegisterBus>(bus: &mut B, _geometry: &Geometry, _page: u32, address: u32) {
        // Enable the erase functionality of the flash
        bus.write32(CONFIG, CONFIG_EEN);
        // Start the erase process by writing a u32 word containing all 1's to the first word of the page
        bus.program_unit(address, &[0xFF; 4]);
    }

    fn end_erase<B: RegisterBus>(bus: &mut B) {
        bus.write32(CONFIG, CONFIG_REN);
    }

    fn begin_program<B: RegisterBus>(bus: &mut B) {
        bus.write32(CONFIG, CONFIG_WEN);
    }

    fn end_program<B: RegisterBus>(bus: &mut B) {
        bus.write32(CONFIG, CONFIG_REN);
    }

    #[cfg(any(test, feature = "sim"))]
    fn sim_reset(sim: &mut crate::sim::SimState) {
        sim.set_reg(READY, READY_READY);
        sim.set_busy_flag(crate::sim::BusyFlag {
            address: READY,
            bit: READY_READY,
            set_when_busy: false,
        });
    }

    #[cfg(any(test, feature = "sim"))]
    fn simulate(sim: &mut crate::sim::SimState, access: crate::sim::Access) {
        use crate::sim::Access;

        match access {
            Access::Write {
                address: CONFIG,
                value,
                ..
            } => sim.set_locked(value == CONFIG_REN),
            Access::Program { address, .. } => match sim.reg(CONFIG) {
                CONFIG_EEN => sim.erase_at(address),
                CONFIG_WEN => sim.program(address, access.unit()),
                // Writes in read only mode are ignored
                _ => {}
            },
            Access::Write { .. } => {}
        }
    }
}

impl UniformPages for Nrf91Nvmc {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sim::{Access, Operation, SimBus},
        Aligned, FlashEngine, FlashError,
    };
    use pretty_assertions::assert_eq;

    fn engine() -> FlashEngine<Nrf91Nvmc, SimBus<Nrf91Nvmc>> {
        FlashEngine::new(SimBus::new(Nrf91Nvmc::GEOMETRY), Nrf91Nvmc::GEOMETRY)
            .with_spin_limit(100)
    }

    fn config_writes(flash: &FlashEngine<Nrf91Nvmc, SimBus<Nrf91Nvmc>>) -> std::vec::Vec<u32> {
        flash
            .bus()
            .state()
            .log
            .iter()
            .filter_map(|access| match access {
                Access::Write {
                    address: CONFIG,
                    value,
                    ..
                } => Some(*value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn page_write_erases_then_programs() {
        let mut flash = engine();
        let mut page = Aligned::<0x1000>::filled(0);
        page.iter_mut()
            .enumerate()
            .for_each(|(i, byte)| *byte = i as u8);

        flash.write_page(0x10, Some(&page[..])).unwrap();

        assert_eq!(
            config_writes(&flash),
            [
                CONFIG_EEN, CONFIG_REN, CONFIG_REN, CONFIG_WEN, CONFIG_REN, CONFIG_REN
            ]
        );
        let mut readback = [0; 0x1000];
        flash.read(0x0001_0000, &mut readback).unwrap();
        assert_eq!(readback, page.0);
        assert_eq!(
            flash.bus().state().operations[0],
            Operation::Erase { page: 0x10 }
        );
        assert!(flash.bus().state().is_locked());
    }

    #[test]
    fn pages_must_be_in_flash() {
        let mut flash = engine();
        assert_eq!(
            flash.erase(256),
            Err(FlashError::PageOutOfRange {
                page: 256,
                count: 256
            })
        );
        assert_eq!(
            flash.write(0x000F_FFFC, &Aligned([0; 8])[..]),
            Err(FlashError::OutOfBounds {
                address: 0x000F_FFFC,
                len: 8
            })
        );
    }

    #[test]
    fn waits_for_ready() {
        let mut flash = engine();
        flash.bus_mut().state_mut().force_busy(true);
        assert_eq!(flash.erase(1), Err(FlashError::Timeout));
        assert!(flash.bus().state().is_locked());
        assert!(flash.bus().state().operations.is_empty());
    }
}
