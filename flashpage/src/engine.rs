//! The erase and program protocol shared by all families

use core::marker::PhantomData;

use crate::{
    bus::RegisterBus,
    family::{FlashFamily, UniformPages},
    geometry::Geometry,
    Flash, FlashError,
};

/// Default number of status polls before an operation counts as stuck.
///
/// Large enough for a 128K sector erase on a fast core.
pub const DEFAULT_SPIN_LIMIT: u32 = 50_000_000;

/// A bounded busy-wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spin {
    limit: u32,
}

impl Spin {
    /// Poll at most `limit` times
    pub const fn new(limit: u32) -> Self {
        Self { limit }
    }

    /// Poll until the condition holds
    pub fn until(self, mut condition: impl FnMut() -> bool) -> Result<(), FlashError> {
        for _ in 0..self.limit {
            if condition() {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(FlashError::Timeout)
    }
}

/// Erases and programs the program memory of one device.
///
/// The engine exclusively owns the controller: every operation takes `&mut self`,
/// so two operations can never interleave.
pub struct FlashEngine<F, B> {
    bus: B,
    geometry: Geometry,
    spin: Spin,
    _family: PhantomData<F>,
}

impl<F: FlashFamily, B: RegisterBus> FlashEngine<F, B> {
    /// Create an engine for a device with the given layout
    pub fn new(bus: B, geometry: Geometry) -> Self {
        Self {
            bus,
            geometry,
            spin: Spin::new(DEFAULT_SPIN_LIMIT),
            _family: PhantomData,
        }
    }

    /// Use a different bound for the busy-waits
    pub fn with_spin_limit(mut self, limit: u32) -> Self {
        self.spin = Spin::new(limit);
        self
    }

    /// The bus the engine drives
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Mutable access to the bus the engine drives
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// The page layout of the device
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The start address of the page
    pub fn page_address(&self, page: u32) -> Option<u32> {
        self.geometry.page_address(page)
    }

    /// The size of the page in bytes
    pub fn page_size(&self, page: u32) -> Option<u32> {
        self.geometry.page_size(page)
    }

    /// The page that contains the address
    pub fn page_containing(&self, address: u32) -> Option<u32> {
        self.geometry.page_containing(address)
    }

    /// The amount of pages of program memory
    pub fn page_count(&self) -> u32 {
        self.geometry.page_count()
    }

    /// Erase exactly one page.
    ///
    /// Pages beyond the end of program memory and pages reserved for a co-processor are refused
    /// before the controller is touched.
    pub fn erase(&mut self, page: u32) -> Result<(), FlashError> {
        let count = self.geometry.page_count();
        if page >= count {
            return Err(FlashError::PageOutOfRange { page, count });
        }
        if let Some(first) = F::first_protected_page(&self.bus) {
            if page >= first {
                return Err(FlashError::Protected { page });
            }
        }
        let address = self
            .geometry
            .page_address(page)
            .ok_or(FlashError::PageOutOfRange { page, count })?;

        let spin = self.spin;
        let geometry = self.geometry;
        self.unlocked(|bus| {
            wait_idle::<F, B>(bus, spin)?;
            F::start_erase(bus, &geometry, page, address);
            let done = wait_idle::<F, B>(bus, spin);

            // Program memory changed underneath the caches
            let caches = F::disable_caches(bus);
            F::restore_caches(bus, caches);

            F::end_erase(bus);
            done
        })
    }

    /// Program `data` at `address`, one write unit at a time.
    ///
    /// The length and both the destination and the source address must be multiples of the
    /// write unit, and the range must lie within program memory. The target must be erased.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let unit = F::WRITE_UNIT;
        if data.len() % unit != 0
            || address as usize % unit != 0
            || data.as_ptr() as usize % unit != 0
        {
            return Err(FlashError::Misaligned {
                address,
                len: data.len(),
                unit,
            });
        }
        if !self.geometry.contains(address, data.len()) {
            return Err(FlashError::OutOfBounds {
                address,
                len: data.len(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let spin = self.spin;
        let caches = F::disable_caches(&mut self.bus);
        let result = self.unlocked(|bus| {
            wait_idle::<F, B>(bus, spin)?;
            F::begin_program(bus);

            let mut result = Ok(());
            for (index, chunk) in data.chunks_exact(unit).enumerate() {
                bus.program_unit(address + (index * unit) as u32, chunk);
                result = wait_idle::<F, B>(bus, spin);
                if result.is_err() {
                    break;
                }
            }

            F::end_program(bus);
            result
        });
        F::restore_caches(&mut self.bus, caches);
        result
    }

    /// Read program memory
    pub fn read(&self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        if !self.geometry.contains(address, buffer.len()) {
            return Err(FlashError::OutOfBounds {
                address,
                len: buffer.len(),
            });
        }
        self.bus.read_bytes(address, buffer);
        Ok(())
    }

    /// Run `operation` with the oscillator running and the controller unlocked.
    ///
    /// The controller is locked and the oscillator restored whatever the operation returns.
    fn unlocked<T>(
        &mut self,
        operation: impl FnOnce(&mut B) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        let oscillator = F::enable_oscillator(&mut self.bus, self.spin)?;
        F::unlock(&mut self.bus);

        let result = operation(&mut self.bus);

        F::lock(&mut self.bus);
        self.bus.sync();
        F::restore_oscillator(&mut self.bus, oscillator);
        result
    }
}

impl<F: UniformPages, B: RegisterBus> FlashEngine<F, B> {
    /// Erase the page, then program it with `data` if given.
    ///
    /// `data` must be exactly one page long.
    pub fn write_page(&mut self, page: u32, data: Option<&[u8]>) -> Result<(), FlashError> {
        let count = self.geometry.page_count();
        let (address, size) = self
            .geometry
            .page_address(page)
            .zip(self.geometry.page_size(page))
            .ok_or(FlashError::PageOutOfRange { page, count })?;

        if let Some(data) = data {
            if data.len() != size as usize {
                return Err(FlashError::PageLength {
                    expected: size as usize,
                    actual: data.len(),
                });
            }
        }

        self.erase(page)?;
        match data {
            Some(data) => self.write(address, data),
            None => Ok(()),
        }
    }
}

fn wait_idle<F: FlashFamily, B: RegisterBus>(bus: &mut B, spin: Spin) -> Result<(), FlashError> {
    spin.until(|| !F::is_busy(&*bus))?;
    match F::take_fault(bus) {
        Some(status) => Err(FlashError::Hardware { status }),
        None => Ok(()),
    }
}

impl<F: FlashFamily, B: RegisterBus> Flash for FlashEngine<F, B> {
    fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        self.erase(page)
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.write(address, data)
    }

    fn read(&self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        FlashEngine::read(self, address, buffer)
    }

    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn write_unit(&self) -> usize {
        F::WRITE_UNIT
    }

    fn erased_value(&self) -> u8 {
        F::ERASED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        family::{Stm32F0, Stm32L0, Stm32L4, Stm32Wb},
        sim::{Operation, SimBus},
        Aligned,
    };
    use pretty_assertions::assert_eq;

    const GEOMETRY: Geometry = Geometry::uniform(0x0800_0000, 2048, 64);

    fn engine<F: FlashFamily>() -> FlashEngine<F, SimBus<F>> {
        FlashEngine::new(SimBus::new(GEOMETRY), GEOMETRY).with_spin_limit(1000)
    }

    #[test]
    fn misaligned_writes_never_touch_the_controller() {
        let mut flash = engine::<Stm32L4>();
        let data = Aligned::<32>::filled(0x5A);

        for (address, len) in [(0x0800_0004, 8), (0x0800_0000, 12), (0x0800_0001, 8)] {
            assert_eq!(
                flash.write(address, &data[..len]),
                Err(FlashError::Misaligned {
                    address,
                    len,
                    unit: 8
                })
            );
        }
        // A source that is not aligned to the write unit
        assert!(matches!(
            flash.write(0x0800_0000, &data[4..12]),
            Err(FlashError::Misaligned { .. })
        ));
        assert!(flash.bus().state().log.is_empty());
    }

    #[test]
    fn writes_past_the_end_are_refused() {
        let mut flash = engine::<Stm32F0>();
        let data = Aligned::<8>::filled(0);
        let end = GEOMETRY.end() as u32;

        assert_eq!(
            flash.write(end - 4, &data[..]),
            Err(FlashError::OutOfBounds {
                address: end - 4,
                len: 8
            })
        );
        assert!(flash.bus().state().log.is_empty());
    }

    #[test]
    fn out_of_range_pages_are_refused() {
        let mut flash = engine::<Stm32F0>();
        for page in [64, 65, u32::MAX] {
            assert_eq!(
                flash.erase(page),
                Err(FlashError::PageOutOfRange { page, count: 64 })
            );
        }
        assert!(flash.bus().state().log.is_empty());
    }

    #[test]
    fn erase_then_write_programs_the_bytes() {
        let mut flash = engine::<Stm32L4>();
        let mut data = Aligned::<16>::filled(0);
        data.copy_from_slice(b"0123456789abcdef");

        flash.erase(3).unwrap();
        flash.write(0x0800_1800, &data[..]).unwrap();

        let mut readback = [0; 16];
        flash.read(0x0800_1800, &mut readback).unwrap();
        assert_eq!(&readback, b"0123456789abcdef");
        assert_eq!(
            flash.bus().state().operations,
            [
                Operation::Erase { page: 3 },
                Operation::Program {
                    address: 0x0800_1800,
                    len: 8
                },
                Operation::Program {
                    address: 0x0800_1808,
                    len: 8
                },
            ]
        );
    }

    #[test]
    fn last_page_below_the_top_of_the_address_space() {
        let top = Geometry::uniform(0xFFFF_0000, 2048, 32);
        let mut flash = FlashEngine::<Stm32L4, _>::new(SimBus::<Stm32L4>::new(top), top)
            .with_spin_limit(1000);
        let data = Aligned::<16>::filled(0x42);

        flash.erase(31).unwrap();
        flash.write(0xFFFF_FFF0, &data[..]).unwrap();

        let mut readback = [0; 16];
        flash.read(0xFFFF_FFF0, &mut readback).unwrap();
        assert_eq!(readback, [0x42; 16]);
        assert_eq!(
            flash.write(0xFFFF_FFF8, &data[..]),
            Err(FlashError::OutOfBounds {
                address: 0xFFFF_FFF8,
                len: 16
            })
        );
    }

    #[test]
    fn erased_pages_read_as_the_erased_value() {
        let mut flash = engine::<Stm32F0>();
        flash.write(0x0800_0800, &Aligned::<8>::filled(0x00)[..]).unwrap();
        flash.erase(1).unwrap();

        let mut page = [0x55; 2048];
        flash.read(0x0800_0800, &mut page).unwrap();
        assert!(page.iter().all(|byte| *byte == 0xFF));
    }

    #[test]
    fn second_write_without_erase_combines_bits() {
        let mut flash = engine::<Stm32F0>();
        flash.erase(0).unwrap();
        flash.write(0x0800_0000, &Aligned([0xF0, 0x0F])[..]).unwrap();
        flash.write(0x0800_0000, &Aligned([0x3C, 0x3C])[..]).unwrap();

        let mut readback = [0; 2];
        flash.read(0x0800_0000, &mut readback).unwrap();
        assert_eq!(readback, [0x30, 0x0C]);

        // L0 erases to zero, so programming can only set bits
        let mut flash = engine::<Stm32L0>();
        flash.erase(0).unwrap();
        flash.write(0x0800_0000, &Aligned([0xF0, 0, 0, 1])[..]).unwrap();
        flash.write(0x0800_0000, &Aligned([0x0F, 0, 0, 2])[..]).unwrap();
        flash.read(0x0800_0000, &mut readback).unwrap();
        assert_eq!(readback, [0xFF, 0]);
    }

    #[test]
    fn write_page_requires_a_full_page() {
        let mut flash = engine::<Stm32F0>();
        let page = Aligned::<2048>::filled(0xA5);

        assert_eq!(
            flash.write_page(2, Some(&page[..1024])),
            Err(FlashError::PageLength {
                expected: 2048,
                actual: 1024
            })
        );
        assert!(flash.bus().state().log.is_empty());

        flash.write_page(2, Some(&page[..])).unwrap();
        let mut readback = [0; 2048];
        flash.read(0x0800_1000, &mut readback).unwrap();
        assert_eq!(readback, page.0);

        flash.write_page(2, None).unwrap();
        flash.read(0x0800_1000, &mut readback).unwrap();
        assert!(readback.iter().all(|byte| *byte == 0xFF));
    }

    #[test]
    fn hardware_faults_still_lock_the_controller() {
        let mut flash = engine::<Stm32L4>();
        flash.bus_mut().state_mut().inject_fault(1 << 4);

        assert!(matches!(
            flash.erase(1),
            Err(FlashError::Hardware { status }) if status & (1 << 4) != 0
        ));
        assert!(flash.bus().state().operations.is_empty());
        assert!(flash.bus().state().is_locked());

        // The flags were cleared, so the next erase goes through
        flash.erase(1).unwrap();
    }

    #[test]
    fn stuck_controller_times_out_and_locks() {
        let mut flash = engine::<Stm32F0>();
        flash.bus_mut().state_mut().force_busy(true);

        assert_eq!(flash.erase(0), Err(FlashError::Timeout));
        assert!(flash.bus().state().is_locked());
        assert!(flash.bus().state().operations.is_empty());
    }

    #[test]
    fn co_processor_pages_are_never_erased() {
        let mut flash = engine::<Stm32Wb>();
        flash.bus_mut().state_mut().set_protected_from(60);

        flash.erase(59).unwrap();
        assert_eq!(flash.erase(60), Err(FlashError::Protected { page: 60 }));
        assert_eq!(flash.erase(63), Err(FlashError::Protected { page: 63 }));
        assert_eq!(
            flash.bus().state().operations,
            [Operation::Erase { page: 59 }]
        );
    }
}
