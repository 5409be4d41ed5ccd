//! A host model of the flash controller and program memory
//!
//! [SimBus] keeps the register file and the contents of program memory in RAM.
//! Every access is logged, and the family decides what effect it has,
//! so an erase only happens when the register sequence would trigger one on the real device.

use core::marker::PhantomData;
use std::{collections::BTreeMap, vec, vec::Vec};

use crate::{bus::RegisterBus, family::FlashFamily, geometry::Geometry};

/// One access to the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// A register write, with the register value before the write
    Write {
        /// Register address
        address: u32,
        /// Value before the write
        before: u32,
        /// Written value
        value: u32,
    },
    /// A write unit stored into program memory
    Program {
        /// Destination address
        address: u32,
        /// The unit, only the first `len` bytes are used
        unit: [u8; 8],
        /// Size of the unit
        len: usize,
    },
}

impl Access {
    /// The bytes of a program access
    pub fn unit(&self) -> &[u8] {
        match self {
            Access::Program { unit, len, .. } => &unit[..*len],
            Access::Write { .. } => &[],
        }
    }
}

/// An effect on program memory that actually took place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// A page was erased
    Erase {
        /// Index of the page
        page: u32,
    },
    /// Bytes were programmed
    Program {
        /// Destination address
        address: u32,
        /// Amount of bytes
        len: usize,
    },
}

/// The busy flag of a family's status register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyFlag {
    /// Address of the status register
    pub address: u32,
    /// The flag bit
    pub bit: u32,
    /// `true` if the bit is set while busy, `false` if it is set while ready
    pub set_when_busy: bool,
}

/// State of the simulated controller
pub struct SimState {
    /// The layout of program memory
    pub geometry: Geometry,
    /// Every access, in order
    pub log: Vec<Access>,
    /// Every erase and program that changed program memory, in order
    pub operations: Vec<Operation>,
    registers: BTreeMap<u32, u32>,
    memory: Vec<u8>,
    erased: u8,
    key_stages: BTreeMap<u32, u8>,
    locked: bool,
    fault: Option<u32>,
    busy: Option<BusyFlag>,
    force_busy: bool,
    protection: Option<u32>,
}

impl SimState {
    fn new(geometry: Geometry, erased: u8) -> Self {
        Self {
            geometry,
            log: Vec::new(),
            operations: Vec::new(),
            registers: BTreeMap::new(),
            memory: vec![erased; geometry.total_size() as usize],
            erased,
            key_stages: BTreeMap::new(),
            locked: true,
            fault: None,
            busy: None,
            force_busy: false,
            protection: None,
        }
    }

    /// The current value of a register
    pub fn reg(&self, address: u32) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    /// Overwrite a register without logging
    pub fn set_reg(&mut self, address: u32, value: u32) {
        self.registers.insert(address, value);
    }

    /// Set bits in a register without logging
    pub fn flag(&mut self, address: u32, bits: u32) {
        let value = self.reg(address);
        self.set_reg(address, value | bits);
    }

    /// The contents of program memory
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Returns `true` if the control register is locked
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Record whether the control register is locked
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// Make the next triggered operation fail with these status bits
    pub fn inject_fault(&mut self, status_bits: u32) {
        self.fault = Some(status_bits);
    }

    /// Take the injected fault, if any
    pub fn take_fault(&mut self) -> Option<u32> {
        self.fault.take()
    }

    /// Declare where the family keeps its busy flag
    pub fn set_busy_flag(&mut self, flag: BusyFlag) {
        self.busy = Some(flag);
    }

    /// Keep the busy flag raised forever
    pub fn force_busy(&mut self, busy: bool) {
        self.force_busy = busy;
    }

    /// Declare the register that holds the first co-processor page
    pub fn set_protection_register(&mut self, address: u32) {
        self.protection = Some(address);
    }

    /// Reserve all pages from `page` on for the co-processor
    pub fn set_protected_from(&mut self, page: u32) {
        if let Some(address) = self.protection {
            let value = self.reg(address);
            self.set_reg(address, (value & !0xFF) | page);
        }
    }

    /// Feed one key of an unlock sequence. Returns `true` when `second` follows `first`.
    pub fn key_write(&mut self, register: u32, value: u32, first: u32, second: u32) -> bool {
        let stage = self.key_stages.entry(register).or_insert(0);
        match (*stage, value) {
            (0, key) if key == first => {
                *stage = 1;
                false
            }
            (1, key) if key == second => {
                *stage = 0;
                true
            }
            _ => {
                *stage = 0;
                false
            }
        }
    }

    /// Erase the page
    pub fn erase_page(&mut self, page: u32) {
        let range = self
            .geometry
            .page_range(page)
            .unwrap_or_else(|| panic!("Simulated erase of missing page {}", page));
        let start = (range.start - self.geometry.base() as u64) as usize;
        let end = (range.end - self.geometry.base() as u64) as usize;
        self.memory[start..end].fill(self.erased);
        self.operations.push(Operation::Erase { page });
    }

    /// Erase the page that contains the address
    pub fn erase_at(&mut self, address: u32) {
        let page = self
            .geometry
            .page_containing(address)
            .unwrap_or_else(|| panic!("Simulated erase outside flash at {:#010X}", address));
        self.erase_page(page);
    }

    /// Program the bytes. Programming can only move bits away from the erased value.
    pub fn program(&mut self, address: u32, bytes: &[u8]) {
        assert!(
            self.geometry.contains(address, bytes.len()),
            "Simulated program outside flash at {:#010X}",
            address
        );
        let start = (address - self.geometry.base()) as usize;
        let erased = self.erased;
        for (cell, byte) in self.memory[start..].iter_mut().zip(bytes) {
            *cell = if erased == 0xFF {
                *cell & byte
            } else {
                *cell | byte
            };
        }
        self.operations.push(Operation::Program {
            address,
            len: bytes.len(),
        });
    }

    fn status_overlay(&self, address: u32, value: u32) -> u32 {
        match self.busy {
            Some(flag) if self.force_busy && flag.address == address => {
                if flag.set_when_busy {
                    value | flag.bit
                } else {
                    value & !flag.bit
                }
            }
            _ => value,
        }
    }
}

/// A [RegisterBus] backed by [SimState]
pub struct SimBus<F> {
    state: SimState,
    _family: PhantomData<F>,
}

impl<F: FlashFamily> SimBus<F> {
    /// A controller in its reset state with fully erased program memory
    pub fn new(geometry: Geometry) -> Self {
        let mut state = SimState::new(geometry, F::ERASED);
        F::sim_reset(&mut state);
        Self {
            state,
            _family: PhantomData,
        }
    }

    /// The simulated state
    pub fn state(&self) -> &SimState {
        &self.state
    }

    /// Mutable access to the simulated state
    pub fn state_mut(&mut self) -> &mut SimState {
        &mut self.state
    }
}

impl<F: FlashFamily> RegisterBus for SimBus<F> {
    fn read32(&self, address: u32) -> u32 {
        if self.state.geometry.contains(address, 4) {
            let mut word = [0; 4];
            self.read_bytes(address, &mut word);
            return u32::from_ne_bytes(word);
        }
        self.state
            .status_overlay(address, self.state.reg(address))
    }

    fn write32(&mut self, address: u32, value: u32) {
        let before = self.state.reg(address);
        self.state.set_reg(address, value);
        let access = Access::Write {
            address,
            before,
            value,
        };
        self.state.log.push(access);
        F::simulate(&mut self.state, access);
    }

    fn program_unit(&mut self, address: u32, unit: &[u8]) {
        let mut bytes = [0; 8];
        bytes[..unit.len()].copy_from_slice(unit);
        let access = Access::Program {
            address,
            unit: bytes,
            len: unit.len(),
        };
        self.state.log.push(access);
        F::simulate(&mut self.state, access);
    }

    fn read_bytes(&self, address: u32, buffer: &mut [u8]) {
        assert!(
            self.state.geometry.contains(address, buffer.len()),
            "Simulated read outside flash at {:#010X}",
            address
        );
        let start = (address - self.state.geometry.base()) as usize;
        buffer.copy_from_slice(&self.state.memory[start..start + buffer.len()]);
    }
}
