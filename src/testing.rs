//! Memory interface and helpers for the tests that run generated code.

use crate::memory::{GuestWindow, MemoryInterface, TargetAddress};
use crate::virtual_machine::{ExitReason, VirtualMachine};

/// A runtime handler invocation
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Access {
    Read8(TargetAddress),
    Write8(TargetAddress, u8),
    Read16(TargetAddress),
    Write16(TargetAddress, u16),
    InterruptMasterEnable(bool),
}

/// Flat 64 KiB memory recording every slow path access with its cycle count
pub struct FlatMemory {
    window: GuestWindow,
    pub accesses: Vec<(Access, u64)>,
}

impl FlatMemory {
    /// Memory with `program` at address 0
    pub fn new(program: &[u8]) -> Self {
        Self {
            window: GuestWindow::from(program),
            accesses: vec![],
        }
    }

    pub fn with_data(mut self, address: TargetAddress, data: &[u8]) -> Self {
        self.window.load(address, data);
        self
    }

    pub fn slow_accesses(&self) -> Vec<Access> {
        self.accesses.iter().map(|(access, _)| *access).collect()
    }

    pub fn read(&self, address: TargetAddress) -> u8 {
        self.window.as_slice()[address as usize]
    }
}

impl MemoryInterface for FlatMemory {
    extern "C" fn read_8_bits(&mut self, addr: TargetAddress, cycles: u64) -> u8 {
        self.accesses.push((Access::Read8(addr), cycles));
        self.read(addr)
    }

    extern "C" fn write_8_bits(&mut self, addr: TargetAddress, data: u8, cycles: u64) {
        self.accesses.push((Access::Write8(addr, data), cycles));
        self.window.as_mut_slice()[addr as usize] = data;
    }

    extern "C" fn read_16_bits(&mut self, addr: TargetAddress, cycles: u64) -> u16 {
        self.accesses.push((Access::Read16(addr), cycles));
        let low = self.read(addr) as u16;
        let high = self.read(addr.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    extern "C" fn write_16_bits(&mut self, addr: TargetAddress, data: u16, cycles: u64) {
        self.accesses.push((Access::Write16(addr, data), cycles));
        let window = self.window.as_mut_slice();
        window[addr as usize] = data as u8;
        window[addr.wrapping_add(1) as usize] = (data >> 8) as u8;
    }

    extern "C" fn set_interrupt_master_enable(&mut self, enabled: bool, cycles: u64) {
        self.accesses
            .push((Access::InterruptMasterEnable(enabled), cycles));
    }

    fn guest_window(&mut self) -> &mut GuestWindow {
        &mut self.window
    }
}

/// Runs blocks until one stops the guest, returning how many blocks ran
pub fn run_until_stop<T: MemoryInterface>(vm: &mut VirtualMachine<T>) -> usize {
    let mut blocks = 1;
    while vm.run().unwrap() != ExitReason::Stop {
        blocks += 1;
        assert!(blocks < 1000, "The guest program never stopped");
    }
    blocks
}
