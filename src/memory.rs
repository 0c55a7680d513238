use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};

pub type TargetAddress = u16;
pub type VirtualAddress = *const ();

/// Size of the guest address space. The window is aligned to its own size so that a host
/// pointer `base | address` can be moved around with 16 bit arithmetic.
pub const WINDOW_SIZE: usize = 0x1_0000;

/// Guest address space directly addressable by the generated code.
pub struct GuestWindow {
    base: *mut u8,
}

impl GuestWindow {
    pub fn new() -> Self {
        let layout = Self::layout();
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Self { base }
    }

    /// Creates a window with `data` copied at guest address 0
    pub fn from(data: &[u8]) -> Self {
        let mut window = Self::new();
        window.load(0, data);
        window
    }

    fn layout() -> Layout {
        // Power of two size and alignment, always valid
        unsafe { Layout::from_size_align_unchecked(WINDOW_SIZE, WINDOW_SIZE) }
    }

    /// Host address of guest address 0
    pub fn base_address(&self) -> u64 {
        self.base as u64
    }

    /// Copies `data` into the window starting at `addr`
    pub fn load(&mut self, addr: TargetAddress, data: &[u8]) {
        let start = addr as usize;
        self.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, WINDOW_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, WINDOW_SIZE) }
    }
}

impl Drop for GuestWindow {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, Self::layout()) };
    }
}

/// Runtime side of guest memory. Generated code calls these handlers for every access the
/// direct window cannot serve. `cycles` is the elapsed clock count at the time of the access.
pub trait MemoryInterface {
    extern "C" fn read_8_bits(&mut self, addr: TargetAddress, cycles: u64) -> u8;
    extern "C" fn write_8_bits(&mut self, addr: TargetAddress, data: u8, cycles: u64);

    extern "C" fn read_16_bits(&mut self, addr: TargetAddress, cycles: u64) -> u16 {
        let low = self.read_8_bits(addr, cycles) as u16;
        let high = self.read_8_bits(addr.wrapping_add(1), cycles) as u16;
        (high << 8) | low
    }

    extern "C" fn write_16_bits(&mut self, addr: TargetAddress, data: u16, cycles: u64) {
        self.write_8_bits(addr, data as u8, cycles);
        self.write_8_bits(addr.wrapping_add(1), (data >> 8) as u8, cycles);
    }

    /// Called for EI, DI and RETI
    extern "C" fn set_interrupt_master_enable(&mut self, enabled: bool, cycles: u64);

    /// The window the generated code reads and writes directly. It must stay at the same host
    /// address for the lifetime of the interface and mirror the active banks.
    fn guest_window(&mut self) -> &mut GuestWindow;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn window_is_aligned_to_its_size() {
        let window = GuestWindow::new();
        assert_eq!(window.base_address() % WINDOW_SIZE as u64, 0);
        assert!(window.as_slice().iter().all(|byte| *byte == 0));
    }

    #[test]
    fn loads_data_at_address() {
        let mut window = GuestWindow::from(&[0x3E, 0x12]);
        window.load(0xFFFE, &[0xAA, 0xBB]);
        assert_eq!(&window.as_slice()[..2], &[0x3E, 0x12]);
        assert_eq!(&window.as_slice()[0xFFFE..], &[0xAA, 0xBB]);
    }
}
