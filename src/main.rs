use gb_jit::memory::{GuestWindow, MemoryInterface, TargetAddress};
use gb_jit::virtual_machine::{ExitReason, VirtualMachine};
use log::{error, info, trace, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

/// Counts B down from 0x10 while accumulating into A, then stores A to the serial data register.
const DEMO_PROGRAM: [u8; 16] = [
    0x31, 0xFE, 0xFF, // LD SP, 0xFFFE
    0x06, 0x10, //       LD B, 0x10
    0xAF, //             XOR A
    0x80, //             ADD A, B
    0x05, //             DEC B
    0x20, 0xFC, //       JR NZ, -4
    0xE0, 0x01, //       LDH (0x01), A
    0x76, //             HALT
    0x10, 0x00, //       STOP
    0x00,
];

struct Memory {
    window: GuestWindow,
}

impl MemoryInterface for Memory {
    extern "C" fn read_8_bits(&mut self, addr: TargetAddress, cycles: u64) -> u8 {
        trace!("[{}] read {:#06x}", cycles, addr);
        self.window.as_slice()[addr as usize]
    }

    extern "C" fn write_8_bits(&mut self, addr: TargetAddress, data: u8, cycles: u64) {
        match addr {
            0xFF01 => info!("[{}] serial out {:#04x}", cycles, data),
            // ROM and bank control
            0x0000..=0x7FFF => trace!("[{}] bank control {:#06x} <- {:#04x}", cycles, addr, data),
            _ => self.window.as_mut_slice()[addr as usize] = data,
        }
    }

    extern "C" fn set_interrupt_master_enable(&mut self, enabled: bool, cycles: u64) {
        trace!("[{}] IME = {}", cycles, enabled);
    }

    fn guest_window(&mut self) -> &mut GuestWindow {
        &mut self.window
    }
}

fn main() {
    if TermLogger::init(
        LevelFilter::Debug,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        eprintln!("Unable to initialise the logger");
    }

    let program = match std::env::args().nth(1) {
        Some(path) => match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) => {
                error!("Unable to read {}: {}", path, err);
                return;
            }
        },
        None => DEMO_PROGRAM.to_vec(),
    };
    let size = program.len().min(0x8000);
    let mut memory = Memory {
        window: GuestWindow::from(&program[..size]),
    };

    let mut vm = match VirtualMachine::new(&mut memory) {
        Ok(vm) => vm,
        Err(err) => {
            error!("Unable to create the virtual machine: {:?}", err);
            return;
        }
    };

    loop {
        match vm.run() {
            Ok(ExitReason::Branch) => {}
            Ok(ExitReason::Halt) => info!("HALT at {:#06x}", vm.get_state().pc),
            Ok(ExitReason::Stop) => break,
            Err(err) => {
                error!("Execution failed at {:#06x}: {:?}", vm.get_state().pc, err);
                return;
            }
        }
    }
    info!("Stopped: {:x?}", vm.get_state());
}
