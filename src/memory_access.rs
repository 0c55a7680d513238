//! Guest loads and stores with an inline fast path into the guest window and a call-out slow
//! path for everything the window cannot serve (I/O registers, banking control, OAM).
//!
//! | access      | fast path                 |
//! |-------------|---------------------------|
//! | 8 bit read  | addr < 0xFE00             |
//! | 8 bit write | 0x8000 <= addr < 0xFE00   |
//! | 16 bit read | addr < 0xFDFF             |
//! | 16 bit write| 0x8000 <= addr < 0xFDFF   |
//!
//! Both bytes of a 16 bit fast access stay below 0xFE00. The window has the same byte order as
//! the guest, so words are loaded and stored as they are.

use crate::block::OpCodeStream;
use crate::interop::{Bridge, Handler};
use crate::memory::TargetAddress;
use crate::registers::{ADDRESS, RESULT, VALUE, WINDOW};
use crate::x86_asm::{
    Branch, Cmp, Condition, Immediate, Memory, Mov, Movzx, OpSize, Register, Store,
};

/// Where the guest address of an access comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestAddress {
    /// Already in the address register
    Dynamic,
    /// Known at compile time. The path is picked while compiling.
    Constant(TargetAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Byte,
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Access {
    width: Width,
    direction: Direction,
}

impl Access {
    /// [lower, upper) range served by the guest window
    fn fast_range(&self) -> (u32, u32) {
        let lower = match self.direction {
            Direction::Read => 0x0000,
            // ROM and bank control: stores must reach the runtime
            Direction::Write => 0x8000,
        };
        let upper = match self.width {
            Width::Byte => 0xFE00,
            Width::Word => 0xFDFF,
        };
        (lower, upper)
    }

    fn handler(&self) -> Handler {
        match (self.width, self.direction) {
            (Width::Byte, Direction::Read) => Handler::Read8,
            (Width::Byte, Direction::Write) => Handler::Write8,
            (Width::Word, Direction::Read) => Handler::Read16,
            (Width::Word, Direction::Write) => Handler::Write16,
        }
    }

    fn is_fast(&self, address: TargetAddress) -> bool {
        let (lower, upper) = self.fast_range();
        (lower..upper).contains(&(address as u32))
    }
}

/// Reads a byte into rax, zero-extended
pub fn emit_read_8(stream: &mut OpCodeStream, bridge: &Bridge, address: GuestAddress) {
    emit_access(
        stream,
        bridge,
        Access {
            width: Width::Byte,
            direction: Direction::Read,
        },
        address,
    );
}

/// Writes the low byte of rdx
pub fn emit_write_8(stream: &mut OpCodeStream, bridge: &Bridge, address: GuestAddress) {
    emit_access(
        stream,
        bridge,
        Access {
            width: Width::Byte,
            direction: Direction::Write,
        },
        address,
    );
}

/// Reads a little endian word into rax, zero-extended
pub fn emit_read_16(stream: &mut OpCodeStream, bridge: &Bridge, address: GuestAddress) {
    emit_access(
        stream,
        bridge,
        Access {
            width: Width::Word,
            direction: Direction::Read,
        },
        address,
    );
}

/// Writes the low word of rdx
pub fn emit_write_16(stream: &mut OpCodeStream, bridge: &Bridge, address: GuestAddress) {
    emit_access(
        stream,
        bridge,
        Access {
            width: Width::Word,
            direction: Direction::Write,
        },
        address,
    );
}

fn emit_access(stream: &mut OpCodeStream, bridge: &Bridge, access: Access, address: GuestAddress) {
    match address {
        GuestAddress::Constant(address) => {
            emit_set_address(stream, address);
            if access.is_fast(address) {
                emit_fast_path(stream, bridge, access);
            } else {
                emit_slow_path(stream, bridge, access);
            }
        }
        GuestAddress::Dynamic => {
            let slow_path = stream.create_label();
            let done = stream.create_label();
            let (lower, upper) = access.fast_range();

            if lower > 0 {
                emit_compare_address(stream, lower);
                stream.push_branch(Branch::new().with_condition(Condition::Below), slow_path);
            }
            emit_compare_address(stream, upper);
            stream.push_branch(
                Branch::new().with_condition(Condition::AboveOrEqual),
                slow_path,
            );

            emit_fast_path(stream, bridge, access);
            stream.push_branch(Branch::new(), done);

            stream.bind_label(slow_path);
            emit_slow_path(stream, bridge, access);
            stream.bind_label(done);
        }
    }
}

fn emit_set_address(stream: &mut OpCodeStream, address: TargetAddress) {
    stream.push_opcode(
        Mov::new(ADDRESS)
            .with_immediate(Immediate::new(address as i64))
            .with_op_size(OpSize::Dword)
            .generate(),
    );
}

fn emit_compare_address(stream: &mut OpCodeStream, bound: u32) {
    stream.push_opcode(
        Cmp::new(ADDRESS)
            .with_immediate(Immediate::new(bound as i64))
            .with_op_size(OpSize::Dword)
            .generate(),
    );
}

fn emit_fast_path(stream: &mut OpCodeStream, bridge: &Bridge, access: Access) {
    stream.push_opcode(
        Mov::new(WINDOW)
            .with_immediate(Immediate::new(bridge.window_base() as i64))
            .generate(),
    );
    let location = Memory::base(WINDOW).with_index(ADDRESS);
    match (access.width, access.direction) {
        (Width::Byte, Direction::Read) => {
            stream.push_opcode(Movzx::new(RESULT).with_memory(location).generate());
        }
        (Width::Word, Direction::Read) => {
            stream.push_opcode(
                Movzx::new(RESULT)
                    .with_memory(location)
                    .from_word()
                    .generate(),
            );
        }
        (Width::Byte, Direction::Write) => {
            stream.push_opcode(
                Store::new(location, VALUE)
                    .with_op_size(OpSize::Byte)
                    .generate(),
            );
        }
        (Width::Word, Direction::Write) => {
            stream.push_opcode(
                Store::new(location, VALUE)
                    .with_op_size(OpSize::Word)
                    .generate(),
            );
        }
    }
}

fn emit_slow_path(stream: &mut OpCodeStream, bridge: &Bridge, access: Access) {
    bridge.emit_call(stream, access.handler());
    if access.direction == Direction::Read {
        let result = Movzx::new(RESULT).with_register(Register::Rax);
        let result = match access.width {
            Width::Byte => result,
            Width::Word => result.from_word(),
        };
        stream.push_opcode(result.generate());
    }
}


#[cfg(all(test, target_arch = "x86_64"))]
mod execution_test {
    use super::*;
    use crate::block::{CodeBlock, ExecutableBlock};
    use crate::compiled_block::CompiledBlock;
    use crate::testing::{Access, FlatMemory};
    use crate::virtual_machine::VirtualMachine;
    use crate::x86_asm::Ret;

    fn set_register(stream: &mut OpCodeStream, reg: Register, value: u32) {
        stream.push_opcode(
            Mov::new(reg)
                .with_immediate(Immediate::new(value as i64))
                .with_op_size(OpSize::Dword)
                .generate(),
        );
    }

    /// Writes `value` at the dynamic `address`, reads it back and exits with it as the next PC
    fn round_trip(vm: &mut VirtualMachine<FlatMemory>, address: TargetAddress, value: u16) -> u64 {
        let bridge = vm.bridge();
        let mut block = CodeBlock::open(0);
        let stream = block.stream();
        set_register(stream, VALUE, value as u32);
        set_register(stream, ADDRESS, address as u32);
        emit_write_16(stream, &bridge, GuestAddress::Dynamic);
        set_register(stream, ADDRESS, address as u32);
        emit_read_16(stream, &bridge, GuestAddress::Dynamic);
        stream.push_opcode(
            Mov::new(VALUE)
                .with_register(RESULT)
                .with_op_size(OpSize::Dword)
                .generate(),
        );
        set_register(stream, RESULT, 0);
        stream.push_opcode(Ret::new().generate());
        block.close(1);

        let (range, code) = block.finalize();
        let block = CompiledBlock::new(ExecutableBlock::new(&code).unwrap(), range, 1);
        vm.execute(&block).unwrap();
        vm.get_state().pc
    }

    #[test]
    fn words_round_trip_on_both_sides_of_the_window_end() {
        let mut memory = FlatMemory::new(&[]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();

        assert_eq!(round_trip(&mut vm, 0xFDFE, 0x1234), 0x1234);
        assert!(vm.memory_interface().accesses.is_empty());

        assert_eq!(round_trip(&mut vm, 0xFDFF, 0x5678), 0x5678);
        assert_eq!(round_trip(&mut vm, 0xFE00, 0x9ABC), 0x9ABC);
        assert_eq!(
            vm.memory_interface().slow_accesses(),
            vec![
                Access::Write16(0xFDFF, 0x5678),
                Access::Read16(0xFDFF),
                Access::Write16(0xFE00, 0x9ABC),
                Access::Read16(0xFE00),
            ]
        );
    }

    #[test]
    fn constant_addresses_pick_the_path_while_compiling() {
        let mut memory = FlatMemory::new(&[]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();
        let bridge = vm.bridge();

        let mut block = CodeBlock::open(0);
        let stream = block.stream();
        set_register(stream, VALUE, 0xAA);
        emit_write_8(stream, &bridge, GuestAddress::Constant(0x9000));
        emit_write_8(stream, &bridge, GuestAddress::Constant(0x2000));
        emit_read_8(stream, &bridge, GuestAddress::Constant(0x9000));
        stream.push_opcode(
            Mov::new(VALUE)
                .with_register(RESULT)
                .with_op_size(OpSize::Dword)
                .generate(),
        );
        set_register(stream, RESULT, 0);
        stream.push_opcode(Ret::new().generate());
        block.close(1);

        let (range, code) = block.finalize();
        let block = CompiledBlock::new(ExecutableBlock::new(&code).unwrap(), range, 1);
        vm.execute(&block).unwrap();
        assert_eq!(vm.get_state().pc, 0xAA);
        assert_eq!(
            vm.memory_interface().slow_accesses(),
            vec![Access::Write8(0x2000, 0xAA)]
        );
    }
}
