//! Fixed assignment of guest state to host registers. Every block and the entry trampoline
//! agree on it, so blocks are entered and left without saving anything.

use crate::block::OpCodeStream;
use crate::sm83::operands::{Reg16, Reg8};
use crate::x86_asm::{Immediate, Mov, Movzx, OpSize, Or, Register, Rol, Ror, Shr};

// Guest registers live in callee-saved registers, so calls into the runtime leave them alone.
// 8 bit values and register pairs are kept zero-extended.
pub const ACCUMULATOR: Register = Register::R13;
pub const BC: Register = Register::Rbx;
pub const DE: Register = Register::Rbp;
pub const HL: Register = Register::R12;
/// `window base | SP`, a host pointer into the guest window
pub const STACK_POINTER: Register = Register::R14;
/// Guest Z and C in host flag layout
pub const SHADOW_FLAGS: Register = Register::R15;
/// Elapsed clock cycles. Caller-saved, preserved around runtime calls by the bridge.
pub const CYCLES: Register = Register::R10;

// Scratch registers, chosen to line up with the System V argument registers used by the
// runtime handlers (rdi, rsi, rdx, rcx) and the return register (rax)
pub const RESULT: Register = Register::Rax;
pub const OPERAND: Register = Register::Rcx;
pub const VALUE: Register = Register::Rdx;
pub const ADDRESS: Register = Register::Rsi;
pub const WINDOW: Register = Register::Rdi;
pub const FLAGS_CAPTURE: Register = Register::R8;
pub const FLAGS_SCRATCH: Register = Register::R9;
pub const CONTEXT: Register = Register::R11;

/// Where an 8 bit guest register lives inside its host register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Whole(Register),
    Low(Register),
    High(Register),
}

pub fn slot(reg: Reg8) -> Slot {
    match reg {
        Reg8::A => Slot::Whole(ACCUMULATOR),
        Reg8::B => Slot::High(BC),
        Reg8::C => Slot::Low(BC),
        Reg8::D => Slot::High(DE),
        Reg8::E => Slot::Low(DE),
        Reg8::H => Slot::High(HL),
        Reg8::L => Slot::Low(HL),
    }
}

/// Host register of a pair. SP is biased and needs the dedicated helpers.
pub fn pair(reg: Reg16) -> Register {
    match reg {
        Reg16::BC => BC,
        Reg16::DE => DE,
        Reg16::HL => HL,
        Reg16::SP => STACK_POINTER,
    }
}

/// Loads a guest register zero-extended into `dst`. Clobbers host flags for high bytes.
pub fn emit_load_8(stream: &mut OpCodeStream, reg: Reg8, dst: Register) {
    match slot(reg) {
        Slot::Whole(src) => {
            stream.push_opcode(
                Mov::new(dst)
                    .with_register(src)
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
        }
        Slot::Low(src) => {
            stream.push_opcode(Movzx::new(dst).with_register(src).generate());
        }
        Slot::High(src) => {
            stream.push_opcode(Movzx::new(dst).with_register(src).from_word().generate());
            stream.push_opcode(Shr::new(dst, 8).with_op_size(OpSize::Dword).generate());
        }
    }
}

/// Stores the low byte of `src` into a guest register. Clobbers host flags for high bytes.
pub fn emit_store_8(stream: &mut OpCodeStream, reg: Reg8, src: Register) {
    match slot(reg) {
        Slot::Whole(dst) => {
            stream.push_opcode(Movzx::new(dst).with_register(src).generate());
        }
        Slot::Low(dst) => {
            stream.push_opcode(
                Mov::new(dst)
                    .with_register(src)
                    .with_op_size(OpSize::Byte)
                    .generate(),
            );
        }
        Slot::High(dst) => {
            stream.push_opcode(Ror::new(dst, 8).with_op_size(OpSize::Word).generate());
            stream.push_opcode(
                Mov::new(dst)
                    .with_register(src)
                    .with_op_size(OpSize::Byte)
                    .generate(),
            );
            stream.push_opcode(Rol::new(dst, 8).with_op_size(OpSize::Word).generate());
        }
    }
}

/// Loads a register pair (SP unbiased) zero-extended into `dst`. Flag neutral.
pub fn emit_load_16(stream: &mut OpCodeStream, reg: Reg16, dst: Register) {
    stream.push_opcode(Movzx::new(dst).with_register(pair(reg)).from_word().generate());
}

/// Stores the low 16 bits of `src` into a register pair. Flag neutral.
pub fn emit_store_16(stream: &mut OpCodeStream, reg: Reg16, src: Register) {
    match reg {
        // The window is aligned to 64 KiB, so writing the low half keeps the bias
        Reg16::SP => {
            stream.push_opcode(
                Mov::new(STACK_POINTER)
                    .with_register(src)
                    .with_op_size(OpSize::Word)
                    .generate(),
            );
        }
        _ => {
            stream.push_opcode(Movzx::new(pair(reg)).with_register(src).from_word().generate());
        }
    }
}

/// Points the biased stack register at `window_base | value`, with `value` already in `src`
pub fn emit_rebias_stack_pointer(stream: &mut OpCodeStream, window_base: u64, src: Register) {
    stream.push_opcode(
        Mov::new(STACK_POINTER)
            .with_immediate(Immediate::new(window_base as i64))
            .generate(),
    );
    stream.push_opcode(Or::new(STACK_POINTER).with_register(src).generate());
}

#[cfg(all(test, target_arch = "x86_64"))]
mod test {
    use super::*;
    use crate::block::ExecutableBlock;
    use crate::x86_asm::{Pop, Push, Ret};

    /// Runs `body` with rbx = `bc` and returns the resulting rax and rbx
    fn run_with_bc(bc: u64, body: impl FnOnce(&mut OpCodeStream)) -> (u64, u64) {
        let mut stream = OpCodeStream::new();
        stream.push_opcode(Push::new(Register::Rbx).generate());
        stream.push_opcode(Mov::new(Register::Rbx).with_register(Register::Rdi).generate());
        body(&mut stream);
        // Return rbx in rdx
        stream.push_opcode(Mov::new(Register::Rdx).with_register(Register::Rbx).generate());
        stream.push_opcode(Pop::new(Register::Rbx).generate());
        stream.push_opcode(Ret::new().generate());

        let block = ExecutableBlock::new(&stream.finalize()).unwrap();
        let func: extern "C" fn(u64) -> Pair = unsafe { std::mem::transmute(block.entrypoint()) };
        let result = func(bc);
        (result.rax, result.rdx)
    }

    #[repr(C)]
    struct Pair {
        rax: u64,
        rdx: u64,
    }

    #[test]
    fn loads_high_and_low_bytes() {
        let (rax, _) = run_with_bc(0x1234, |stream| emit_load_8(stream, Reg8::B, Register::Rax));
        assert_eq!(rax, 0x12);
        let (rax, _) = run_with_bc(0x1234, |stream| emit_load_8(stream, Reg8::C, Register::Rax));
        assert_eq!(rax, 0x34);
    }

    #[test]
    fn stores_high_byte_without_touching_low_byte() {
        let (_, bc) = run_with_bc(0x1234, |stream| {
            stream.push_opcode(
                Mov::new(Register::Rcx)
                    .with_immediate(Immediate::new(0xAB))
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
            emit_store_8(stream, Reg8::B, Register::Rcx);
        });
        assert_eq!(bc, 0xAB34);
    }

    #[test]
    fn stores_pair_zero_extended() {
        let (_, bc) = run_with_bc(0x1234, |stream| {
            stream.push_opcode(
                Mov::new(Register::Rcx)
                    .with_immediate(Immediate::new(0x1_BEEF))
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
            emit_store_16(stream, Reg16::BC, Register::Rcx);
        });
        assert_eq!(bc, 0xBEEF);
    }
}
