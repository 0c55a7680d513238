//! Calls from generated code into the runtime.
//!
//! Guest registers live in callee-saved host registers, so the only hot value at risk across a
//! call is the cycle counter. The bridge persists it into the execution context (the runtime
//! reads timing from there), keeps it on the host stack across the call and passes it as the
//! last argument of every handler.

use std::mem::offset_of;

use crate::block::OpCodeStream;
use crate::memory::MemoryInterface;
use crate::registers::{CONTEXT, CYCLES, WINDOW};
use crate::x86_asm::{Call, Immediate, Load, Memory, Mov, Pop, Push, Register, Store};

/// Runtime state shared with the generated code. Its address is embedded in every block, so it
/// must not move while blocks are alive.
#[repr(C)]
pub struct ExecutionContext {
    memory: *mut (),
    cycles: u64,
    read_8_bits: *const (),
    write_8_bits: *const (),
    read_16_bits: *const (),
    write_16_bits: *const (),
    set_interrupt_master_enable: *const (),
}

impl ExecutionContext {
    pub fn new<T: MemoryInterface>(memory: *mut T) -> Box<Self> {
        Box::new(Self {
            memory: memory as *mut (),
            cycles: 0,
            read_8_bits: <T as MemoryInterface>::read_8_bits as *const (),
            write_8_bits: <T as MemoryInterface>::write_8_bits as *const (),
            read_16_bits: <T as MemoryInterface>::read_16_bits as *const (),
            write_16_bits: <T as MemoryInterface>::write_16_bits as *const (),
            set_interrupt_master_enable: <T as MemoryInterface>::set_interrupt_master_enable
                as *const (),
        })
    }

    /// Cycle count persisted by the last runtime call
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

/// Runtime entry points reachable from generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// (address) -> u8
    Read8,
    /// (address, value)
    Write8,
    /// (address) -> u16
    Read16,
    /// (address, value)
    Write16,
    /// (enabled)
    InterruptMasterEnable,
}

impl Handler {
    fn offset(self) -> usize {
        match self {
            Handler::Read8 => offset_of!(ExecutionContext, read_8_bits),
            Handler::Write8 => offset_of!(ExecutionContext, write_8_bits),
            Handler::Read16 => offset_of!(ExecutionContext, read_16_bits),
            Handler::Write16 => offset_of!(ExecutionContext, write_16_bits),
            Handler::InterruptMasterEnable => {
                offset_of!(ExecutionContext, set_interrupt_master_enable)
            }
        }
    }

    /// System V register receiving the cycle count: the one after the operands
    fn cycles_argument(self) -> Register {
        match self {
            Handler::Read8 | Handler::Read16 | Handler::InterruptMasterEnable => Register::Rdx,
            Handler::Write8 | Handler::Write16 => Register::Rcx,
        }
    }
}

/// Addresses the generated code needs from the runtime
#[derive(Debug, Clone, Copy)]
pub struct Bridge {
    context: *const ExecutionContext,
    window_base: u64,
}

impl Bridge {
    pub fn new(context: &ExecutionContext, window_base: u64) -> Self {
        Self {
            context: context as *const _,
            window_base,
        }
    }

    /// Host address of guest address 0
    pub fn window_base(&self) -> u64 {
        self.window_base
    }

    /// Emits a call to `handler`. Operands must already be in rsi (address or enabled flag) and
    /// rdx (value). The result, if any, is left in rax with undefined upper bits. Clobbers every
    /// caller-saved register but the cycle counter, and the host flags.
    pub fn emit_call(&self, stream: &mut OpCodeStream, handler: Handler) {
        let context = Memory::base(CONTEXT);
        stream.push_opcode(
            Mov::new(CONTEXT)
                .with_immediate(Immediate::new(self.context as i64))
                .generate(),
        );
        stream.push_opcode(
            Store::new(
                context.with_displacement(offset_of!(ExecutionContext, cycles) as i32),
                CYCLES,
            )
            .generate(),
        );
        stream.push_opcode(Push::new(CYCLES).generate());
        stream.push_opcode(
            Load::new(
                WINDOW,
                context.with_displacement(offset_of!(ExecutionContext, memory) as i32),
            )
            .generate(),
        );
        stream.push_opcode(
            Mov::new(handler.cycles_argument())
                .with_register(CYCLES)
                .generate(),
        );
        stream.push_opcode(
            Call::new()
                .with_memory(context.with_displacement(handler.offset() as i32))
                .generate(),
        );
        stream.push_opcode(Pop::new(CYCLES).generate());
    }
}
