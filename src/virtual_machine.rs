use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::offset_of;

use log::{debug, warn};

use crate::block::{self, ExecutableBlock, OpCodeStream};
use crate::compiled_block::{CompiledBlock, LocationRange};
use crate::config::JitConfig;
use crate::dynamic_compiler::{self, CompileContext, Compiler};
use crate::flags;
use crate::interop::{Bridge, ExecutionContext};
use crate::memory::{MemoryInterface, TargetAddress, VirtualAddress};
use crate::registers::{
    self, ACCUMULATOR, BC, CYCLES, DE, HL, OPERAND, RESULT, STACK_POINTER, VALUE,
};
use crate::x86_asm::{
    Call, Load, Memory, Mov, Movzx, OpSize, Pop, Push, Register, Ret, Store,
};

/// Guest CPU state exchanged with the generated code. F uses the guest layout.
#[repr(C)]
#[derive(Default, PartialEq, Eq, Debug, Clone)]
pub struct VmState {
    pub a: u64,
    pub f: u64,
    pub bc: u64,
    pub de: u64,
    pub hl: u64,
    pub sp: u64,
    pub pc: u64,
    pub cycles: u64,
}

#[derive(Debug)]
pub enum Error {
    TranslationError(dynamic_compiler::Error),
    BlockError(block::Error),
    InvalidExitReason(u64),
}

impl From<block::Error> for Error {
    fn from(error: block::Error) -> Self {
        Self::BlockError(error)
    }
}

impl From<dynamic_compiler::Error> for Error {
    fn from(error: dynamic_compiler::Error) -> Self {
        Self::TranslationError(error)
    }
}

/// Why a block handed control back. The next guest PC is in the state either way.
#[repr(C)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ExitReason {
    Branch = 0,
    Halt = 1,
    Stop = 2,
}

impl TryFrom<u64> for ExitReason {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExitReason::Branch),
            1 => Ok(ExitReason::Halt),
            2 => Ok(ExitReason::Stop),
            _ => Err(Error::InvalidExitReason(value)),
        }
    }
}

type Trampoline = extern "C" fn(*mut VmState, VirtualAddress) -> u64;

/// Registers the generated code may modify that System V expects preserved, plus the state
/// pointer
const SAVED_REGISTERS: [Register; 7] = [
    Register::Rbx,
    Register::Rbp,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::Rdi,
];

fn state_field(offset: usize) -> Memory {
    Memory::base(Register::Rdi).with_displacement(offset as i32)
}

/// Emits `fn(state: *mut VmState, block: VirtualAddress) -> ExitReason`. The seven pushes realign
/// the host stack, so blocks start with rsp = 8 (mod 16) like any other function.
fn emit_entry_trampoline(stream: &mut OpCodeStream, window_base: u64) {
    for reg in SAVED_REGISTERS {
        stream.push_opcode(Push::new(reg).generate());
    }

    stream.push_opcode(
        Movzx::new(ACCUMULATOR)
            .with_memory(state_field(offset_of!(VmState, a)))
            .generate(),
    );
    for (reg, offset) in [
        (BC, offset_of!(VmState, bc)),
        (DE, offset_of!(VmState, de)),
        (HL, offset_of!(VmState, hl)),
    ] {
        stream.push_opcode(
            Movzx::new(reg)
                .with_memory(state_field(offset))
                .from_word()
                .generate(),
        );
    }
    stream.push_opcode(Load::new(CYCLES, state_field(offset_of!(VmState, cycles))).generate());
    stream.push_opcode(
        Movzx::new(RESULT)
            .with_memory(state_field(offset_of!(VmState, f)))
            .generate(),
    );
    flags::emit_guest_to_shadow(stream, RESULT, OPERAND);
    stream.push_opcode(
        Movzx::new(RESULT)
            .with_memory(state_field(offset_of!(VmState, sp)))
            .from_word()
            .generate(),
    );
    registers::emit_rebias_stack_pointer(stream, window_base, RESULT);

    stream.push_opcode(Call::new().with_register(Register::Rsi).generate());

    stream.push_opcode(Pop::new(Register::Rdi).generate());
    // Exit reason
    stream.push_opcode(
        Mov::new(Register::R9)
            .with_register(RESULT)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
    stream.push_opcode(Movzx::new(VALUE).with_register(VALUE).from_word().generate());
    stream.push_opcode(Store::new(state_field(offset_of!(VmState, pc)), VALUE).generate());
    for (reg, offset) in [
        (ACCUMULATOR, offset_of!(VmState, a)),
        (BC, offset_of!(VmState, bc)),
        (DE, offset_of!(VmState, de)),
        (HL, offset_of!(VmState, hl)),
        (CYCLES, offset_of!(VmState, cycles)),
    ] {
        stream.push_opcode(Store::new(state_field(offset), reg).generate());
    }
    stream.push_opcode(
        Movzx::new(OPERAND)
            .with_register(STACK_POINTER)
            .from_word()
            .generate(),
    );
    stream.push_opcode(Store::new(state_field(offset_of!(VmState, sp)), OPERAND).generate());
    flags::emit_shadow_to_guest(stream, RESULT, OPERAND);
    stream.push_opcode(Store::new(state_field(offset_of!(VmState, f)), RESULT).generate());
    stream.push_opcode(
        Mov::new(RESULT)
            .with_register(Register::R9)
            .with_op_size(OpSize::Dword)
            .generate(),
    );

    for reg in SAVED_REGISTERS.iter().take(6).rev() {
        stream.push_opcode(Pop::new(*reg).generate());
    }
    stream.push_opcode(Ret::new().generate());
}

pub struct VirtualMachine<'a, T: MemoryInterface> {
    memory_interface: *mut T,
    context: Box<ExecutionContext>,
    window_base: u64,
    trampoline: ExecutableBlock,
    blocks: HashMap<TargetAddress, CompiledBlock>,
    state: VmState,
    config: JitConfig,
    _pd: PhantomData<&'a mut T>,
}

impl<'a, T: MemoryInterface> VirtualMachine<'a, T> {
    pub fn new(interface: &'a mut T) -> Result<Self, Error> {
        Self::with_config(interface, JitConfig::default())
    }

    pub fn with_config(interface: &'a mut T, config: JitConfig) -> Result<Self, Error> {
        let window_base = interface.guest_window().base_address();
        let memory_interface = interface as *mut T;
        let context = ExecutionContext::new(memory_interface);

        let mut stream = OpCodeStream::new();
        emit_entry_trampoline(&mut stream, window_base);
        let trampoline = ExecutableBlock::new(&stream.finalize())?;

        Ok(Self {
            memory_interface,
            context,
            window_base,
            trampoline,
            blocks: HashMap::new(),
            state: VmState::default(),
            config,
            _pd: PhantomData {},
        })
    }

    /// Runs the block starting at the current PC, translating it first if needed.
    pub fn run(&mut self) -> Result<ExitReason, Error> {
        let address = self.state.pc as TargetAddress;
        let entrypoint = self.ensure_block_for_address(address)?.entrypoint();
        self.enter(entrypoint)
    }

    /// Runs an already compiled block, regardless of the current PC.
    pub fn execute(&mut self, block: &CompiledBlock) -> Result<ExitReason, Error> {
        self.enter(block.entrypoint())
    }

    fn enter(&mut self, entrypoint: VirtualAddress) -> Result<ExitReason, Error> {
        let trampoline: Trampoline = unsafe { std::mem::transmute(self.trampoline.entrypoint()) };
        let reason = trampoline(&mut self.state as *mut VmState, entrypoint);
        ExitReason::try_from(reason)
    }

    /// Translates the block starting at `address` without publishing it.
    pub fn compile(&mut self, address: TargetAddress) -> Result<CompiledBlock, Error> {
        let bridge = self.bridge();
        // The window outlives the VM borrow, and nothing writes it while compiling
        let rom = unsafe { (*self.memory_interface).guest_window().as_slice() };
        let compiler = Compiler::new(CompileContext::new(rom, address, bridge), &self.config);
        compiler.translate_code().map_err(|error| {
            warn!("Failed to translate block at {:#06x}: {:?}", address, error);
            Error::from(error)
        })
    }

    fn ensure_block_for_address(&mut self, address: TargetAddress) -> Result<&CompiledBlock, Error> {
        if !self.blocks.contains_key(&address) {
            let block = self.compile(address)?;
            self.blocks.insert(address, block);
        }
        Ok(&self.blocks[&address])
    }

    /// Drops every cached block whose guest bytes overlap `range`. Returns how many were dropped.
    pub fn invalidate(&mut self, range: &LocationRange) -> usize {
        let before = self.blocks.len();
        self.blocks
            .retain(|_, block| !block.location_range().overlaps(range));
        let dropped = before - self.blocks.len();
        if dropped > 0 {
            debug!(
                "Invalidated {} blocks overlapping {:#06x}..{:#06x}",
                dropped,
                range.start(),
                range.end()
            );
        }
        dropped
    }

    pub fn is_cached(&self, address: TargetAddress) -> bool {
        self.blocks.contains_key(&address)
    }

    /// Addresses generated code needs to reach the runtime
    pub fn bridge(&self) -> Bridge {
        Bridge::new(&self.context, self.window_base)
    }

    /// Cycle count as last seen by a runtime handler
    pub fn context_cycles(&self) -> u64 {
        self.context.cycles()
    }

    pub fn memory_interface(&mut self) -> &mut T {
        unsafe { &mut *self.memory_interface }
    }

    pub fn get_state(&self) -> &VmState {
        &self.state
    }

    pub fn get_mut_state(&mut self) -> &mut VmState {
        &mut self.state
    }
}


#[cfg(all(test, target_arch = "x86_64"))]
mod execution_test {
    use super::*;
    use crate::testing::FlatMemory;

    #[test]
    fn state_round_trips_through_the_trampoline() {
        // STOP
        let mut memory = FlatMemory::new(&[0x10, 0x00]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();
        *vm.get_mut_state() = VmState {
            a: 0x12,
            f: 0x90,
            bc: 0x3456,
            de: 0x789A,
            hl: 0xBCDE,
            sp: 0xC000,
            pc: 0,
            cycles: 100,
        };

        assert_eq!(vm.run().unwrap(), ExitReason::Stop);
        assert_eq!(
            *vm.get_state(),
            VmState {
                a: 0x12,
                f: 0x90,
                bc: 0x3456,
                de: 0x789A,
                hl: 0xBCDE,
                sp: 0xC000,
                pc: 2,
                cycles: 104,
            }
        );
    }

    #[test]
    fn halt_resumes_after_the_instruction() {
        let mut memory = FlatMemory::new(&[0x00, 0x76]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();
        assert_eq!(vm.run().unwrap(), ExitReason::Halt);
        assert_eq!(vm.get_state().pc, 2);
        assert_eq!(vm.get_state().cycles, 8);
    }

    #[test]
    fn blocks_are_cached_until_invalidated() {
        // NOP; JR -3
        let mut memory = FlatMemory::new(&[0x00, 0x18, 0xFD]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();
        assert_eq!(vm.run().unwrap(), ExitReason::Branch);
        assert_eq!(vm.get_state().pc, 0);
        assert!(vm.is_cached(0));

        assert_eq!(vm.invalidate(&LocationRange::new(0x10, 4)), 0);
        assert!(vm.is_cached(0));
        assert_eq!(vm.invalidate(&LocationRange::new(2, 1)), 1);
        assert!(!vm.is_cached(0));

        assert_eq!(vm.run().unwrap(), ExitReason::Branch);
        assert_eq!(vm.get_state().cycles, 32);
    }

    #[test]
    fn executes_blocks_outside_of_the_cache() {
        // 0x0000: LD A, 0x01; STOP
        // 0x0004: LD A, 0x02; STOP
        let mut memory = FlatMemory::new(&[0x3E, 0x01, 0x10, 0x00, 0x3E, 0x02, 0x10, 0x00]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();
        let block = vm.compile(4).unwrap();
        assert_eq!(block.instruction_count(), 2);
        assert!(!vm.is_cached(4));

        assert_eq!(vm.execute(&block).unwrap(), ExitReason::Stop);
        assert_eq!(vm.get_state().a, 0x02);
        assert_eq!(vm.get_state().pc, 8);
    }

    #[test]
    fn runtime_calls_see_the_current_cycle_count() {
        // NOP; NOP; LDH A, (0x44); NOP; STOP
        let mut memory = FlatMemory::new(&[0x00, 0x00, 0xF0, 0x44, 0x00, 0x10, 0x00]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();
        assert_eq!(vm.context_cycles(), 0);
        assert_eq!(vm.run().unwrap(), ExitReason::Stop);
        assert_eq!(vm.context_cycles(), 20);
        assert_eq!(vm.get_state().cycles, 28);
    }

    #[test]
    fn failed_translations_are_not_published() {
        // NOP; DAA
        let mut memory = FlatMemory::new(&[0x00, 0x27]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();
        assert!(matches!(
            vm.run(),
            Err(Error::TranslationError(
                dynamic_compiler::Error::UnhandledInstruction { address: 1, .. }
            ))
        ));
        assert!(!vm.is_cached(0));
    }
}
