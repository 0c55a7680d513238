use log::{debug, trace};

use crate::block::{self, CodeBlock, ExecutableBlock, Label, OpCodeStream};
use crate::compiled_block::CompiledBlock;
use crate::config::JitConfig;
use crate::flags::{self, FlagRule, HostFlags};
use crate::interop::{Bridge, Handler};
use crate::memory::TargetAddress;
use crate::memory_access::{self, GuestAddress};
use crate::registers::{
    self, pair, slot, Slot, ACCUMULATOR, ADDRESS, CYCLES, HL, OPERAND, RESULT, STACK_POINTER,
    VALUE,
};
use crate::sm83::opcode::Operation;
use crate::sm83::operands::{AluOp, Condition, Operand8, Reg16, Reg8, ShiftOp};
use crate::sm83::{self, InstrDecoder, Instruction};
use crate::stack;
use crate::virtual_machine::ExitReason;
use crate::x86_asm::arithmetic::AluOp as HostAluOp;
use crate::x86_asm::{
    self, Adc, Add, And, Branch, Cmp, Immediate, Lea, Memory, Mov, Movzx, OpCode, OpSize, Or,
    Rcl, Rcr, Register, Ret, Rol, Ror, Sar, Sbb, Shl, Shr, Sub, Test, UnknownOperand, Xor,
};

#[derive(Debug)]
pub enum Error {
    UnknownOpCode(u8),
    /// The instruction decodes but has no translation
    UnhandledInstruction {
        address: TargetAddress,
        operation: Operation,
    },
    /// The instruction starting at `address` runs past the end of the decode source
    DecodeOverrun { address: TargetAddress },
    Block(block::Error),
}

impl From<sm83::Error> for Error {
    fn from(error: sm83::Error) -> Self {
        match error {
            sm83::Error::UnknownOpCode(opcode) => Error::UnknownOpCode(opcode),
        }
    }
}

impl From<block::Error> for Error {
    fn from(error: block::Error) -> Self {
        Error::Block(error)
    }
}

/// Inputs of one block compilation
pub struct CompileContext<'a> {
    /// Decode source, indexed by guest address
    rom: &'a [u8],
    cursor: usize,
    bridge: Bridge,
}

impl<'a> CompileContext<'a> {
    pub fn new(rom: &'a [u8], start_address: TargetAddress, bridge: Bridge) -> Self {
        Self {
            rom,
            cursor: start_address as usize,
            bridge,
        }
    }
}

/// Where an exit takes the guest next
enum ExitTarget {
    Constant(TargetAddress),
    /// Already in the value register
    Dynamic,
}

/// Byte sized `op A, src`
fn accumulator_operation<const OP: u8>(
    operation: HostAluOp<OP, UnknownOperand>,
    src: Register,
) -> OpCode {
    operation
        .with_register(src)
        .with_op_size(OpSize::Byte)
        .generate()
}

pub struct Compiler<'a> {
    context: CompileContext<'a>,
    config: &'a JitConfig,
    decoder: InstrDecoder,
    block: CodeBlock,
    host_flags: HostFlags,
}

impl<'a> Compiler<'a> {
    /// Constructs a new dynamic re-compiler for the block starting at the context cursor
    pub fn new(context: CompileContext<'a>, config: &'a JitConfig) -> Self {
        let block = CodeBlock::open(context.cursor as TargetAddress);
        Self {
            context,
            config,
            decoder: InstrDecoder::new(),
            block,
            host_flags: HostFlags::Clobbered,
        }
    }

    /// Translates the guest code into one block of native x86-64 code.
    pub fn translate_code(mut self) -> Result<CompiledBlock, Error> {
        let start_address = self.block.start_address();
        let mut instruction_count = 0;

        loop {
            let address = self.context.cursor as TargetAddress;
            let instruction = self.decode_next(address)?;
            if self.config.trace_instructions {
                trace!("{:#06x}: {:?}", address, instruction.operation);
            }

            self.emit_instruction(address, &instruction)?;
            instruction_count += 1;

            if instruction.operation.ends_block() {
                break;
            }
            if instruction_count >= self.config.max_block_instructions
                || self.context.cursor >= self.context.rom.len()
            {
                let next = self.context.cursor as TargetAddress;
                self.emit_exit(ExitTarget::Constant(next), ExitReason::Branch);
                break;
            }
        }

        let guest_size = self.context.cursor - start_address as usize;
        self.block.close(guest_size);
        let (location_range, code) = self.block.finalize();
        let compiled = CompiledBlock::new(
            ExecutableBlock::new(&code)?,
            location_range,
            instruction_count,
        );
        debug!(
            "Compiled block {:#06x}..{:#06x}: {} instructions, {} host bytes",
            location_range.start(),
            location_range.end(),
            instruction_count,
            compiled.host_size()
        );
        Ok(compiled)
    }

    fn decode_next(&mut self, address: TargetAddress) -> Result<Instruction, Error> {
        loop {
            let byte = *self
                .context
                .rom
                .get(self.context.cursor)
                .ok_or(Error::DecodeOverrun { address })?;
            self.context.cursor += 1;
            if let Some(instruction) = self.decoder.feed(byte)? {
                return Ok(instruction);
            }
        }
    }

    fn stream(&mut self) -> &mut OpCodeStream {
        self.block.stream()
    }

    fn emit_instruction(
        &mut self,
        address: TargetAddress,
        instruction: &Instruction,
    ) -> Result<(), Error> {
        let next = address.wrapping_add(instruction.size as u16);
        let cycles = instruction.cycles();
        let bridge = self.context.bridge;
        let flags_before = self.host_flags;
        self.host_flags = HostFlags::Clobbered;

        self.emit_add_cycles(cycles.base);

        match instruction.operation {
            Operation::Nop => {}
            Operation::Stop => self.emit_exit(ExitTarget::Constant(next), ExitReason::Stop),
            Operation::Halt => self.emit_exit(ExitTarget::Constant(next), ExitReason::Halt),
            Operation::Di => self.emit_interrupt_master_enable(false),
            Operation::Ei => self.emit_interrupt_master_enable(true),
            Operation::Daa => {
                return Err(Error::UnhandledInstruction {
                    address,
                    operation: instruction.operation,
                });
            }
            Operation::Cpl => {
                self.stream().push_opcode(
                    Xor::new(ACCUMULATOR)
                        .with_immediate(Immediate::new(0xFF))
                        .with_op_size(OpSize::Dword)
                        .generate(),
                );
            }
            Operation::Scf => {
                flags::emit_set_carry(self.stream());
                self.host_flags = HostFlags::Synced;
            }
            Operation::Ccf => {
                flags::emit_complement_carry(self.stream());
                self.host_flags = HostFlags::Synced;
            }
            Operation::Load(dst, src) => self.emit_load(dst, src),
            Operation::LoadImmediate16(Reg16::SP, value) => {
                stack::emit_load_stack_pointer(self.stream(), &bridge, value);
            }
            Operation::LoadImmediate16(reg, value) => {
                self.stream().push_opcode(
                    Mov::new(pair(reg))
                        .with_immediate(Immediate::new(value as i64))
                        .with_op_size(OpSize::Dword)
                        .generate(),
                );
            }
            Operation::StoreStackPointer(address) => {
                stack::emit_store_stack_pointer(self.stream(), &bridge, address);
            }
            Operation::LoadStackPointerFromHl => {
                stack::emit_load_stack_pointer_from_hl(self.stream(), &bridge);
            }
            Operation::LoadHlFromStackOffset(offset) => {
                stack::emit_load_hl_from_stack_offset(self.stream(), offset);
                self.host_flags = HostFlags::Synced;
            }
            Operation::AddStackPointer(offset) => {
                stack::emit_add_stack_pointer(self.stream(), offset);
                self.host_flags = HostFlags::Synced;
            }
            Operation::Alu(op, src) => self.emit_alu(op, src),
            Operation::Increment(target) => self.emit_increment(target, 1),
            Operation::Decrement(target) => self.emit_increment(target, -1),
            Operation::Increment16(reg) => self.emit_increment_16(reg, 1),
            Operation::Decrement16(reg) => self.emit_increment_16(reg, -1),
            Operation::AddHl(reg) => self.emit_add_hl(reg),
            Operation::RotateAccumulator(op) => self.emit_rotate_accumulator(op),
            Operation::Shift(op, target) => self.emit_shift(op, target),
            Operation::Bit(bit, target) => {
                let value = self.emit_read_operand(target);
                self.stream().push_opcode(
                    Test::new(value)
                        .with_immediate(Immediate::new(1 << bit))
                        .with_op_size(OpSize::Byte)
                        .generate(),
                );
                flags::emit_update(self.stream(), FlagRule::ZeroKeepCarry);
                self.host_flags = HostFlags::Synced;
            }
            Operation::Reset(bit, target) => {
                self.emit_read_modify_write(target, None, |stream, value| {
                    stream.push_opcode(
                        And::new(value)
                            .with_immediate(Immediate::new(!(1u8 << bit) as i64))
                            .with_op_size(OpSize::Byte)
                            .generate(),
                    );
                });
            }
            Operation::Set(bit, target) => {
                self.emit_read_modify_write(target, None, |stream, value| {
                    stream.push_opcode(
                        Or::new(value)
                            .with_immediate(Immediate::new(1 << bit))
                            .with_op_size(OpSize::Byte)
                            .generate(),
                    );
                });
            }
            Operation::Jump(condition, target) => {
                self.emit_jump(flags_before, condition, target, cycles.branch_taken);
            }
            Operation::JumpRelative(condition, offset) => {
                let target = next.wrapping_add(offset as i16 as u16);
                self.emit_jump(flags_before, condition, target, cycles.branch_taken);
            }
            Operation::JumpHl => {
                registers::emit_load_16(self.stream(), Reg16::HL, VALUE);
                self.emit_exit(ExitTarget::Dynamic, ExitReason::Branch);
            }
            Operation::Call(condition, target) => {
                let skip = condition.map(|cond| self.emit_skip_unless(flags_before, cond, false));
                if skip.is_some() {
                    self.emit_add_cycles(cycles.branch_taken);
                }
                self.emit_call(next, target);
                self.bind_skip(skip);
            }
            Operation::Return(condition) => {
                let skip = condition.map(|cond| self.emit_skip_unless(flags_before, cond, false));
                if skip.is_some() {
                    self.emit_add_cycles(cycles.branch_taken);
                }
                self.emit_return();
                self.bind_skip(skip);
            }
            Operation::ReturnInterrupt => {
                self.emit_interrupt_master_enable(true);
                self.emit_return();
            }
            Operation::Restart(vector) => self.emit_call(next, vector as TargetAddress),
            Operation::Push(pair) => stack::emit_push(self.stream(), &bridge, pair),
            Operation::Pop(pair) => stack::emit_pop(self.stream(), &bridge, pair),
        }

        if Self::is_flag_neutral(&instruction.operation) {
            self.host_flags = flags_before;
        }
        Ok(())
    }

    /// Operations whose emitted code never touches the host flags
    fn is_flag_neutral(operation: &Operation) -> bool {
        let neutral_operand = |operand: &Operand8| match operand {
            Operand8::Register(reg) => !matches!(slot(*reg), Slot::High(_)),
            Operand8::Immediate(_) => true,
            _ => false,
        };
        match operation {
            Operation::Nop
            | Operation::LoadImmediate16(..)
            | Operation::Increment16(_)
            | Operation::Decrement16(_) => true,
            Operation::Load(dst, src) => neutral_operand(dst) && neutral_operand(src),
            _ => false,
        }
    }

    fn emit_add_cycles(&mut self, cycles: u32) {
        if cycles == 0 {
            return;
        }
        self.stream().push_opcode(
            Lea::new(CYCLES, Memory::base(CYCLES).with_displacement(cycles as i32)).generate(),
        );
    }

    fn emit_exit(&mut self, target: ExitTarget, reason: ExitReason) {
        if let ExitTarget::Constant(address) = target {
            self.stream().push_opcode(
                Mov::new(VALUE)
                    .with_immediate(Immediate::new(address as i64))
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
        }
        self.stream().push_opcode(
            Mov::new(RESULT)
                .with_immediate(Immediate::new(reason as i64))
                .with_op_size(OpSize::Dword)
                .generate(),
        );
        self.stream().push_opcode(Ret::new().generate());
    }

    fn emit_interrupt_master_enable(&mut self, enabled: bool) {
        let bridge = self.context.bridge;
        self.stream().push_opcode(
            Mov::new(ADDRESS)
                .with_immediate(Immediate::new(enabled as i64))
                .with_op_size(OpSize::Dword)
                .generate(),
        );
        bridge.emit_call(self.stream(), Handler::InterruptMasterEnable);
    }

    fn host_condition(condition: Condition) -> x86_asm::Condition {
        match condition {
            Condition::NotZero => x86_asm::Condition::NotEqual,
            Condition::Zero => x86_asm::Condition::Equal,
            Condition::NotCarry => x86_asm::Condition::AboveOrEqual,
            Condition::Carry => x86_asm::Condition::Below,
        }
    }

    /// Branches over the code that follows unless the guest condition holds. The host flags are
    /// reloaded from ShadowFlags first if anything clobbered them since the last flag update.
    fn emit_skip_unless(
        &mut self,
        flags_before: HostFlags,
        condition: Condition,
        short: bool,
    ) -> Label {
        if flags_before == HostFlags::Clobbered {
            flags::emit_sync(self.stream());
        }
        let skip = self.stream().create_label();
        let branch = Branch::new().with_condition(Self::host_condition(condition).invert());
        let branch = if short { branch.short() } else { branch };
        self.stream().push_branch(branch, skip);
        skip
    }

    /// Ends the side exit of a conditional branch. Falling through leaves the flags untouched.
    fn bind_skip(&mut self, skip: Option<Label>) {
        if let Some(skip) = skip {
            self.stream().bind_label(skip);
            self.host_flags = HostFlags::Synced;
        }
    }

    fn emit_jump(
        &mut self,
        flags_before: HostFlags,
        condition: Option<Condition>,
        target: TargetAddress,
        taken_cycles: u32,
    ) {
        // The side exit is only a few bytes, so a short branch always reaches
        let skip = condition.map(|cond| self.emit_skip_unless(flags_before, cond, true));
        if skip.is_some() {
            self.emit_add_cycles(taken_cycles);
        }
        self.emit_exit(ExitTarget::Constant(target), ExitReason::Branch);
        self.bind_skip(skip);
    }

    fn emit_call(&mut self, return_address: TargetAddress, target: TargetAddress) {
        let bridge = self.context.bridge;
        self.stream().push_opcode(
            Mov::new(VALUE)
                .with_immediate(Immediate::new(return_address as i64))
                .with_op_size(OpSize::Dword)
                .generate(),
        );
        stack::emit_push_value(self.stream(), &bridge);
        self.emit_exit(ExitTarget::Constant(target), ExitReason::Branch);
    }

    fn emit_return(&mut self) {
        let bridge = self.context.bridge;
        stack::emit_pop_value(self.stream(), &bridge);
        self.stream().push_opcode(
            Mov::new(VALUE)
                .with_register(RESULT)
                .with_op_size(OpSize::Dword)
                .generate(),
        );
        self.emit_exit(ExitTarget::Dynamic, ExitReason::Branch);
    }

    /// Puts the guest address of a memory operand in the address register, if not constant
    fn emit_operand_address(&mut self, operand: Operand8) -> GuestAddress {
        let mov_address = |reg: Register| {
            Mov::new(ADDRESS)
                .with_register(reg)
                .with_op_size(OpSize::Dword)
                .generate()
        };
        match operand {
            Operand8::IndirectHl | Operand8::IndirectHlIncrement | Operand8::IndirectHlDecrement => {
                self.stream().push_opcode(mov_address(HL));
                GuestAddress::Dynamic
            }
            Operand8::Indirect(reg) => {
                self.stream().push_opcode(mov_address(pair(reg)));
                GuestAddress::Dynamic
            }
            Operand8::Absolute(address) => GuestAddress::Constant(address),
            Operand8::HighAbsolute(offset) => GuestAddress::Constant(0xFF00 | offset as u16),
            Operand8::HighC => {
                registers::emit_load_8(self.stream(), Reg8::C, ADDRESS);
                self.stream().push_opcode(
                    Or::new(ADDRESS)
                        .with_immediate(Immediate::new(0xFF00))
                        .with_op_size(OpSize::Dword)
                        .generate(),
                );
                GuestAddress::Dynamic
            }
            Operand8::Register(_) | Operand8::Immediate(_) => {
                unreachable!("{:?} is not a memory operand", operand)
            }
        }
    }

    /// HL+ and HL- adjust HL once the access is done
    fn emit_operand_post_access(&mut self, operand: Operand8) {
        let delta = match operand {
            Operand8::IndirectHlIncrement => 1,
            Operand8::IndirectHlDecrement => -1,
            _ => return,
        };
        self.emit_adjust_pair(HL, delta);
    }

    fn emit_adjust_pair(&mut self, reg: Register, delta: i32) {
        self.stream().push_opcode(
            Lea::new(reg, Memory::base(reg).with_displacement(delta))
                .with_op_size(OpSize::Dword)
                .generate(),
        );
        self.stream()
            .push_opcode(Movzx::new(reg).with_register(reg).from_word().generate());
    }

    /// Fetches an 8 bit operand and returns the register holding it, zero-extended
    fn emit_read_operand(&mut self, operand: Operand8) -> Register {
        match operand {
            Operand8::Register(reg) => {
                registers::emit_load_8(self.stream(), reg, OPERAND);
                OPERAND
            }
            Operand8::Immediate(value) => {
                self.stream().push_opcode(
                    Mov::new(OPERAND)
                        .with_immediate(Immediate::new(value as i64))
                        .with_op_size(OpSize::Dword)
                        .generate(),
                );
                OPERAND
            }
            _ => {
                let bridge = self.context.bridge;
                let address = self.emit_operand_address(operand);
                memory_access::emit_read_8(self.stream(), &bridge, address);
                self.emit_operand_post_access(operand);
                RESULT
            }
        }
    }

    /// Stores the low byte of `value` into an 8 bit operand
    fn emit_write_operand(&mut self, operand: Operand8, value: Register) {
        match operand {
            Operand8::Register(reg) => registers::emit_store_8(self.stream(), reg, value),
            Operand8::Immediate(_) => unreachable!("Immediates cannot be written"),
            _ => {
                let bridge = self.context.bridge;
                if value != VALUE {
                    self.stream().push_opcode(
                        Mov::new(VALUE)
                            .with_register(value)
                            .with_op_size(OpSize::Dword)
                            .generate(),
                    );
                }
                let address = self.emit_operand_address(operand);
                memory_access::emit_write_8(self.stream(), &bridge, address);
                self.emit_operand_post_access(operand);
            }
        }
    }

    fn emit_load(&mut self, dst: Operand8, src: Operand8) {
        let value = self.emit_read_operand(src);
        self.emit_write_operand(dst, value);
    }

    /// Reads the target, lets `operation` modify the value in its register, and writes it back.
    /// With a flag rule, `operation` must end with a flag capture. Register results are written
    /// back before the commit, memory results after it since the store may call the runtime.
    fn emit_read_modify_write(
        &mut self,
        target: Operand8,
        rule: Option<FlagRule>,
        operation: impl FnOnce(&mut OpCodeStream, Register),
    ) {
        let value = self.emit_read_operand(target);
        operation(self.stream(), value);
        match (rule, target.is_memory()) {
            (Some(rule), false) => {
                self.emit_write_operand(target, value);
                flags::emit_commit(self.stream(), rule);
                self.host_flags = HostFlags::Synced;
            }
            (Some(rule), true) => {
                flags::emit_commit(self.stream(), rule);
                self.emit_write_operand(target, value);
            }
            (None, _) => self.emit_write_operand(target, value),
        }
    }

    fn emit_alu(&mut self, op: AluOp, src: Operand8) {
        let value = self.emit_read_operand(src);
        if matches!(op, AluOp::Adc | AluOp::Sbc) {
            flags::emit_load_carry(self.stream());
        }
        let opcode = match op {
            AluOp::Add => accumulator_operation(Add::new(ACCUMULATOR), value),
            AluOp::Adc => accumulator_operation(Adc::new(ACCUMULATOR), value),
            AluOp::Sub => accumulator_operation(Sub::new(ACCUMULATOR), value),
            AluOp::Sbc => accumulator_operation(Sbb::new(ACCUMULATOR), value),
            AluOp::And => accumulator_operation(And::new(ACCUMULATOR), value),
            AluOp::Xor => accumulator_operation(Xor::new(ACCUMULATOR), value),
            AluOp::Or => accumulator_operation(Or::new(ACCUMULATOR), value),
            AluOp::Cp => accumulator_operation(Cmp::new(ACCUMULATOR), value),
        };
        self.stream().push_opcode(opcode);
        flags::emit_update(self.stream(), FlagRule::ZeroAndCarry);
        self.host_flags = HostFlags::Synced;
    }

    fn emit_increment(&mut self, target: Operand8, delta: i64) {
        self.emit_read_modify_write(target, Some(FlagRule::ZeroKeepCarry), |stream, value| {
            stream.push_opcode(
                Add::new(value)
                    .with_immediate(Immediate::new(delta))
                    .with_op_size(OpSize::Byte)
                    .generate(),
            );
            flags::emit_capture(stream);
        });
    }

    fn emit_increment_16(&mut self, reg: Reg16, delta: i32) {
        match reg {
            Reg16::SP => {
                self.stream().push_opcode(
                    Lea::new(RESULT, Memory::base(STACK_POINTER).with_displacement(delta))
                        .with_op_size(OpSize::Dword)
                        .generate(),
                );
                registers::emit_store_16(self.stream(), Reg16::SP, RESULT);
            }
            _ => self.emit_adjust_pair(pair(reg), delta),
        }
    }

    fn emit_add_hl(&mut self, reg: Reg16) {
        registers::emit_load_16(self.stream(), Reg16::HL, RESULT);
        self.stream().push_opcode(
            Add::new(RESULT)
                .with_register(pair(reg))
                .with_op_size(OpSize::Word)
                .generate(),
        );
        flags::emit_capture(self.stream());
        registers::emit_store_16(self.stream(), Reg16::HL, RESULT);
        flags::emit_commit(self.stream(), FlagRule::CarryKeepZero);
        self.host_flags = HostFlags::Synced;
    }

    fn emit_rotate_accumulator(&mut self, op: ShiftOp) {
        let stream = self.stream();
        let rotate = match op {
            ShiftOp::Rlc => Rol::new(ACCUMULATOR, 1).with_op_size(OpSize::Byte).generate(),
            ShiftOp::Rrc => Ror::new(ACCUMULATOR, 1).with_op_size(OpSize::Byte).generate(),
            ShiftOp::Rl => Rcl::new(ACCUMULATOR, 1).with_op_size(OpSize::Byte).generate(),
            _ => Rcr::new(ACCUMULATOR, 1).with_op_size(OpSize::Byte).generate(),
        };
        if matches!(op, ShiftOp::Rl | ShiftOp::Rr) {
            flags::emit_load_carry(stream);
        }
        stream.push_opcode(rotate);
        flags::emit_update(stream, FlagRule::CarryClearZero);
        self.host_flags = HostFlags::Synced;
    }

    fn emit_shift(&mut self, op: ShiftOp, target: Operand8) {
        self.emit_read_modify_write(target, Some(FlagRule::ZeroAndCarry), |stream, value| {
            let byte = OpSize::Byte;
            match op {
                ShiftOp::Rlc | ShiftOp::Rrc | ShiftOp::Rl | ShiftOp::Rr => {
                    let rotate = match op {
                        ShiftOp::Rlc => Rol::new(value, 1).with_op_size(byte).generate(),
                        ShiftOp::Rrc => Ror::new(value, 1).with_op_size(byte).generate(),
                        ShiftOp::Rl => Rcl::new(value, 1).with_op_size(byte).generate(),
                        _ => Rcr::new(value, 1).with_op_size(byte).generate(),
                    };
                    if matches!(op, ShiftOp::Rl | ShiftOp::Rr) {
                        flags::emit_load_carry(stream);
                    }
                    stream.push_opcode(rotate);
                    flags::emit_capture(stream);
                    flags::emit_capture_zero_of(stream, value);
                }
                ShiftOp::Sla => {
                    stream.push_opcode(Shl::new(value, 1).with_op_size(byte).generate());
                    flags::emit_capture(stream);
                }
                ShiftOp::Sra => {
                    stream.push_opcode(Sar::new(value, 1).with_op_size(byte).generate());
                    flags::emit_capture(stream);
                }
                ShiftOp::Srl => {
                    stream.push_opcode(Shr::new(value, 1).with_op_size(byte).generate());
                    flags::emit_capture(stream);
                }
                ShiftOp::Swap => {
                    stream.push_opcode(Rol::new(value, 4).with_op_size(byte).generate());
                    stream.push_opcode(
                        Test::new(value)
                            .with_register(value)
                            .with_op_size(byte)
                            .generate(),
                    );
                    flags::emit_capture(stream);
                }
            }
        });
    }
}


#[cfg(all(test, target_arch = "x86_64"))]
mod execution_test {
    use crate::flags::{GUEST_CARRY, GUEST_ZERO};
    use crate::testing::{run_until_stop, Access, FlatMemory};
    use crate::virtual_machine::{ExitReason, VirtualMachine, VmState};

    fn run(memory: &mut FlatMemory, state: VmState) -> VmState {
        let mut vm = VirtualMachine::new(memory).unwrap();
        *vm.get_mut_state() = state;
        run_until_stop(&mut vm);
        vm.get_state().clone()
    }

    #[test]
    fn increment_keeps_carry_for_fused_branch() {
        // 0x00: SCF
        // 0x01: LD B, 0xFF
        // 0x03: INC B
        // 0x04: JR C, +2
        // 0x06: STOP
        // 0x08: LD A, 0x42
        // 0x0A: STOP
        let mut memory = FlatMemory::new(&[
            0x37, 0x06, 0xFF, 0x04, 0x38, 0x02, 0x10, 0x00, 0x3E, 0x42, 0x10, 0x00,
        ]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0x42);
        assert_eq!(state.bc, 0x0000);
        assert_eq!(state.f, GUEST_ZERO as u64 | GUEST_CARRY as u64);
        assert_eq!(state.pc, 0x0C);
    }

    #[test]
    fn increment_clears_zero_and_keeps_carry() {
        // LD A, 0x01; ADD A, 0xFF; INC A; JR NC, +2; STOP
        let mut memory = FlatMemory::new(&[0x3E, 0x01, 0xC6, 0xFF, 0x3C, 0x30, 0x02, 0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0x01);
        assert_eq!(state.f, GUEST_CARRY as u64);
        assert_eq!(state.pc, 0x09);
    }

    #[test]
    fn decrement_sets_zero() {
        // LD C, 0x01; DEC C; JR Z, +2; STOP; STOP
        let mut memory = FlatMemory::new(&[0x0E, 0x01, 0x0D, 0x28, 0x02, 0x10, 0x00, 0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.bc, 0x0000);
        assert_eq!(state.f, GUEST_ZERO as u64);
        assert_eq!(state.pc, 0x09);
    }

    #[test]
    fn add_hl_keeps_zero() {
        // XOR A; LD HL, 0x8000; LD BC, 0x8001; ADD HL, BC; STOP
        let mut memory = FlatMemory::new(&[
            0xAF, 0x21, 0x00, 0x80, 0x01, 0x01, 0x80, 0x09, 0x10, 0x00,
        ]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.hl, 0x0001);
        assert_eq!(state.f, GUEST_ZERO as u64 | GUEST_CARRY as u64);
        assert_eq!(state.cycles, 4 + 12 + 12 + 8 + 4);
    }

    #[test]
    fn add_with_carry_and_compare() {
        // SCF; LD A, 0x0F; ADC A, 0xF0; CP 0x00; STOP
        let mut memory = FlatMemory::new(&[0x37, 0x3E, 0x0F, 0xCE, 0xF0, 0xFE, 0x00, 0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0x00);
        assert_eq!(state.f, GUEST_ZERO as u64);

        // SCF; LD A, 0x10; LD B, 0x0F; SBC A, B; STOP
        let mut memory = FlatMemory::new(&[0x37, 0x3E, 0x10, 0x06, 0x0F, 0x98, 0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0x00);
        assert_eq!(state.f, GUEST_ZERO as u64);
    }

    #[test]
    fn rotates_through_carry() {
        // LD C, 0x80; RL C; STOP
        let mut memory = FlatMemory::new(&[0x0E, 0x80, 0xCB, 0x11, 0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.bc, 0x0000);
        assert_eq!(state.f, GUEST_ZERO as u64 | GUEST_CARRY as u64);

        // RLA never sets Z
        // LD A, 0x80; RLA; STOP
        let mut memory = FlatMemory::new(&[0x3E, 0x80, 0x17, 0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0x00);
        assert_eq!(state.f, GUEST_CARRY as u64);
    }

    #[test]
    fn swap_set_reset_and_bit() {
        // LD D, 0x12; SWAP D; SET 1, D; RES 5, D; SCF; BIT 7, D; STOP
        let mut memory = FlatMemory::new(&[
            0x16, 0x12, 0xCB, 0x32, 0xCB, 0xCA, 0xCB, 0xAA, 0x37, 0xCB, 0x7A, 0x10, 0x00,
        ]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.de, 0x0300);
        assert_eq!(state.f, GUEST_ZERO as u64 | GUEST_CARRY as u64);
    }

    #[test]
    fn read_modify_write_on_memory() {
        // LD HL, 0xC000; INC (HL); SRL (HL); STOP
        let mut memory = FlatMemory::new(&[0x21, 0x00, 0xC0, 0x34, 0xCB, 0x3E, 0x10, 0x00])
            .with_data(0xC000, &[0xFF]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(memory.read(0xC000), 0x00);
        assert_eq!(state.f, GUEST_ZERO as u64);
        assert!(memory.accesses.is_empty());
    }

    #[test]
    fn fast_path_write_needs_no_runtime_call() {
        // LD HL, 0x9000; LD (HL), 0xAA; LD A, (HL); STOP
        let mut memory = FlatMemory::new(&[0x21, 0x00, 0x90, 0x36, 0xAA, 0x7E, 0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0xAA);
        assert_eq!(memory.read(0x9000), 0xAA);
        assert!(memory.accesses.is_empty());
    }

    #[test]
    fn banking_writes_reach_the_runtime() {
        // LD HL, 0x0001; LD (HL), 0x5A; STOP
        let mut memory = FlatMemory::new(&[0x21, 0x01, 0x00, 0x36, 0x5A, 0x10, 0x00]);
        run(&mut memory, VmState::default());
        assert_eq!(memory.accesses, vec![(Access::Write8(0x0001, 0x5A), 24)]);
    }

    #[test]
    fn handlers_see_the_elapsed_cycles() {
        // NOP; NOP; LDH A, (0x44); STOP
        let mut memory =
            FlatMemory::new(&[0x00, 0x00, 0xF0, 0x44, 0x10, 0x00]).with_data(0xFF44, &[0x90]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0x90);
        assert_eq!(memory.accesses, vec![(Access::Read8(0xFF44), 20)]);
    }

    #[test]
    fn high_page_through_c() {
        // LD C, 0x80; LD A, 0x33; LD (C), A; STOP
        let mut memory = FlatMemory::new(&[0x0E, 0x80, 0x3E, 0x33, 0xE2, 0x10, 0x00]);
        run(&mut memory, VmState::default());
        assert_eq!(memory.slow_accesses(), vec![Access::Write8(0xFF80, 0x33)]);
    }

    #[test]
    fn hl_post_increment_and_decrement() {
        // LD HL, 0xC000; LD A, 0x11; LD (HL+), A; LD A, (HL-); STOP
        let mut memory = FlatMemory::new(&[0x21, 0x00, 0xC0, 0x3E, 0x11, 0x22, 0x3A, 0x10, 0x00])
            .with_data(0xC001, &[0x77]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(memory.read(0xC000), 0x11);
        assert_eq!(state.a, 0x77);
        assert_eq!(state.hl, 0xC000);
    }

    #[test]
    fn push_and_pop_in_high_ram() {
        // LD SP, 0xFFFE; LD BC, 0x1234; PUSH BC; LD BC, 0x0000; POP BC; STOP
        let mut memory = FlatMemory::new(&[
            0x31, 0xFE, 0xFF, 0x01, 0x34, 0x12, 0xC5, 0x01, 0x00, 0x00, 0xC1, 0x10, 0x00,
        ]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.bc, 0x1234);
        assert_eq!(state.sp, 0xFFFE);
        assert_eq!(memory.read(0xFFFC), 0x34);
        assert_eq!(memory.read(0xFFFD), 0x12);
        assert!(memory.accesses.is_empty());
    }

    #[test]
    fn push_and_pop_through_the_runtime() {
        // LD SP, 0xD000; LD DE, 0xBEEF; PUSH DE; POP HL; STOP
        let mut memory =
            FlatMemory::new(&[0x31, 0x00, 0xD0, 0x11, 0xEF, 0xBE, 0xD5, 0xE1, 0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.hl, 0xBEEF);
        assert_eq!(state.sp, 0xD000);
        assert_eq!(
            memory.slow_accesses(),
            vec![Access::Write16(0xCFFE, 0xBEEF), Access::Read16(0xCFFE)]
        );
    }

    #[test]
    fn pop_af_replaces_the_flags() {
        // LD SP, 0xFFF0; LD BC, 0x12F0; PUSH BC; POP AF; PUSH AF; POP DE; STOP
        let mut memory = FlatMemory::new(&[
            0x31, 0xF0, 0xFF, 0x01, 0xF0, 0x12, 0xC5, 0xF1, 0xF5, 0xD1, 0x10, 0x00,
        ]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0x12);
        assert_eq!(state.f, GUEST_ZERO as u64 | GUEST_CARRY as u64);
        assert_eq!(state.de, 0x1290);
    }

    #[test]
    fn pop_af_through_the_runtime() {
        // LD SP, 0xD000; LD BC, 0x12F0; PUSH BC; POP AF; PUSH AF; POP DE; STOP
        let mut memory = FlatMemory::new(&[
            0x31, 0x00, 0xD0, 0x01, 0xF0, 0x12, 0xC5, 0xF1, 0xF5, 0xD1, 0x10, 0x00,
        ]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0x12);
        assert_eq!(state.f, GUEST_ZERO as u64 | GUEST_CARRY as u64);
        assert_eq!(state.de, 0x1290);
        assert_eq!(state.sp, 0xD000);
        assert_eq!(
            memory.slow_accesses(),
            vec![
                Access::Write16(0xCFFE, 0x12F0),
                Access::Read16(0xCFFE),
                Access::Write16(0xCFFE, 0x1290),
                Access::Read16(0xCFFE),
            ]
        );
    }

    #[test]
    fn stack_wraps_around_the_address_space() {
        // PUSH BC; LD BC, 0x0000; POP BC; STOP
        let mut memory = FlatMemory::new(&[0xC5, 0x01, 0x00, 0x00, 0xC1, 0x10, 0x00]);
        let state = run(
            &mut memory,
            VmState {
                bc: 0xA55A,
                sp: 0x0001,
                ..VmState::default()
            },
        );
        assert_eq!(state.bc, 0xA55A);
        assert_eq!(state.sp, 0x0001);
        assert_eq!(
            memory.slow_accesses(),
            vec![Access::Write16(0xFFFF, 0xA55A), Access::Read16(0xFFFF)]
        );
    }

    #[test]
    fn pop_at_the_top_of_memory_uses_the_runtime() {
        // POP DE; STOP
        let mut memory = FlatMemory::new(&[0xD1, 0x10, 0x00]).with_data(0xFFFF, &[0xEF]);
        let state = run(
            &mut memory,
            VmState {
                sp: 0xFFFF,
                ..VmState::default()
            },
        );
        assert_eq!(state.de, 0xD1EF);
        assert_eq!(state.sp, 0x0001);
        assert_eq!(memory.slow_accesses(), vec![Access::Read16(0xFFFF)]);
    }

    #[test]
    fn load_hl_from_stack_offset() {
        for (offset, hl, f) in [
            (0x00u8, 0xFFF8, 0),
            (0x05, 0xFFFD, 0),
            (0xFB, 0xFFF3, GUEST_CARRY as u64),
        ] {
            // LD SP, 0xFFF8; LD HL, SP+e; STOP
            let mut memory = FlatMemory::new(&[0x31, 0xF8, 0xFF, 0xF8, offset, 0x10, 0x00]);
            let state = run(
                &mut memory,
                VmState {
                    f: GUEST_ZERO as u64,
                    ..VmState::default()
                },
            );
            assert_eq!(state.hl, hl, "offset {:#04x}", offset);
            assert_eq!(state.f, f, "offset {:#04x}", offset);
            assert_eq!(state.sp, 0xFFF8);
        }
    }

    #[test]
    fn add_stack_pointer_and_store_it() {
        // LD SP, 0xC000; ADD SP, -2; LD (0xC100), SP; LD HL, 0xC010; LD SP, HL; INC SP; STOP
        let mut memory = FlatMemory::new(&[
            0x31, 0x00, 0xC0, 0xE8, 0xFE, 0x08, 0x00, 0xC1, 0x21, 0x10, 0xC0, 0xF9, 0x33, 0x10,
            0x00,
        ]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(memory.read(0xC100), 0xFE);
        assert_eq!(memory.read(0xC101), 0xBF);
        assert_eq!(state.sp, 0xC011);
        assert_eq!(state.f, 0);
    }

    #[test]
    fn call_and_return() {
        // 0x00: LD SP, 0xFFFE
        // 0x03: CALL 0x0010
        // 0x06: STOP
        // 0x10: LD A, 0x99
        // 0x12: RET
        let mut memory = FlatMemory::new(&[0x31, 0xFE, 0xFF, 0xCD, 0x10, 0x00, 0x10, 0x00])
            .with_data(0x10, &[0x3E, 0x99, 0xC9]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();
        assert_eq!(vm.run().unwrap(), ExitReason::Branch);
        assert_eq!(vm.get_state().pc, 0x10);
        assert_eq!(vm.get_state().sp, 0xFFFC);

        assert_eq!(run_until_stop(&mut vm), 2);
        assert_eq!(vm.get_state().a, 0x99);
        assert_eq!(vm.get_state().sp, 0xFFFE);
        assert_eq!(vm.get_state().pc, 0x08);
        assert_eq!(vm.get_state().cycles, 12 + 24 + 8 + 16 + 4);
    }

    #[test]
    fn conditional_call_adds_taken_cycles() {
        // LD SP, 0xFFFE; XOR A; CALL NZ, 0x0100; CALL Z, 0x0100
        let mut memory =
            FlatMemory::new(&[0x31, 0xFE, 0xFF, 0xAF, 0xC4, 0x00, 0x01, 0xCC, 0x00, 0x01]);
        let mut vm = VirtualMachine::new(&mut memory).unwrap();
        assert_eq!(vm.run().unwrap(), ExitReason::Branch);
        assert_eq!(vm.get_state().pc, 0x0100);
        assert_eq!(vm.get_state().cycles, 12 + 4 + 12 + 24);
    }

    #[test]
    fn restart_and_jump_hl() {
        // LD SP, 0xFFFE; RST 0x18
        let mut memory = FlatMemory::new(&[0x31, 0xFE, 0xFF, 0xDF])
            // LD HL, 0x0040; JP HL
            .with_data(0x18, &[0x21, 0x40, 0x00, 0xE9])
            // STOP
            .with_data(0x40, &[0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.pc, 0x42);
        assert_eq!(state.sp, 0xFFFC);
        assert_eq!(memory.read(0xFFFC), 0x04);
    }

    #[test]
    fn interrupt_master_enable_calls() {
        // EI; DI; STOP
        let mut memory = FlatMemory::new(&[0xFB, 0xF3, 0x10, 0x00]);
        run(&mut memory, VmState::default());
        assert_eq!(
            memory.accesses,
            vec![
                (Access::InterruptMasterEnable(true), 4),
                (Access::InterruptMasterEnable(false), 8)
            ]
        );
    }

    #[test]
    fn complement_keeps_flags() {
        // SCF; LD A, 0x0F; CPL; CCF; STOP
        let mut memory = FlatMemory::new(&[0x37, 0x3E, 0x0F, 0x2F, 0x3F, 0x10, 0x00]);
        let state = run(&mut memory, VmState::default());
        assert_eq!(state.a, 0xF0);
        assert_eq!(state.f, 0);
    }
}
