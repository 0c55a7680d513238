//! Stack operations. The guest SP lives biased in a host register (`window base | SP`), so the
//! high RAM fast path is a plain store or load through it.

use crate::block::OpCodeStream;
use crate::flags::{self, FlagRule};
use crate::interop::{Bridge, Handler};
use crate::memory_access::{emit_write_16, GuestAddress};
use crate::registers::{
    self, ACCUMULATOR, ADDRESS, HL, OPERAND, RESULT, STACK_POINTER, VALUE,
};
use crate::sm83::operands::{Reg16, StackPair};
use crate::x86_asm::{
    Add, Branch, Cmp, Condition, Immediate, Lea, Memory, Mov, Movzx, OpSize, Or, Register, Shl,
    Shr, Store, Sub,
};

/// Lowest SP served by the fast path. High RAM has no I/O aliasing and no banking.
pub const HIGH_RAM_START: u32 = 0xFF80;

fn emit_load_unbiased_sp(stream: &mut OpCodeStream, dst: Register) {
    stream.push_opcode(
        Movzx::new(dst)
            .with_register(STACK_POINTER)
            .from_word()
            .generate(),
    );
}

fn emit_compare(stream: &mut OpCodeStream, reg: Register, value: u32) {
    stream.push_opcode(
        Cmp::new(reg)
            .with_immediate(Immediate::new(value as i64))
            .with_op_size(OpSize::Dword)
            .generate(),
    );
}

/// Pushes the low word of rdx. Clobbers the host flags.
pub fn emit_push_value(stream: &mut OpCodeStream, bridge: &Bridge) {
    let slow_path = stream.create_label();
    let done = stream.create_label();

    emit_load_unbiased_sp(stream, OPERAND);
    stream.push_opcode(
        Sub::new(STACK_POINTER)
            .with_immediate(Immediate::new(2))
            .with_op_size(OpSize::Word)
            .generate(),
    );
    emit_compare(stream, OPERAND, HIGH_RAM_START);
    stream.push_branch(Branch::new().with_condition(Condition::Below), slow_path);

    stream.push_opcode(
        Store::new(Memory::base(STACK_POINTER), VALUE)
            .with_op_size(OpSize::Word)
            .generate(),
    );
    stream.push_branch(Branch::new(), done);

    stream.bind_label(slow_path);
    emit_load_unbiased_sp(stream, ADDRESS);
    bridge.emit_call(stream, Handler::Write16);
    stream.bind_label(done);
}

/// Pops a word into rax, zero-extended. Clobbers the host flags.
pub fn emit_pop_value(stream: &mut OpCodeStream, bridge: &Bridge) {
    let slow_path = stream.create_label();
    let done = stream.create_label();

    emit_load_unbiased_sp(stream, OPERAND);
    emit_compare(stream, OPERAND, HIGH_RAM_START);
    stream.push_branch(Branch::new().with_condition(Condition::Below), slow_path);
    // The second byte of SP = 0xFFFF lies outside of the window
    emit_compare(stream, OPERAND, 0xFFFF);
    stream.push_branch(Branch::new().with_condition(Condition::Equal), slow_path);

    stream.push_opcode(
        Movzx::new(RESULT)
            .with_memory(Memory::base(STACK_POINTER))
            .from_word()
            .generate(),
    );
    stream.push_branch(Branch::new(), done);

    stream.bind_label(slow_path);
    stream.push_opcode(
        Mov::new(ADDRESS)
            .with_register(OPERAND)
            .with_op_size(OpSize::Dword)
            .generate(),
    );
    bridge.emit_call(stream, Handler::Read16);
    stream.push_opcode(
        Movzx::new(RESULT)
            .with_register(RESULT)
            .from_word()
            .generate(),
    );

    stream.bind_label(done);
    stream.push_opcode(
        Add::new(STACK_POINTER)
            .with_immediate(Immediate::new(2))
            .with_op_size(OpSize::Word)
            .generate(),
    );
}

/// PUSH rr
pub fn emit_push(stream: &mut OpCodeStream, bridge: &Bridge, pair: StackPair) {
    match pair {
        StackPair::BC => registers::emit_load_16(stream, Reg16::BC, VALUE),
        StackPair::DE => registers::emit_load_16(stream, Reg16::DE, VALUE),
        StackPair::HL => registers::emit_load_16(stream, Reg16::HL, VALUE),
        StackPair::AF => {
            stream.push_opcode(
                Mov::new(VALUE)
                    .with_register(ACCUMULATOR)
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
            stream.push_opcode(Shl::new(VALUE, 8).with_op_size(OpSize::Dword).generate());
            flags::emit_shadow_to_guest(stream, RESULT, OPERAND);
            stream.push_opcode(
                Or::new(VALUE)
                    .with_register(RESULT)
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
        }
    }
    emit_push_value(stream, bridge);
}

/// POP rr. POP AF also replaces the guest flags.
pub fn emit_pop(stream: &mut OpCodeStream, bridge: &Bridge, pair: StackPair) {
    emit_pop_value(stream, bridge);
    match pair {
        StackPair::BC => registers::emit_store_16(stream, Reg16::BC, RESULT),
        StackPair::DE => registers::emit_store_16(stream, Reg16::DE, RESULT),
        StackPair::HL => registers::emit_store_16(stream, Reg16::HL, RESULT),
        StackPair::AF => {
            stream.push_opcode(
                Mov::new(OPERAND)
                    .with_register(RESULT)
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
            stream.push_opcode(Shr::new(OPERAND, 8).with_op_size(OpSize::Dword).generate());
            stream.push_opcode(
                Mov::new(ACCUMULATOR)
                    .with_register(OPERAND)
                    .with_op_size(OpSize::Dword)
                    .generate(),
            );
            flags::emit_guest_to_shadow(stream, RESULT, OPERAND);
        }
    }
}

/// Adds `offset` to the low byte of SP in rax to obtain the guest carry. Z is always cleared.
fn emit_offset_carry(stream: &mut OpCodeStream, offset: i8) {
    emit_load_unbiased_sp(stream, RESULT);
    stream.push_opcode(
        Add::new(RESULT)
            .with_immediate(Immediate::new(offset as u8 as i64))
            .with_op_size(OpSize::Byte)
            .generate(),
    );
    flags::emit_capture(stream);
}

/// LD HL, SP+e
pub fn emit_load_hl_from_stack_offset(stream: &mut OpCodeStream, offset: i8) {
    if offset == 0 {
        registers::emit_load_16(stream, Reg16::SP, HL);
        flags::emit_clear(stream);
        return;
    }

    emit_offset_carry(stream, offset);
    emit_load_unbiased_sp(stream, OPERAND);
    stream.push_opcode(
        Lea::new(
            OPERAND,
            Memory::base(OPERAND).with_displacement(offset as i32),
        )
        .with_op_size(OpSize::Dword)
        .generate(),
    );
    registers::emit_store_16(stream, Reg16::HL, OPERAND);
    flags::emit_commit(stream, FlagRule::CarryClearZero);
}

/// ADD SP, e
pub fn emit_add_stack_pointer(stream: &mut OpCodeStream, offset: i8) {
    if offset == 0 {
        flags::emit_clear(stream);
        return;
    }

    emit_offset_carry(stream, offset);
    stream.push_opcode(
        Add::new(STACK_POINTER)
            .with_immediate(Immediate::new(offset as i64))
            .with_op_size(OpSize::Word)
            .generate(),
    );
    flags::emit_commit(stream, FlagRule::CarryClearZero);
}

/// LD SP, HL
pub fn emit_load_stack_pointer_from_hl(stream: &mut OpCodeStream, bridge: &Bridge) {
    registers::emit_rebias_stack_pointer(stream, bridge.window_base(), HL);
}

/// LD SP, nn
pub fn emit_load_stack_pointer(stream: &mut OpCodeStream, bridge: &Bridge, value: u16) {
    stream.push_opcode(
        Mov::new(STACK_POINTER)
            .with_immediate(Immediate::new((bridge.window_base() | value as u64) as i64))
            .generate(),
    );
}

/// LD (nn), SP
pub fn emit_store_stack_pointer(stream: &mut OpCodeStream, bridge: &Bridge, address: u16) {
    emit_load_unbiased_sp(stream, VALUE);
    emit_write_16(stream, bridge, GuestAddress::Constant(address));
}
